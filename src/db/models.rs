// db/models.rs - Entity models with invariant validation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Priority {
    Urgent,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Archived,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Todo
    }
}

/// Task recurrence rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Default for Recurrence {
    fn default() -> Self {
        Recurrence::None
    }
}

/// Task entity
///
/// Timestamps are stored as RFC-3339 UTC strings so that payload snapshots
/// round-trip byte-for-byte through the outbox and backup documents.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub project_id: Option<String>,
    pub priority: Priority,
    pub is_important: bool,
    pub status: TaskStatus,
    pub due_at: Option<String>,
    pub remind_at: Option<String>,
    pub recurrence: Recurrence,
    pub created_at: String,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
}

impl Task {
    /// Validate the task invariants.
    ///
    /// Referential checks (project existence) need a database snapshot and
    /// live in the mutation API and the incoming applier.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation("Task title cannot be empty".to_string()));
        }

        if self.recurrence != Recurrence::None && self.due_at.is_none() {
            return Err(Error::Validation(
                "Recurring tasks require a due date".to_string(),
            ));
        }

        if let (Some(remind_at), Some(due_at)) = (&self.remind_at, &self.due_at) {
            let remind = parse_timestamp(remind_at)?;
            let due = parse_timestamp(due_at)?;
            if remind > due {
                return Err(Error::Validation(
                    "Reminder cannot be after the due date".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Project entity
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
}

impl Project {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation(
                "Project name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Subtask entity, owned by a task
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subtask {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub is_done: bool,
    pub sort_order: i64,
    pub created_at: String,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
}

impl Subtask {
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Validation(
                "Subtask title cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reusable task template
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskTemplate {
    pub id: String,
    pub name: String,
    pub task_title: String,
    pub task_notes: Option<String>,
    pub task_priority: Priority,
    pub created_at: String,
    pub updated_at: String,
    pub updated_by_device: String,
    pub sync_version: i64,
}

impl TaskTemplate {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation(
                "Template name cannot be empty".to_string(),
            ));
        }
        if self.task_title.trim().is_empty() {
            return Err(Error::Validation(
                "Template task title cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Current time as the canonical RFC-3339 UTC string used at rest
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a stored RFC-3339 timestamp
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task {
            id: "t1".to_string(),
            title: "Write report".to_string(),
            description: None,
            notes: None,
            project_id: None,
            priority: Priority::Normal,
            is_important: false,
            status: TaskStatus::Todo,
            due_at: None,
            remind_at: None,
            recurrence: Recurrence::None,
            created_at: "2026-02-17T14:00:00Z".to_string(),
            updated_at: "2026-02-17T14:00:00Z".to_string(),
            updated_by_device: "device-a".to_string(),
            sync_version: 1,
        }
    }

    #[test]
    fn test_task_title_required() {
        let mut task = sample_task();
        task.title = "   ".to_string();
        assert!(matches!(task.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_recurrence_requires_due_date() {
        let mut task = sample_task();
        task.recurrence = Recurrence::Weekly;
        assert!(task.validate().is_err());

        task.due_at = Some("2026-03-01T09:00:00Z".to_string());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_remind_at_must_not_exceed_due_at() {
        let mut task = sample_task();
        task.due_at = Some("2026-03-01T09:00:00Z".to_string());
        task.remind_at = Some("2026-03-01T10:00:00Z".to_string());
        assert!(task.validate().is_err());

        task.remind_at = Some("2026-03-01T08:00:00Z".to_string());
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_priority_serializes_uppercase() {
        let json = serde_json::to_string(&Priority::Urgent).unwrap();
        assert_eq!(json, "\"URGENT\"");

        let status: TaskStatus = serde_json::from_str("\"ARCHIVED\"").unwrap();
        assert_eq!(status, TaskStatus::Archived);
    }
}
