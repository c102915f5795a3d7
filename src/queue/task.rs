#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Waiting,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Allowed state-machine transitions. `done` is terminal.
#[must_use]
pub fn valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::{Cancelled, Done, Failed, Pending, Running, Waiting};
    matches!(
        (from, to),
        (Pending, Running | Cancelled)
            | (Running, Done | Failed | Waiting | Cancelled)
            | (Waiting, Running | Cancelled)
            | (Failed, Pending | Cancelled)
            | (Cancelled, Pending)
    )
}

/// A unit of work, authored by the user as YAML. Read-only to the system
/// after creation; runtime state lives in [`TaskState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub priority: i64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_permissions: bool,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_files: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_retries: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub estimated_tokens: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    /// Provenance (file path, `#docN`-suffixed for multi-document files).
    #[serde(skip)]
    pub source: String,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            priority: 0,
            created_at: None,
            working_dir: String::new(),
            skip_permissions: false,
            prompt: String::new(),
            context_files: Vec::new(),
            model: String::new(),
            max_retries: 0,
            estimated_tokens: 0,
            flags: Vec::new(),
            source: String::new(),
        }
    }
}

/// Mutable per-task runtime state. Written exclusively by the runner (or by a
/// direct CLI mutation while the runner lock is free) through the atomic
/// store. Absence on disk means implicit `pending`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt: i64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub started_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_rate_limited_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub resume_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt_hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git_commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// Bounded to the last 20 lines of child output; resume context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_ndjson_messages: Vec<String>,
}

impl TaskState {
    #[must_use]
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            status: TaskStatus::Pending,
            attempt: 0,
            started_at: None,
            ended_at: None,
            last_rate_limited_at: None,
            resume_at: None,
            prompt_hash: String::new(),
            git_commit: String::new(),
            session_id: String::new(),
            last_ndjson_messages: Vec::new(),
        }
    }
}

/// Immutable create-once record anchoring a task's identity and creation
/// time. Written with the hardlink discipline so concurrent first loads agree
/// on a single `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInit {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Waiting,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn transition_table_is_closed() {
        let allowed = [
            (TaskStatus::Pending, TaskStatus::Running),
            (TaskStatus::Pending, TaskStatus::Cancelled),
            (TaskStatus::Running, TaskStatus::Done),
            (TaskStatus::Running, TaskStatus::Failed),
            (TaskStatus::Running, TaskStatus::Waiting),
            (TaskStatus::Running, TaskStatus::Cancelled),
            (TaskStatus::Waiting, TaskStatus::Running),
            (TaskStatus::Waiting, TaskStatus::Cancelled),
            (TaskStatus::Failed, TaskStatus::Pending),
            (TaskStatus::Failed, TaskStatus::Cancelled),
            (TaskStatus::Cancelled, TaskStatus::Pending),
        ];

        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    valid_transition(from, to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn done_is_terminal() {
        for to in ALL {
            assert!(!valid_transition(TaskStatus::Done, to));
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let back: TaskStatus = serde_json::from_str("\"waiting\"").unwrap();
        assert_eq!(back, TaskStatus::Waiting);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut st = TaskState::pending("demo");
        st.status = TaskStatus::Waiting;
        st.attempt = 2;
        st.session_id = "sess-9".to_owned();
        st.resume_at = Some(OffsetDateTime::now_utc());
        st.last_ndjson_messages = vec!["{\"type\":\"assistant\"}".to_owned()];

        let json = serde_json::to_string_pretty(&st).unwrap();
        let back: TaskState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn task_yaml_ignores_unknown_fields() {
        let yaml = "id: demo\nprompt: hi\nworking_dir: /tmp\nwhatever_else: 42\n";
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.id, "demo");
    }
}
