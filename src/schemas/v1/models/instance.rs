use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Instance {
    pub id: i64,
    pub node_id: Option<i64>,
    pub name: String,
    pub kind: String, // enum: 'container', 'virtual-machine'
    pub project: String,
    pub status: String, // enum: 'running', 'stopped', 'frozen', 'error'
    pub created_at: DateTime<Utc>,
}

/// One instance joined with the node it is scheduled on. The fan-out uses the
/// node address to decide local vs remote vs offline handling.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstancePlacement {
    pub name: String,
    pub kind: String,
    pub project: String,
    pub status: String,
    pub node_name: Option<String>,
    pub node_address: Option<String>,
}

/// Wire representation of an instance in listing replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub project: String,
    pub status: String,
    pub status_code: i64,
    pub location: String,
}

impl InstanceRecord {
    pub const STATUS_CODE_RUNNING: i64 = 103;
    pub const STATUS_CODE_STOPPED: i64 = 102;
    pub const STATUS_CODE_ERROR: i64 = 400;

    pub fn status_code_for(status: &str) -> i64 {
        match status {
            "running" => Self::STATUS_CODE_RUNNING,
            "error" => Self::STATUS_CODE_ERROR,
            _ => Self::STATUS_CODE_STOPPED,
        }
    }

    /// Placeholder emitted for instances on a node the cluster marked
    /// unavailable.
    pub fn unavailable(name: &str, kind: &str, project: &str, location: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            project: project.to_string(),
            status: "Error".to_string(),
            status_code: Self::STATUS_CODE_ERROR,
            location: location.to_string(),
        }
    }
}
