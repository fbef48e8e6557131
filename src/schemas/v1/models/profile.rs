use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ProfileDevice {
    pub id: i64,
    pub profile_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub device_type: String, // enum: 'disk', 'nic', 'none'
}

/// A device with its config rows folded in.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub config: HashMap<String, String>,
}

impl Device {
    /// Whether this is a root disk device (`type=disk`, `path=/`).
    pub fn is_root_disk(&self) -> bool {
        self.device_type == "disk" && self.config.get("path").map(String::as_str) == Some("/")
    }
}
