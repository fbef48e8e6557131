use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct StoragePool {
    pub id: i64,
    pub name: String,
    pub driver: String, // enum: 'dir', 'btrfs', 'zfs', 'lvm', 'ceph'
    pub description: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct StorageVolume {
    pub id: i64,
    pub storage_pool_id: i64,
    pub kind: String, // enum: 'container', 'image', 'custom', 'container-snapshot', 'custom-snapshot'
    pub name: String,
    pub description: String,
}

/// Wire representation of a pool, config attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePoolView {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub used_by: Vec<String>,
}

/// Wire representation of a volume, config attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolumeView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub used_by: Vec<String>,
}
