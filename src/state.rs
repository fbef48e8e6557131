use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedState {
    pub node_id: Uuid,
    pub node_name: String,
    pub is_leader: bool,
    pub cluster_size: usize,
}

impl SharedState {
    pub fn new(node_id: Uuid, node_name: impl Into<String>) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            is_leader: false,
            cluster_size: 1,
        }
    }
}
