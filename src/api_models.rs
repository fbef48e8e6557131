use crate::cluster::NodeInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: ClusterStatusMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterStatusMessage {
    pub node_roles: String,
    pub cluster_nodes: Vec<NodeInfo>,
}
