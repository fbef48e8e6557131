use crate::schemas::v1::db::queries;
use crate::schemas::v1::models::node::OFFLINE_ADDRESS;
use crate::state::SharedState;
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: Arc<str>,
    pub address: Arc<str>,
    pub port: u16,
}

impl NodeInfo {
    pub fn is_offline(&self) -> bool {
        self.address.as_ref() == OFFLINE_ADDRESS
    }
}

/// In-memory membership registry, mirrored into the catalog `nodes` table so
/// the fan-out's clustered read sees the same view.
#[derive(Debug)]
pub struct ClusterManager {
    pub state: Arc<RwLock<SharedState>>,
    pub nodes: Arc<RwLock<HashMap<Arc<str>, NodeInfo>>>,
    db: Pool<Sqlite>,
}

impl ClusterManager {
    pub fn new(state: Arc<RwLock<SharedState>>, db: Pool<Sqlite>) -> Self {
        Self {
            state,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            db,
        }
    }

    pub async fn register_node(&self, node: NodeInfo) -> anyhow::Result<()> {
        let key = node.name.clone();
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(&key) {
                return Ok(());
            }
            info!("Registering cluster node {} at {}:{}", node.name, node.address, node.port);
            nodes.insert(key.clone(), node.clone());
        }

        queries::node::node_ensure(&self.db, &node.name, &format!("{}:{}", node.address, node.port))
            .await?;

        let size = self.nodes.read().await.len() + 1;
        self.state.write().await.cluster_size = size;
        Ok(())
    }

    pub async fn remove_node(&self, name: &str) -> anyhow::Result<()> {
        {
            let mut nodes = self.nodes.write().await;
            if nodes.remove(name).is_none() {
                return Ok(());
            }
        }
        info!("Marking cluster node {} offline", name);
        queries::node::node_mark_offline(&self.db, name).await?;

        let size = self.nodes.read().await.len() + 1;
        self.state.write().await.cluster_size = size;
        Ok(())
    }

    pub async fn get_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<NodeInfo> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn is_node_alive(&self, name: &str) -> bool {
        self.nodes.read().await.contains_key(name)
    }
}
