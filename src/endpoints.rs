//! Core operational endpoints: health and cluster status.

use crate::api_models::{ApiResponse, ClusterStatusMessage};
use crate::cluster::ClusterManager;
use crate::state::SharedState;
use rocket::get;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Basic availability probe for load balancers and monitoring.
#[get("/health")]
pub async fn health_check() -> rocket::serde::json::Json<ApiResponse> {
    log::debug!("Health check endpoint called");
    rocket::serde::json::Json(ApiResponse {
        status: "ok".to_string(),
        message: ClusterStatusMessage {
            node_roles: "unknown".to_string(),
            cluster_nodes: vec![],
        },
    })
}

/// Current node role plus known cluster membership.
#[get("/cluster/status")]
pub async fn cluster_status(
    state: &rocket::State<Arc<RwLock<SharedState>>>,
    cluster: &rocket::State<Arc<RwLock<ClusterManager>>>,
) -> rocket::serde::json::Json<ApiResponse> {
    let state = state.read().await;
    let cluster = cluster.read().await;

    let role = if state.is_leader {
        "leader".to_string()
    } else {
        "follower".to_string()
    };

    rocket::serde::json::Json(ApiResponse {
        status: "ok".to_string(),
        message: ClusterStatusMessage {
            node_roles: role,
            cluster_nodes: cluster.get_nodes().await,
        },
    })
}
