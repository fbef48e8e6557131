//! Cluster-wide instance listing.
//!
//! One clustered read resolves instance → node placement; the local slice
//! loads through the runtime behind a small worker pool, every remote node
//! gets its own task with a hard wall-clock deadline, and nodes the cluster
//! marked unavailable degrade to placeholder records instead of failing the
//! whole reply.

use crate::instances::InstanceRuntime;
use crate::schemas::v1::db::queries;
use crate::schemas::v1::models::instance::{InstancePlacement, InstanceRecord};
use crate::schemas::v1::models::node::OFFLINE_ADDRESS;
use crate::storage::StorageError;
use log::warn;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;

/// Hard deadline for one remote node. A slow node delays the overall reply
/// by at most this bound plus local work.
pub const REMOTE_FANOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Local instances load through a bounded worker pool of this size.
pub const LOCAL_WORKER_POOL: usize = 4;

/// Header a cluster member sets when relaying a listing, so the receiving
/// node answers from local state only instead of fanning out again.
pub const CLUSTER_NOTIFY_HEADER: &str = "X-Vessel-Cluster-Notify";

#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub project: String,
    pub instance_kind: Option<String>,
    /// True when the caller is itself a cluster-internal notification;
    /// remote addresses are skipped entirely to prevent request storms.
    pub cluster_notification: bool,
}

/// Assembles the global instance list. The result is sorted by instance name
/// regardless of arrival order.
pub async fn list_instances(
    db: &Pool<Sqlite>,
    runtime: Arc<dyn InstanceRuntime>,
    local_node: &str,
    client: &reqwest::Client,
    request: &FanoutRequest,
) -> Result<Vec<InstanceRecord>, StorageError> {
    let placements = queries::instance::instance_placements(
        db,
        &request.project,
        request.instance_kind.as_deref(),
    )
    .await?;

    let mut local: Vec<InstancePlacement> = Vec::new();
    let mut offline: Vec<InstancePlacement> = Vec::new();
    let mut remote: HashMap<String, (String, Vec<InstancePlacement>)> = HashMap::new();

    for placement in placements {
        match (&placement.node_name, &placement.node_address) {
            (Some(node_name), Some(address)) if node_name != local_node => {
                if address == OFFLINE_ADDRESS {
                    offline.push(placement);
                } else {
                    remote
                        .entry(address.clone())
                        .or_insert_with(|| (node_name.clone(), Vec::new()))
                        .1
                        .push(placement);
                }
            }
            // Unplaced instances and the local node load locally.
            _ => local.push(placement),
        }
    }

    let results = Arc::new(Mutex::new(Vec::new()));

    // Unavailable nodes degrade to error placeholders with the known
    // location.
    {
        let mut guard = results.lock().await;
        for placement in &offline {
            guard.push(InstanceRecord::unavailable(
                &placement.name,
                &placement.kind,
                &placement.project,
                placement.node_name.as_deref().unwrap_or(""),
            ));
        }
    }

    let mut tasks = Vec::new();

    // Local slice: bounded worker pool, one instance at a time per worker.
    let semaphore = Arc::new(Semaphore::new(LOCAL_WORKER_POOL));
    for placement in local {
        let semaphore = semaphore.clone();
        let runtime = runtime.clone();
        let results = results.clone();
        let local_node = local_node.to_string();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            let record = match runtime
                .load_instance(&placement.project, &placement.name)
                .await
            {
                Ok(mut record) => {
                    if record.location.is_empty() {
                        record.location = local_node;
                    }
                    record
                }
                Err(err) => {
                    warn!("Failed to load instance {}: {}", placement.name, err);
                    InstanceRecord::unavailable(
                        &placement.name,
                        &placement.kind,
                        &placement.project,
                        &local_node,
                    )
                }
            };
            results.lock().await.push(record);
        }));
    }

    // Remote slices: one task per address, each under the hard deadline. A
    // deadline or transport error yields placeholders without aborting
    // peers.
    if !request.cluster_notification {
        for (address, (node_name, placements)) in remote {
            let client = client.clone();
            let results = results.clone();
            let request = request.clone();
            tasks.push(tokio::spawn(async move {
                let fetched = timeout(
                    REMOTE_FANOUT_TIMEOUT,
                    fetch_remote(&client, &address, &node_name, &request),
                )
                .await;

                let records = match fetched {
                    Ok(Ok(records)) => records,
                    Ok(Err(err)) => {
                        warn!("Failed to list instances on {}: {}", node_name, err);
                        degrade(&placements, &node_name)
                    }
                    Err(_) => {
                        warn!(
                            "Listing instances on {} exceeded {:?}",
                            node_name, REMOTE_FANOUT_TIMEOUT
                        );
                        degrade(&placements, &node_name)
                    }
                };
                results.lock().await.extend(records);
            }));
        }
    }

    for task in tasks {
        task.await
            .map_err(|e| StorageError::Driver(format!("Fan-out task panicked: {}", e)))?;
    }

    let mut records = Arc::try_unwrap(results)
        .map(|m| m.into_inner())
        .unwrap_or_default();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

fn degrade(placements: &[InstancePlacement], node_name: &str) -> Vec<InstanceRecord> {
    placements
        .iter()
        .map(|p| InstanceRecord::unavailable(&p.name, &p.kind, &p.project, node_name))
        .collect()
}

async fn fetch_remote(
    client: &reqwest::Client,
    address: &str,
    node_name: &str,
    request: &FanoutRequest,
) -> Result<Vec<InstanceRecord>, StorageError> {
    let mut url = format!(
        "https://{}/v1/instances?recursion=1&project={}",
        address, request.project
    );
    if let Some(kind) = &request.instance_kind {
        url.push_str(&format!("&instance-type={}", kind));
    }

    let response = client
        .get(&url)
        .header(CLUSTER_NOTIFY_HEADER, "1")
        .send()
        .await
        .map_err(|e| StorageError::Driver(format!("Request to {} failed: {}", address, e)))?;

    if !response.status().is_success() {
        return Err(StorageError::Driver(format!(
            "Node {} answered {}",
            node_name,
            response.status()
        )));
    }

    #[derive(serde::Deserialize)]
    struct Listing {
        instances: Vec<InstanceRecord>,
    }

    let listing: Listing = response
        .json()
        .await
        .map_err(|e| StorageError::Driver(format!("Invalid listing from {}: {}", node_name, e)))?;

    let mut records = listing.instances;
    for record in &mut records {
        if record.location.is_empty() {
            record.location = node_name.to_string();
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::DatabaseManager;
    use crate::instances::CatalogRuntime;

    async fn test_db() -> Pool<Sqlite> {
        DatabaseManager::new_in_memory().await.unwrap().get_pool().clone()
    }

    async fn seed(db: &Pool<Sqlite>, name: &str, status: &str, node_id: Option<i64>) {
        sqlx::query(
            "INSERT INTO instances (node_id, name, kind, project, status) VALUES (?, ?, 'container', 'default', ?)",
        )
        .bind(node_id)
        .bind(name)
        .bind(status)
        .execute(db)
        .await
        .unwrap();
    }

    fn request() -> FanoutRequest {
        FanoutRequest {
            project: "default".to_string(),
            instance_kind: None,
            cluster_notification: false,
        }
    }

    #[tokio::test]
    async fn local_listing_is_sorted_by_name() {
        let db = test_db().await;
        for name in ["zeta", "alpha", "mid"] {
            seed(&db, name, "running", None).await;
        }
        let runtime = Arc::new(CatalogRuntime::new(db.clone(), "local"));
        let client = reqwest::Client::new();

        let records = list_instances(&db, runtime, "local", &client, &request())
            .await
            .unwrap();

        assert_eq!(
            records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "mid", "zeta"]
        );
        assert!(records.iter().all(|r| r.location == "local"));
    }

    #[tokio::test]
    async fn offline_node_degrades_to_error_placeholders() {
        let db = test_db().await;
        let down = queries::node::node_ensure(&db, "C", OFFLINE_ADDRESS).await.unwrap();
        seed(&db, "c1", "running", Some(down)).await;
        seed(&db, "a1", "running", None).await;

        let runtime = Arc::new(CatalogRuntime::new(db.clone(), "local"));
        let client = reqwest::Client::new();
        let records = list_instances(&db, runtime, "local", &client, &request())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let c1 = records.iter().find(|r| r.name == "c1").unwrap();
        assert_eq!(c1.status_code, InstanceRecord::STATUS_CODE_ERROR);
        assert_eq!(c1.location, "C");

        let a1 = records.iter().find(|r| r.name == "a1").unwrap();
        assert_eq!(a1.status_code, InstanceRecord::STATUS_CODE_RUNNING);
    }

    #[tokio::test]
    async fn unreachable_remote_degrades_without_failing_the_reply() {
        let db = test_db().await;
        // Nothing listens on this port; the connection is refused instantly.
        let remote = queries::node::node_ensure(&db, "B", "127.0.0.1:1").await.unwrap();
        seed(&db, "b1", "running", Some(remote)).await;
        seed(&db, "a1", "stopped", None).await;

        let runtime = Arc::new(CatalogRuntime::new(db.clone(), "local"));
        let client = reqwest::Client::new();
        let records = list_instances(&db, runtime, "local", &client, &request())
            .await
            .unwrap();

        let b1 = records.iter().find(|r| r.name == "b1").unwrap();
        assert_eq!(b1.status, "Error");
        assert_eq!(b1.location, "B");
    }

    #[tokio::test]
    async fn cluster_notifications_skip_remote_nodes() {
        let db = test_db().await;
        let remote = queries::node::node_ensure(&db, "B", "127.0.0.1:1").await.unwrap();
        seed(&db, "b1", "running", Some(remote)).await;
        seed(&db, "a1", "running", None).await;

        let runtime = Arc::new(CatalogRuntime::new(db.clone(), "local"));
        let client = reqwest::Client::new();
        let mut notify = request();
        notify.cluster_notification = true;

        let records = list_instances(&db, runtime, "local", &client, &notify)
            .await
            .unwrap();

        assert_eq!(
            records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a1"]
        );
    }
}
