use crate::schemas::v1::api::failure;
use crate::storage::driver::VolumeSpec;
use crate::storage::migration::{migration_secret, run_sink_accepted, MigrationMode, MigrationSink};
use crate::storage::{StorageError, VolumeKind, VolumeManager};
use log::warn;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, patch, post, put, State};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct VolumeSource {
    #[serde(rename = "type", default)]
    pub source_type: String, // enum: '', 'copy', 'migration'
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mode: String, // enum: 'push', 'pull' (migration only)
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub volume_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub source: Option<VolumeSource>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVolumeRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub pool: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub restore: String,
}

fn parse_kind(kind: &str) -> Result<VolumeKind, (Status, Json<Value>)> {
    VolumeKind::from_str(kind).map_err(failure)
}

#[get("/storage-pools/<pool>/volumes")]
pub async fn list_volumes(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let views = volumes.list(pool, &[]).await.map_err(failure)?;
    Ok(Json(json!({ "storage_volumes": views })))
}

#[get("/storage-pools/<pool>/volumes/<kind>", rank = 2)]
pub async fn list_volumes_by_kind(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let views = volumes.list(pool, &[kind]).await.map_err(failure)?;
    Ok(Json(json!({ "storage_volumes": views })))
}

/// Create a volume. `source.type` selects plain creation, a local copy, or a
/// migration; an invalid migration mode is rejected before any volume
/// exists.
#[post("/storage-pools/<pool>/volumes/<kind>", format = "json", data = "<request>")]
pub async fn create_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    request: Json<CreateVolumeRequest>,
) -> Result<(Status, Json<Value>), (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let request = request.into_inner();
    let source = request.source.clone().unwrap_or_default();

    match source.source_type.as_str() {
        "" => {
            volumes
                .create(pool, kind, &request.name, &request.description, request.config)
                .await
                .map_err(failure)?;
            Ok((Status::Created, Json(json!({}))))
        }
        "copy" => {
            if source.name.is_empty() {
                return Err(failure(StorageError::Validation(
                    "Copy requires source.name".into(),
                )));
            }
            volumes
                .copy(pool, kind, &source.name, &request.name)
                .await
                .map_err(failure)?;
            Ok((Status::Created, Json(json!({}))))
        }
        "migration" => {
            // Mode validation comes first: a bad mode must not create the
            // target volume.
            let mode = MigrationMode::parse(&source.mode).map_err(failure)?;
            match mode {
                MigrationMode::Pull => {
                    pull_migration(volumes, pool, kind, &request, &source).await
                }
                MigrationMode::Push => {
                    push_migration(volumes, pool, kind, &request, &source).await
                }
            }
        }
        other => Err(failure(StorageError::Validation(format!(
            "Invalid source type: {:?}",
            other
        )))),
    }
}

/// Pull mode: the sink connects out to the sender's operation URL and the
/// sender drives. Failure is terminal and removes the half-written volume,
/// so a subsequent GET reports NotFound.
async fn pull_migration(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: VolumeKind,
    request: &CreateVolumeRequest,
    source: &VolumeSource,
) -> Result<(Status, Json<Value>), (Status, Json<Value>)> {
    if source.operation.is_empty() {
        return Err(failure(StorageError::Validation(
            "Pull migration requires source.operation".into(),
        )));
    }

    volumes
        .create(pool, kind, &request.name, &request.description, request.config.clone())
        .await
        .map_err(failure)?;

    let (_, spec, _) = volumes.pool_context(pool).await.map_err(failure)?;
    let volume_path = VolumeSpec::new(kind, &request.name).path(&spec);

    let mut sink = MigrationSink::new(
        MigrationMode::Pull,
        &source.operation,
        &source.secret,
        source.volume_only,
    );
    if let Err(err) = sink.run(&volume_path).await {
        warn!("Migration into {}/{} failed: {}", pool, request.name, err);
        if let Err(cleanup) = volumes.delete(pool, kind, &request.name).await {
            warn!("Failed to clean up after migration: {}", cleanup);
        }
        return Err(failure(err));
    }
    Ok((Status::Created, Json(json!({}))))
}

/// Push mode: symmetric — the sender connects to us. The sink opens a
/// one-shot operation socket and hands its URL and secret back; the transfer
/// completes in the background, and a failed transfer garbage-collects the
/// volume.
async fn push_migration(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: VolumeKind,
    request: &CreateVolumeRequest,
    source: &VolumeSource,
) -> Result<(Status, Json<Value>), (Status, Json<Value>)> {
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .map_err(|e| failure(StorageError::Driver(format!("Failed to open operation socket: {}", e))))?;
    let port = listener
        .local_addr()
        .map_err(|e| failure(StorageError::Driver(e.to_string())))?
        .port();
    let secret = migration_secret();

    volumes
        .create(pool, kind, &request.name, &request.description, request.config.clone())
        .await
        .map_err(failure)?;

    let (_, spec, _) = volumes.pool_context(pool).await.map_err(failure)?;
    let volume_path = VolumeSpec::new(kind, &request.name).path(&spec);

    let manager: Arc<VolumeManager> = volumes.inner().clone();
    let pool_name = pool.to_string();
    let volume_name = request.name.to_string();
    let accepted_secret = secret.clone();
    let volume_only = source.volume_only;

    tokio::spawn(async move {
        let result = async {
            let (stream, _) = tokio::time::timeout(PUSH_ACCEPT_DEADLINE, listener.accept())
                .await
                .map_err(|_| StorageError::Driver("Sender never connected".into()))?
                .map_err(|e| StorageError::Driver(e.to_string()))?;
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(|e| StorageError::Driver(e.to_string()))?;
            run_sink_accepted(&mut ws, &volume_path, &accepted_secret, volume_only).await
        }
        .await;

        if let Err(err) = result {
            warn!("Push migration into {}/{} failed: {}", pool_name, volume_name, err);
            if let Err(cleanup) = manager.delete(&pool_name, kind, &volume_name).await {
                warn!("Failed to clean up after migration: {}", cleanup);
            }
        }
    });

    let operation = format!(
        "ws://{}:{}",
        crate::config::SERVER_CONFIG.address, port
    );
    Ok((
        Status::Accepted,
        Json(json!({
            "operation": operation,
            "secret": secret
        })),
    ))
}

const PUSH_ACCEPT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(300);

#[get("/storage-pools/<pool>/volumes/<kind>/<name>", rank = 2)]
pub async fn get_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let view = volumes.get(pool, kind, name).await.map_err(failure)?;
    Ok(Json(json!({ "storage_volume": view })))
}

#[put("/storage-pools/<pool>/volumes/<kind>/<name>", format = "json", data = "<request>")]
pub async fn update_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    request: Json<UpdateVolumeRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let request = request.into_inner();
    volumes
        .update(pool, kind, name, &request.description, request.config)
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}

#[patch("/storage-pools/<pool>/volumes/<kind>/<name>", format = "json", data = "<request>")]
pub async fn patch_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    request: Json<UpdateVolumeRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let current = volumes.get(pool, kind, name).await.map_err(failure)?;
    let request = request.into_inner();

    let mut config = current.config;
    config.extend(request.config);
    let description = if request.description.is_empty() {
        current.description
    } else {
        request.description
    };

    volumes
        .update(pool, kind, name, &description, config)
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}

/// Rename within the pool, or move to another pool when `pool` is given.
#[post(
    "/storage-pools/<pool>/volumes/<kind>/<name>",
    format = "json",
    data = "<request>",
    rank = 2
)]
pub async fn rename_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    request: Json<RenameVolumeRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let request = request.into_inner();
    volumes
        .rename(pool, kind, name, &request.name, request.pool.as_deref())
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}

#[delete("/storage-pools/<pool>/volumes/<kind>/<name>")]
pub async fn delete_volume(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    volumes.delete(pool, kind, name).await.map_err(failure)?;
    Ok(Status::NoContent)
}

#[get("/storage-pools/<pool>/volumes/<kind>/<name>/snapshots")]
pub async fn list_snapshots(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    let snapshot_kind = kind
        .snapshot_kind()
        .ok_or_else(|| failure(StorageError::Validation(format!("{} volumes have no snapshots", kind))))?;

    let all = volumes.list(pool, &[snapshot_kind]).await.map_err(failure)?;
    let prefix = format!("{}/", name);
    let snapshots: Vec<_> = all.into_iter().filter(|v| v.name.starts_with(&prefix)).collect();
    Ok(Json(json!({ "snapshots": snapshots })))
}

#[post(
    "/storage-pools/<pool>/volumes/<kind>/<name>/snapshots",
    format = "json",
    data = "<request>"
)]
pub async fn create_snapshot(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    request: Json<CreateSnapshotRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    volumes
        .snapshot_create(pool, kind, name, &request.name)
        .await
        .map_err(failure)?;
    Ok(Status::Created)
}

#[delete("/storage-pools/<pool>/volumes/<kind>/<name>/snapshots/<snapshot>")]
pub async fn delete_snapshot(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    snapshot: &str,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    volumes
        .snapshot_delete(pool, kind, name, snapshot)
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}

/// Restore a volume to one of its snapshots.
#[put(
    "/storage-pools/<pool>/volumes/<kind>/<name>/restore",
    format = "json",
    data = "<request>"
)]
pub async fn restore_snapshot(
    volumes: &State<Arc<VolumeManager>>,
    pool: &str,
    kind: &str,
    name: &str,
    request: Json<RestoreRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let kind = parse_kind(kind)?;
    volumes
        .restore(pool, kind, name, &request.restore)
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}
