//! V1 API route registration.
//!
//! Each module owns the handlers for one resource family; `routes()`
//! aggregates them for mounting in `server.rs`.

use rocket::http::Status;
use rocket::routes;
use rocket::serde::json::{json, Json, Value};

pub mod instances;
pub mod storage_pools;
pub mod storage_volumes;

use crate::storage::StorageError;

/// Maps a core error to the HTTP reply shape every handler uses.
pub fn failure(err: StorageError) -> (Status, Json<Value>) {
    (
        err.status(),
        Json(json!({
            "error": err.to_string()
        })),
    )
}

pub fn routes() -> Vec<rocket::Route> {
    routes![
        // storage pools
        storage_pools::list_pools,
        storage_pools::get_pool,
        storage_pools::create_pool,
        storage_pools::update_pool,
        storage_pools::patch_pool,
        storage_pools::delete_pool,
        // storage volumes
        storage_volumes::list_volumes,
        storage_volumes::list_volumes_by_kind,
        storage_volumes::create_volume,
        storage_volumes::get_volume,
        storage_volumes::update_volume,
        storage_volumes::patch_volume,
        storage_volumes::rename_volume,
        storage_volumes::delete_volume,
        storage_volumes::list_snapshots,
        storage_volumes::create_snapshot,
        storage_volumes::delete_snapshot,
        storage_volumes::restore_snapshot,
        // instances
        instances::list_instances,
    ]
}
