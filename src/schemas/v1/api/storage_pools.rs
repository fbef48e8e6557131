use crate::schemas::v1::api::failure;
use crate::storage::PoolManager;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, patch, post, put, State};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePoolRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// List storage pools. `recursion=0` returns URLs, anything above returns
/// full records.
#[get("/storage-pools?<recursion>")]
pub async fn list_pools(
    pools: &State<Arc<PoolManager>>,
    recursion: Option<u8>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    if recursion.unwrap_or(0) == 0 {
        let names = pools.list_names().await.map_err(failure)?;
        let urls: Vec<String> = names
            .iter()
            .map(|n| format!("/v1/storage-pools/{}", n))
            .collect();
        return Ok(Json(json!({ "storage_pools": urls })));
    }

    let views = pools.list().await.map_err(failure)?;
    Ok(Json(json!({ "storage_pools": views })))
}

#[get("/storage-pools/<name>")]
pub async fn get_pool(
    pools: &State<Arc<PoolManager>>,
    name: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let view = pools.get(name).await.map_err(failure)?;
    Ok(Json(json!({ "storage_pool": view })))
}

#[post("/storage-pools", format = "json", data = "<request>")]
pub async fn create_pool(
    pools: &State<Arc<PoolManager>>,
    request: Json<CreatePoolRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let request = request.into_inner();
    pools
        .create(&request.name, &request.driver, &request.description, request.config)
        .await
        .map_err(failure)?;
    Ok(Status::Created)
}

/// Full replace of description and config.
#[put("/storage-pools/<name>", format = "json", data = "<request>")]
pub async fn update_pool(
    pools: &State<Arc<PoolManager>>,
    name: &str,
    request: Json<UpdatePoolRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let request = request.into_inner();
    pools
        .update(name, &request.description, request.config)
        .await
        .map_err(failure)?;
    Ok(Status::NoContent)
}

/// Merge patch: supplied config keys overlay the stored ones.
#[patch("/storage-pools/<name>", format = "json", data = "<request>")]
pub async fn patch_pool(
    pools: &State<Arc<PoolManager>>,
    name: &str,
    request: Json<UpdatePoolRequest>,
) -> Result<Status, (Status, Json<Value>)> {
    let current = pools.get(name).await.map_err(failure)?;
    let request = request.into_inner();

    let mut config = current.config;
    config.extend(request.config);
    let description = if request.description.is_empty() {
        current.description
    } else {
        request.description
    };

    pools.update(name, &description, config).await.map_err(failure)?;
    Ok(Status::NoContent)
}

#[delete("/storage-pools/<name>")]
pub async fn delete_pool(
    pools: &State<Arc<PoolManager>>,
    name: &str,
) -> Result<Status, (Status, Json<Value>)> {
    pools.delete(name).await.map_err(failure)?;
    Ok(Status::NoContent)
}
