use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

mod api_models;
mod cluster;
mod config;
mod cors;
mod db_manager;
mod endpoints;
mod instances;
mod logging;
mod patches;
mod schemas;
mod server;
mod state;
mod storage;

use cluster::{ClusterManager, NodeInfo};
use db_manager::DatabaseManager;
use instances::{CatalogRuntime, InstanceRuntime};
use state::SharedState;
use storage::{DriverCache, PoolManager, VolumeManager};

#[rocket::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    logging::print_banner("VESSEL DAEMON", |s| s.bright_green());

    let server_config = config::SERVER_CONFIG.clone();
    let data_dir = PathBuf::from(&server_config.data_dir);
    let node_name = server_config.node_name.clone();

    // Catalog: open, create, and walk the schema ladder before anything else
    // touches it.
    let db_manager = Arc::new(DatabaseManager::new(&data_dir).await?);
    let pool = db_manager.get_pool().clone();

    schemas::v1::db::queries::node::node_ensure(
        &pool,
        &node_name,
        &format!("{}:{}", server_config.address, server_config.port),
    )
    .await?;

    // Data patches run strictly before the HTTP listener opens. A failed
    // patch refuses to serve: the operator sees the patch name in the last
    // log line.
    let patch_ctx = patches::PatchContext {
        db: pool.clone(),
        data_dir: data_dir.clone(),
        node_name: node_name.clone(),
    };
    if let Err(err) = patches::apply_all(&patch_ctx).await {
        log::error!("{}", format!("{}", err).red());
        std::process::exit(1);
    }

    // Storage managers share one driver cache, seeded from the catalog.
    let driver_cache = Arc::new(DriverCache::new());
    let pool_manager = Arc::new(PoolManager::new(
        pool.clone(),
        &data_dir,
        driver_cache.clone(),
    ));
    pool_manager.init().await?;

    let runtime: Arc<dyn InstanceRuntime> =
        Arc::new(CatalogRuntime::new(pool.clone(), node_name.clone()));
    let volume_manager = Arc::new(VolumeManager::new(
        pool.clone(),
        &data_dir,
        runtime.clone(),
    ));

    // Cluster state and peers.
    let shared_state = Arc::new(RwLock::new(SharedState::new(Uuid::new_v4(), &node_name)));
    let cluster_manager = Arc::new(RwLock::new(ClusterManager::new(
        shared_state.clone(),
        pool.clone(),
    )));
    for peer in &server_config.instances {
        cluster_manager
            .read()
            .await
            .register_node(NodeInfo {
                name: format!("{}:{}", peer.address, peer.port).into(),
                address: peer.address.clone().into(),
                port: peer.port,
            })
            .await?;
    }

    // Node-to-node client. Cluster members authenticate with their own CA;
    // certificate issuance lives outside this daemon.
    let http_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;

    let rocket = server::build_rocket(
        server_config.port,
        db_manager,
        pool,
        pool_manager,
        volume_manager,
        runtime,
        http_client,
        cluster_manager,
        shared_state,
    );

    let _ = rocket.launch().await?;
    Ok(())
}
