use colored::Colorize;
use rocket::routes;
use rocket::{Build, Rocket};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cluster::ClusterManager;
use crate::cors::{cors_preflight, CORS};
use crate::db_manager::DatabaseManager;
use crate::endpoints::{cluster_status, health_check};
use crate::instances::InstanceRuntime;
use crate::schemas::v1::api;
use crate::state::SharedState;
use crate::storage::{PoolManager, VolumeManager};

pub trait RocketExt {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self;
}

impl RocketExt for Rocket<Build> {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self {
        let mut rocket = self;
        for (path, routes) in routes {
            log::info!("{}", format!("Mounting routes at {}", path).green());
            rocket = rocket.mount(path, routes);
        }
        rocket
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_rocket(
    port: u16,
    db_manager: Arc<DatabaseManager>,
    pool: Pool<Sqlite>,
    pool_manager: Arc<PoolManager>,
    volume_manager: Arc<VolumeManager>,
    runtime: Arc<dyn InstanceRuntime>,
    http_client: reqwest::Client,
    cluster_manager: Arc<RwLock<ClusterManager>>,
    shared_state: Arc<RwLock<SharedState>>,
) -> Rocket<Build> {
    crate::logging::print_banner("SERVER STARTUP", |s| s.bright_cyan());

    log::info!("{}", "Defining API routes".cyan());
    let routes = vec![
        ("/", routes![health_check, cluster_status, cors_preflight]),
        ("/v1", api::routes()),
    ];

    log::info!("{}", "Building Rocket instance".cyan());
    let rocket_instance = rocket::build()
        .configure(rocket::Config {
            port,
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            ..Default::default()
        })
        .manage(db_manager)
        .manage(pool)
        .manage(pool_manager)
        .manage(volume_manager)
        .manage(runtime)
        .manage(http_client)
        .manage(cluster_manager)
        .manage(shared_state)
        .attach(CORS);

    rocket_instance.mount_routes(routes)
}
