use crate::instances::fanout::{self, FanoutRequest, CLUSTER_NOTIFY_HEADER};
use crate::instances::InstanceRuntime;
use crate::schemas::v1::api::failure;
use crate::state::SharedState;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::{json, Json, Value};
use rocket::{get, FromForm, State};
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Query parameters for instance listing.
#[derive(FromForm, Default, Debug)]
pub struct InstanceListQuery {
    pub recursion: Option<u8>,
    pub project: Option<String>,
    #[field(name = "instance-type")]
    pub instance_type: Option<String>,
}

/// Marks a request relayed by another cluster member; such requests answer
/// from local state only.
pub struct ClusterNotification(pub bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClusterNotification {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(ClusterNotification(
            request.headers().get_one(CLUSTER_NOTIFY_HEADER).is_some(),
        ))
    }
}

/// Cluster-wide instance listing. `recursion=0` returns URLs; higher levels
/// return full records assembled by the fan-out.
#[get("/instances?<query..>")]
pub async fn list_instances(
    db: &State<Pool<Sqlite>>,
    runtime: &State<Arc<dyn InstanceRuntime>>,
    client: &State<reqwest::Client>,
    state: &State<Arc<RwLock<SharedState>>>,
    query: InstanceListQuery,
    notification: ClusterNotification,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let local_node = state.read().await.node_name.clone();

    let request = FanoutRequest {
        project: query.project.unwrap_or_else(|| "default".to_string()),
        instance_kind: query.instance_type,
        cluster_notification: notification.0,
    };

    let records = fanout::list_instances(
        db.inner(),
        runtime.inner().clone(),
        &local_node,
        client.inner(),
        &request,
    )
    .await
    .map_err(failure)?;

    if query.recursion.unwrap_or(0) == 0 {
        let urls: Vec<String> = records
            .iter()
            .map(|r| format!("/v1/instances/{}", r.name))
            .collect();
        return Ok(Json(json!({ "instances": urls })));
    }

    Ok(Json(json!({ "instances": records })))
}
