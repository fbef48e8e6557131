//! Boundary to the instance runtime. The daemon core never starts or stops
//! instances itself; it loads their state through this trait, which keeps the
//! runtime (and its process-spawning machinery) out of the storage core.

use crate::schemas::v1::db::queries;
use crate::schemas::v1::models::instance::InstanceRecord;
use crate::storage::StorageError;
use async_trait::async_trait;
use sqlx::{Pool, Sqlite};

#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Loads the current state of one local instance.
    async fn load_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<InstanceRecord, StorageError>;

    /// Whether the instance is currently running.
    async fn is_running(&self, project: &str, name: &str) -> bool;
}

/// Runtime view backed purely by the catalog's recorded status. Stands in for
/// the full runtime wherever only placement and status are needed.
pub struct CatalogRuntime {
    db: Pool<Sqlite>,
    node_name: String,
}

impl CatalogRuntime {
    pub fn new(db: Pool<Sqlite>, node_name: impl Into<String>) -> Self {
        Self {
            db,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl InstanceRuntime for CatalogRuntime {
    async fn load_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<InstanceRecord, StorageError> {
        let instance = queries::instance::instance_get(&self.db, project, name)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("Instance {}", name)))?;

        Ok(InstanceRecord {
            name: instance.name,
            kind: instance.kind,
            project: instance.project,
            status_code: InstanceRecord::status_code_for(&instance.status),
            status: instance.status,
            location: self.node_name.clone(),
        })
    }

    async fn is_running(&self, project: &str, name: &str) -> bool {
        queries::instance::instance_get(&self.db, project, name)
            .await
            .ok()
            .flatten()
            .map(|i| i.status == "running")
            .unwrap_or(false)
    }
}
