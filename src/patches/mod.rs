//! Boot-time patch engine.
//!
//! Patches are an ordered, append-only sequence of named one-shot data
//! migrations, applied at most once each, strictly in declared order, after
//! the schema upgrade and before the HTTP listener opens. A patch's effects
//! are durable before its name is marked; an interrupted patch re-runs on
//! the next boot, so every patch body must be idempotent.
//!
//! Never remove or reorder an entry in [`PATCH_NAMES`]; only append.
//! (Schema-version-keyed updates live in `db_manager::migration` and are not
//! extensible; everything new goes here.)

mod refinements;
mod storage_api;

use crate::db_manager::retry::with_retry;
use crate::schemas::v1::db::queries;
use crate::storage::StorageError;
use log::info;
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;

/// Everything a patch body may touch.
pub struct PatchContext {
    pub db: Pool<Sqlite>,
    pub data_dir: PathBuf,
    pub node_name: String,
}

/// Declared patch order. Append-only.
pub const PATCH_NAMES: &[&str] = &[
    "storage_api",
    "storage_api_v1",
    "storage_api_dir_cleanup",
    "storage_api_lvm_keys",
    "storage_api_keys",
    "storage_api_update_storage_configs",
    "storage_api_vessel_on_btrfs",
    "storage_api_lvm_detect_lv_size",
    "storage_api_insert_zfs_driver",
    "storage_zfs_noauto",
    "storage_zfs_volume_size",
];

/// Applies every unapplied patch in declared order. A failure aborts the
/// boot; the failing patch name is in the error and is NOT marked applied,
/// so the next boot retries it.
pub async fn apply_all(ctx: &PatchContext) -> Result<(), StorageError> {
    let applied = with_retry(|| queries::patch::patches_applied(&ctx.db)).await?;

    for &name in PATCH_NAMES {
        if applied.contains(name) {
            continue;
        }
        info!("Applying patch {}", name);
        run_patch(name, ctx).await.map_err(|e| StorageError::Patch {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        with_retry(|| queries::patch::patch_mark_applied(&ctx.db, name)).await?;
        info!("✓ Patch {} applied", name);
    }

    Ok(())
}

async fn run_patch(name: &str, ctx: &PatchContext) -> Result<(), StorageError> {
    match name {
        "storage_api" => storage_api::patch_storage_api(ctx).await,
        "storage_api_v1" => refinements::patch_storage_api_v1(ctx).await,
        "storage_api_dir_cleanup" => refinements::patch_storage_api_dir_cleanup(ctx).await,
        "storage_api_lvm_keys" => refinements::patch_storage_api_lvm_keys(ctx).await,
        "storage_api_keys" => refinements::patch_storage_api_keys(ctx).await,
        "storage_api_update_storage_configs" => {
            refinements::patch_storage_api_update_storage_configs(ctx).await
        }
        "storage_api_vessel_on_btrfs" => refinements::patch_storage_api_vessel_on_btrfs(ctx).await,
        "storage_api_lvm_detect_lv_size" => {
            refinements::patch_storage_api_lvm_detect_lv_size(ctx).await
        }
        "storage_api_insert_zfs_driver" => {
            refinements::patch_storage_api_insert_zfs_driver(ctx).await
        }
        "storage_zfs_noauto" => refinements::patch_storage_zfs_noauto(ctx).await,
        "storage_zfs_volume_size" => refinements::patch_storage_zfs_volume_size(ctx).await,
        other => Err(StorageError::Patch {
            name: other.to_string(),
            reason: "Unknown patch name".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::DatabaseManager;
    use tempfile::tempdir;

    /// The declared order is load-bearing; this pins it so a reorder or
    /// removal fails loudly.
    #[test]
    fn patch_order_is_pinned() {
        assert_eq!(
            PATCH_NAMES,
            &[
                "storage_api",
                "storage_api_v1",
                "storage_api_dir_cleanup",
                "storage_api_lvm_keys",
                "storage_api_keys",
                "storage_api_update_storage_configs",
                "storage_api_vessel_on_btrfs",
                "storage_api_lvm_detect_lv_size",
                "storage_api_insert_zfs_driver",
                "storage_zfs_noauto",
                "storage_zfs_volume_size",
            ]
        );
    }

    #[test]
    fn patch_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for name in PATCH_NAMES {
            assert!(seen.insert(name), "duplicate patch name {}", name);
        }
    }

    #[tokio::test]
    async fn apply_all_marks_each_patch_once() {
        let db = DatabaseManager::new_in_memory().await.unwrap().get_pool().clone();
        let dir = tempdir().unwrap();
        let ctx = PatchContext {
            db: db.clone(),
            data_dir: dir.path().to_path_buf(),
            node_name: "local".to_string(),
        };

        apply_all(&ctx).await.unwrap();
        let applied = queries::patch::patches_applied(&db).await.unwrap();
        for name in PATCH_NAMES {
            assert!(applied.contains(*name), "{} not marked", name);
        }

        // A second boot finds everything applied and changes nothing.
        apply_all(&ctx).await.unwrap();
        assert_eq!(
            queries::patch::patches_applied(&db).await.unwrap().len(),
            PATCH_NAMES.len()
        );
    }
}
