//! Storage subsystem: pools, volumes, drivers, and the glue that keeps the
//! catalog and the on-disk layout consistent with each other.

pub mod cache;
pub mod driver;
pub mod error;
pub mod migration;
pub mod paths;
pub mod pool_manager;
pub mod volume_manager;

pub use cache::DriverCache;
pub use error::StorageError;
pub use pool_manager::PoolManager;
pub use volume_manager::VolumeManager;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between a parent volume name and a snapshot name in the flat,
/// on-disk form. Forbidden in user-supplied volume names.
pub const SNAPSHOT_DELIMITER: char = '/';

/// The kind of a storage volume. Stored in the catalog as its string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeKind {
    Container,
    Image,
    Custom,
    ContainerSnapshot,
    CustomSnapshot,
}

impl VolumeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Container => "container",
            VolumeKind::Image => "image",
            VolumeKind::Custom => "custom",
            VolumeKind::ContainerSnapshot => "container-snapshot",
            VolumeKind::CustomSnapshot => "custom-snapshot",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "container" => Ok(VolumeKind::Container),
            "image" => Ok(VolumeKind::Image),
            "custom" => Ok(VolumeKind::Custom),
            "container-snapshot" => Ok(VolumeKind::ContainerSnapshot),
            "custom-snapshot" => Ok(VolumeKind::CustomSnapshot),
            other => Err(StorageError::Validation(format!(
                "Invalid storage volume kind: {}",
                other
            ))),
        }
    }

    /// Directory name under the pool mount root holding volumes of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            VolumeKind::Container => "containers",
            VolumeKind::Image => "images",
            VolumeKind::Custom => "custom",
            VolumeKind::ContainerSnapshot => "containers-snapshots",
            VolumeKind::CustomSnapshot => "custom-snapshots",
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(
            self,
            VolumeKind::ContainerSnapshot | VolumeKind::CustomSnapshot
        )
    }

    /// The snapshot kind corresponding to this volume kind, if any.
    pub fn snapshot_kind(&self) -> Option<VolumeKind> {
        match self {
            VolumeKind::Container => Some(VolumeKind::ContainerSnapshot),
            VolumeKind::Custom => Some(VolumeKind::CustomSnapshot),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parent/snapshot pair. The flat `parent/snapshot` form survives only in
/// on-disk paths; everywhere else the relation is carried as this typed pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotName {
    pub parent: String,
    pub snapshot: String,
}

impl SnapshotName {
    pub fn new(parent: impl Into<String>, snapshot: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            snapshot: snapshot.into(),
        }
    }

    /// Splits a flat `parent/snapshot` name. Returns None for plain names.
    pub fn parse(full: &str) -> Option<Self> {
        let (parent, snapshot) = full.split_once(SNAPSHOT_DELIMITER)?;
        if parent.is_empty() || snapshot.is_empty() {
            return None;
        }
        Some(Self::new(parent, snapshot))
    }

    /// The flat form, used in on-disk paths and the catalog name column.
    pub fn flat(&self) -> String {
        format!("{}{}{}", self.parent, SNAPSHOT_DELIMITER, self.snapshot)
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.flat())
    }
}

/// Validates a user-supplied volume or pool name.
pub fn validate_object_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() {
        return Err(StorageError::Validation("Name must not be empty".into()));
    }
    if name.len() > 255 {
        return Err(StorageError::Validation(
            "Name must not exceed 255 characters".into(),
        ));
    }
    if name == "." || name == ".." {
        return Err(StorageError::Validation(format!(
            "Invalid name: {:?}",
            name
        )));
    }
    if name.contains(SNAPSHOT_DELIMITER) {
        return Err(StorageError::Validation(format!(
            "Name must not contain {:?}",
            SNAPSHOT_DELIMITER
        )));
    }
    if name.starts_with('-') || name.contains(char::is_whitespace) {
        return Err(StorageError::Validation(format!(
            "Invalid name: {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_kind_round_trips_through_tag() {
        for kind in [
            VolumeKind::Container,
            VolumeKind::Image,
            VolumeKind::Custom,
            VolumeKind::ContainerSnapshot,
            VolumeKind::CustomSnapshot,
        ] {
            assert_eq!(VolumeKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(VolumeKind::from_str("tarball").is_err());
    }

    #[test]
    fn snapshot_name_parses_flat_form() {
        let snap = SnapshotName::parse("web1/before-upgrade").unwrap();
        assert_eq!(snap.parent, "web1");
        assert_eq!(snap.snapshot, "before-upgrade");
        assert_eq!(snap.flat(), "web1/before-upgrade");

        assert!(SnapshotName::parse("web1").is_none());
        assert!(SnapshotName::parse("/web1").is_none());
        assert!(SnapshotName::parse("web1/").is_none());
    }

    #[test]
    fn object_names_reject_delimiter_and_junk() {
        assert!(validate_object_name("web1").is_ok());
        assert!(validate_object_name("a/b").is_err());
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("..").is_err());
        assert!(validate_object_name("has space").is_err());
        assert!(validate_object_name("-dash").is_err());
    }
}
