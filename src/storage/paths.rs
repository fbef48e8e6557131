//! On-disk layout of the daemon data directory and the filesystem helpers the
//! upgrade patches lean on.
//!
//! Post-upgrade layout:
//!   <root>/storage-pools/<pool>/containers/<name>
//!   <root>/storage-pools/<pool>/containers-snapshots/<parent>/<snap>
//!   <root>/storage-pools/<pool>/images/<fingerprint>
//!   <root>/storage-pools/<pool>/custom/<name>
//!
//! Legacy symlinks at <root>/containers/<name> and <root>/snapshots/<parent>
//! keep pre-upgrade external references resolving.

use crate::storage::{StorageError, VolumeKind};
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn storage_pools_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("storage-pools")
}

pub fn pool_mount_root(data_dir: &Path, pool: &str) -> PathBuf {
    storage_pools_dir(data_dir).join(pool)
}

pub fn volume_path(data_dir: &Path, pool: &str, kind: VolumeKind, name: &str) -> PathBuf {
    pool_mount_root(data_dir, pool).join(kind.dir_name()).join(name)
}

pub fn snapshot_dir(data_dir: &Path, pool: &str, kind: VolumeKind, parent: &str) -> PathBuf {
    pool_mount_root(data_dir, pool).join(kind.dir_name()).join(parent)
}

pub fn legacy_containers_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("containers")
}

pub fn legacy_container_path(data_dir: &Path, name: &str) -> PathBuf {
    legacy_containers_dir(data_dir).join(name)
}

pub fn legacy_snapshots_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("snapshots")
}

pub fn legacy_snapshot_parent_path(data_dir: &Path, parent: &str) -> PathBuf {
    legacy_snapshots_dir(data_dir).join(parent)
}

pub fn legacy_images_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("images")
}

/// Moves `src` to `dst`, preferring a plain rename. Falls back to
/// copy-then-delete when the rename crosses filesystems or the destination
/// already partially exists from an interrupted earlier run.
pub fn rename_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        // Already moved by a previous run.
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    if !dst.exists() {
        match fs::rename(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {}
            Err(e) => {
                log::warn!(
                    "Rename of {} to {} failed ({}), falling back to copy",
                    src.display(),
                    dst.display(),
                    e
                );
            }
        }
    }

    copy_tree(src, dst)?;
    remove_tree(src)?;
    Ok(())
}

fn libc_exdev() -> i32 {
    // EXDEV on every Unix the daemon targets.
    18
}

/// Recursively copies a file or directory. Existing destination entries are
/// overwritten, which makes resuming a half-finished copy safe.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)
        .with_context(|| format!("Failed to stat {}", src.display()))?;

    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        let _ = fs::remove_file(dst);
        std::os::unix::fs::symlink(&target, dst)
            .with_context(|| format!("Failed to link {}", dst.display()))?;
    } else if meta.is_dir() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create {}", dst.display()))?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// Ensures `link` is a symlink pointing at `target`. An existing link that
/// already points there is left untouched; a wrong one is replaced. A real
/// file or directory at `link` is an error, never silently destroyed.
pub fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link)? == target {
                return Ok(());
            }
            fs::remove_file(link)?;
        }
        Ok(_) => {
            anyhow::bail!(
                "Refusing to replace non-symlink {} with a symlink",
                link.display()
            );
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", link.display())),
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("Failed to link {} -> {}", link.display(), target.display()))
}

/// Removes dangling symlinks directly under `dir`.
pub fn prune_dangling_symlinks(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if fs::symlink_metadata(&path)?.file_type().is_symlink() && fs::metadata(&path).is_err() {
            log::info!("Removing dangling symlink {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Names of the plain subdirectories (not symlinks) under `dir`.
pub fn subdirectory_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Names of the plain files directly under `dir`.
pub fn file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        if fs::symlink_metadata(entry.path())?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Filesystem type backing `path`, resolved against /proc/self/mounts by
/// longest mount-point prefix.
pub fn filesystem_detect(path: &Path) -> Result<String, StorageError> {
    let mounts = fs::read_to_string("/proc/self/mounts")
        .map_err(|e| StorageError::Driver(format!("Failed to read mount table: {}", e)))?;
    let target = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());

    let mut best: Option<(usize, String)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let mount_path = Path::new(mount);
        if target.starts_with(mount_path) {
            let depth = mount_path.components().count();
            if best.as_ref().map(|(d, _)| depth >= *d).unwrap_or(true) {
                best = Some((depth, fstype.to_string()));
            }
        }
    }

    best.map(|(_, fstype)| fstype)
        .ok_or_else(|| StorageError::Driver(format!("No mount found for {}", target.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_paths_compose() {
        let root = Path::new("/var/lib/vessel");
        assert_eq!(
            volume_path(root, "p1", VolumeKind::Container, "web1"),
            PathBuf::from("/var/lib/vessel/storage-pools/p1/containers/web1")
        );
        assert_eq!(
            snapshot_dir(root, "p1", VolumeKind::ContainerSnapshot, "web1"),
            PathBuf::from("/var/lib/vessel/storage-pools/p1/containers-snapshots/web1")
        );
        assert_eq!(
            legacy_container_path(root, "web1"),
            PathBuf::from("/var/lib/vessel/containers/web1")
        );
    }

    #[test]
    fn rename_or_copy_is_idempotent() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("nested/dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("rootfs"), b"data").unwrap();

        rename_or_copy(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("rootfs")).unwrap(), b"data");

        // Re-running after the source vanished must be a no-op.
        rename_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("rootfs")).unwrap(), b"data");
    }

    #[test]
    fn rename_or_copy_merges_into_partial_destination() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a"), b"new").unwrap();
        fs::write(src.join("b"), b"b").unwrap();
        // Simulate an interrupted earlier copy.
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("a"), b"stale").unwrap();

        rename_or_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("a")).unwrap(), b"new");
        assert_eq!(fs::read(dst.join("b")).unwrap(), b"b");
        assert!(!src.exists());
    }

    #[test]
    fn ensure_symlink_converges_and_refuses_real_files() {
        let dir = tempdir().unwrap();
        let target_a = dir.path().join("a");
        let target_b = dir.path().join("b");
        let link = dir.path().join("link");
        fs::create_dir_all(&target_a).unwrap();
        fs::create_dir_all(&target_b).unwrap();

        ensure_symlink(&target_a, &link).unwrap();
        ensure_symlink(&target_a, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target_a);

        ensure_symlink(&target_b, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target_b);

        let real = dir.path().join("real");
        fs::write(&real, b"x").unwrap();
        assert!(ensure_symlink(&target_a, &real).is_err());
        assert_eq!(fs::read(&real).unwrap(), b"x");
    }
}
