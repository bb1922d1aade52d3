//! ADD/COPY entry deployment.
//!
//! Each manifest entry carries its own absolute target path, so the
//! deployer never walks a source tree: a directory resource only creates
//! the directory, and its files arrive as sibling manifest entries.

use std::cmp::Reverse;
use std::fs::Permissions;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::unistd::chown;
use tokio::fs::{DirBuilder, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vmbuild_plan::{FileResource, ResolvedResource, ResourceManifest, TransferEntry, User, Workdir};

use crate::error::{BootstrapError, Result};
use crate::user::Identity;

/// Mode for parent directories created implicitly.
pub const DEFAULT_PARENT_MODE: u32 = 0o755;

/// Capability: materialize the resources of a transfer entry.
#[async_trait]
pub trait ResourceDeployer: Send + Sync {
    async fn deploy(&self, entry: &TransferEntry, manifest: &ResourceManifest) -> Result<()>;
}

/// Writes resources straight to the guest filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsResourceDeployer;

impl FsResourceDeployer {
    pub fn new() -> Self {
        Self
    }

    async fn write_file(&self, file: &FileResource, mode: u32, target: &Path) -> Result<()> {
        let parent = target.parent().ok_or_else(|| {
            BootstrapError::io(
                target,
                io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory"),
            )
        })?;
        self.create_dirs(parent).await?;

        let tmp_path = temp_path(target)?;
        let result = self.write_via_temp(file, mode, target, &tmp_path).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn write_via_temp(
        &self,
        file: &FileResource,
        mode: u32,
        target: &Path,
        tmp_path: &Path,
    ) -> Result<()> {
        let source_label = file
            .local_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&file.source_path));
        let mut reader = file
            .contents
            .open()
            .await
            .map_err(|e| BootstrapError::io(&source_label, e))?;

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(tmp_path)
            .await
            .map_err(|e| BootstrapError::io(tmp_path, e))?;

        let written = tokio::io::copy(&mut reader, &mut out)
            .await
            .map_err(|e| BootstrapError::io(target, e))?;
        out.flush().await.map_err(|e| BootstrapError::io(target, e))?;
        out.sync_all().await.map_err(|e| BootstrapError::io(target, e))?;
        drop(out);

        set_mode(tmp_path, mode).await?;
        set_owner(tmp_path, &file.user)?;

        tokio::fs::rename(tmp_path, target)
            .await
            .map_err(|e| BootstrapError::io(target, e))?;

        debug!(
            source = %source_label.display(),
            target = %target.display(),
            bytes = written,
            mode = %format_args!("{:o}", mode),
            "file deployed"
        );
        Ok(())
    }

    async fn create_dirs(&self, path: &Path) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(DEFAULT_PARENT_MODE)
            .create(path)
            .await
            .map_err(|e| BootstrapError::io(path, e))
    }
}

#[async_trait]
impl ResourceDeployer for FsResourceDeployer {
    async fn deploy(&self, entry: &TransferEntry, manifest: &ResourceManifest) -> Result<()> {
        let resources = manifest.get(&entry.source);
        if resources.is_empty() {
            return Err(BootstrapError::ResourceNotFound {
                source_path: entry.source.clone(),
            });
        }

        info!(
            kind = entry.kind.as_str(),
            source = %entry.source,
            target = %entry.target,
            resources = resources.len(),
            "deploying resources"
        );

        // Directory modes are applied once everything under them is written.
        let mut directories: Vec<(PathBuf, &ResolvedResource)> = Vec::new();

        for resource in resources {
            let target = resolve_target(resource.target_path(), resource.workdir());
            debug!(
                source = resource.source_path(),
                target = %target.display(),
                "deploying resource"
            );
            match resource {
                ResolvedResource::File(file) => {
                    self.write_file(file, resource.permissions(), &target).await?
                }
                ResolvedResource::Directory(_) => {
                    self.create_dirs(&target).await?;
                    directories.push((target, resource));
                }
            }
        }

        directories.sort_by_key(|(target, _)| Reverse(target.components().count()));
        for (target, dir) in directories {
            let mode = dir.permissions();
            set_mode(&target, mode).await?;
            set_owner(&target, dir.user())?;
            debug!(
                target = %target.display(),
                mode = %format_args!("{:o}", mode),
                "directory deployed"
            );
        }

        Ok(())
    }
}

/// Absolute targets are used as-is; relative ones are taken relative to the
/// resource's workdir.
fn resolve_target(target: &Path, workdir: &Workdir) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        warn!(target = %target.display(), workdir = %workdir, "relative target path, resolving against workdir");
        Path::new(workdir.as_str()).join(target)
    }
}

fn temp_path(target: &Path) -> Result<PathBuf> {
    let name = target.file_name().ok_or_else(|| {
        BootstrapError::io(
            target,
            io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"),
        )
    })?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".vmbuild-tmp");
    Ok(target.with_file_name(tmp_name))
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    tokio::fs::set_permissions(path, Permissions::from_mode(mode))
        .await
        .map_err(|e| BootstrapError::io(path, e))
}

/// Change ownership unless the path already has the requested owner.
fn set_owner(path: &Path, user: &User) -> Result<()> {
    let identity = Identity::resolve(user)
        .map_err(|e| BootstrapError::io(path, io::Error::new(io::ErrorKind::NotFound, e)))?;

    // chown follows symlinks, so the check must too.
    let metadata = std::fs::metadata(path).map_err(|e| BootstrapError::io(path, e))?;
    if metadata.uid() == identity.uid.as_raw() && metadata.gid() == identity.gid.as_raw() {
        return Ok(());
    }

    chown(path, Some(identity.uid), Some(identity.gid))
        .map_err(|e| BootstrapError::io(path, io::Error::from(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbuild_plan::{DirectoryResource, ResourceContents, TransferKind};

    fn current_user() -> User {
        let current = Identity::current();
        User::new(format!("{}:{}", current.uid, current.gid))
    }

    fn file(source: &str, target: &Path, data: &'static [u8], mode: u32) -> ResolvedResource {
        ResolvedResource::File(FileResource {
            contents: ResourceContents::inline(data),
            mode,
            source_path: source.to_string(),
            target_path: target.to_path_buf(),
            workdir: Workdir::default(),
            user: current_user(),
            local_path: None,
        })
    }

    fn directory(source: &str, target: &Path, mode: u32) -> ResolvedResource {
        ResolvedResource::Directory(DirectoryResource {
            mode,
            source_path: source.to_string(),
            target_path: target.to_path_buf(),
            workdir: Workdir::default(),
            user: current_user(),
            local_path: None,
        })
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
    }

    #[tokio::test]
    async fn test_missing_source_is_not_found() {
        let entry = TransferEntry::new(TransferKind::Add, "etc/test-file1", "/etc/test-file1");
        let err = FsResourceDeployer::new()
            .deploy(&entry, &ResourceManifest::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::ResourceNotFound { ref source_path } if source_path == "etc/test-file1"
        ));
    }

    #[tokio::test]
    async fn test_file_written_with_mode_and_parents() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("etc/nested/test-file1");

        let mut manifest = ResourceManifest::new();
        manifest.insert("etc/test-file1", file("etc/test-file1", &target, b"test-file1 contents", 0o640));
        let entry = TransferEntry::new(TransferKind::Add, "etc/test-file1", target.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"test-file1 contents");
        assert_eq!(mode_of(&target), 0o640);
        assert_eq!(mode_of(target.parent().unwrap()), DEFAULT_PARENT_MODE);
        assert!(!temp_path(&target).unwrap().exists());
    }

    #[tokio::test]
    async fn test_file_type_bits_are_not_applied() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("script");

        let mut manifest = ResourceManifest::new();
        manifest.insert("script", file("script", &target, b"#!/bin/sh\n", 0o100750));
        let entry = TransferEntry::new(TransferKind::Copy, "script", target.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();
        assert_eq!(mode_of(&target), 0o750);
    }

    #[tokio::test]
    async fn test_existing_file_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("config");
        std::fs::write(&target, b"old contents that are longer").unwrap();

        let mut manifest = ResourceManifest::new();
        manifest.insert("config", file("config", &target, b"new", 0o600));
        let entry = TransferEntry::new(TransferKind::Copy, "config", target.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(mode_of(&target), 0o600);
    }

    #[tokio::test]
    async fn test_empty_directory_gets_mode() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("srv/empty");

        let mut manifest = ResourceManifest::new();
        manifest.insert("empty", directory("empty", &target, 0o750));
        let entry = TransferEntry::new(TransferKind::Copy, "empty", target.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();
        assert!(target.is_dir());
        assert_eq!(mode_of(&target), 0o750);
    }

    #[tokio::test]
    async fn test_directory_with_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("etc/directory");

        let mut manifest = ResourceManifest::new();
        manifest.insert("etc/directory", directory("etc/directory", &dir, 0o500));
        manifest.insert("etc/directory", file("etc/directory/file1", &dir.join("file1"), b"file1", 0o644));
        manifest.insert(
            "etc/directory",
            file("etc/directory/subdir/subdir-file1", &dir.join("subdir/subdir-file1"), b"deep", 0o644),
        );
        let entry = TransferEntry::new(TransferKind::Copy, "etc/directory", dir.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();

        assert_eq!(std::fs::read(dir.join("file1")).unwrap(), b"file1");
        assert_eq!(std::fs::read(dir.join("subdir/subdir-file1")).unwrap(), b"deep");
        assert!(dir.join("subdir").is_dir());
        // Restrictive mode applied after the children were written.
        assert_eq!(mode_of(&dir), 0o500);

        let mut perms = std::fs::metadata(&dir).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&dir, perms).unwrap();
    }

    #[tokio::test]
    async fn test_relative_target_uses_workdir() {
        let root = tempfile::tempdir().unwrap();
        let resource = FileResource {
            contents: ResourceContents::inline(&b"relative"[..]),
            mode: 0o644,
            source_path: "notes.txt".to_string(),
            target_path: PathBuf::from("docs/notes.txt"),
            workdir: Workdir::new(root.path().to_string_lossy()),
            user: current_user(),
            local_path: Some(PathBuf::from("/host/context/notes.txt")),
        };

        let mut manifest = ResourceManifest::new();
        manifest.insert("notes.txt", ResolvedResource::File(resource));
        let entry = TransferEntry::new(TransferKind::Copy, "notes.txt", "docs/notes.txt");

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();
        assert_eq!(
            std::fs::read(root.path().join("docs/notes.txt")).unwrap(),
            b"relative"
        );
    }

    #[tokio::test]
    async fn test_unreadable_contents_is_io_error() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("out");

        let mut manifest = ResourceManifest::new();
        manifest.insert(
            "staged",
            ResolvedResource::File(FileResource {
                contents: ResourceContents::local("/nonexistent/staged/file"),
                mode: 0o644,
                source_path: "staged".to_string(),
                target_path: target.clone(),
                workdir: Workdir::default(),
                user: current_user(),
                local_path: None,
            }),
        );
        let entry = TransferEntry::new(TransferKind::Add, "staged", target.to_string_lossy());

        let err = FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap_err();
        assert_eq!(err.reason_code(), "io_error");
        assert!(!target.exists());
        assert!(!temp_path(&target).unwrap().exists());
    }

    #[tokio::test]
    async fn test_ownership_applied_to_files_and_directories() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }

        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("srv/owned");
        let file_target = dir.join("data");
        let owner = User::new("1234:5678");

        let mut manifest = ResourceManifest::new();
        manifest.insert(
            "owned",
            ResolvedResource::Directory(DirectoryResource {
                mode: 0o755,
                source_path: "owned".to_string(),
                target_path: dir.clone(),
                workdir: Workdir::default(),
                user: owner.clone(),
                local_path: None,
            }),
        );
        manifest.insert(
            "owned",
            ResolvedResource::File(FileResource {
                contents: ResourceContents::inline(&b"payload"[..]),
                mode: 0o644,
                source_path: "owned/data".to_string(),
                target_path: file_target.clone(),
                workdir: Workdir::default(),
                user: owner,
                local_path: None,
            }),
        );
        let entry = TransferEntry::new(TransferKind::Copy, "owned", dir.to_string_lossy());

        FsResourceDeployer::new().deploy(&entry, &manifest).await.unwrap();

        for path in [&dir, &file_target] {
            let metadata = std::fs::metadata(path).unwrap();
            assert_eq!((metadata.uid(), metadata.gid()), (1234, 5678), "{}", path.display());
        }
    }

    #[test]
    fn test_set_owner_follows_symlinks() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }

        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real");
        let link = root.path().join("link");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();
        // Only the link itself already has the requested owner.
        std::os::unix::fs::lchown(&link, Some(1234), Some(5678)).unwrap();

        set_owner(&link, &User::new("1234:5678")).unwrap();

        let metadata = std::fs::metadata(&real).unwrap();
        assert_eq!((metadata.uid(), metadata.gid()), (1234, 5678));
    }
}
