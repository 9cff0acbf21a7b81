/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Real, disk-backed implementation of [`super::FileSystem`].
//!
//! Follows `buck2_common::io::fs::FsIoProvider`: I/O runs on tokio's blocking
//! thread pool (not the async worker threads) via `spawn_blocking`, with a
//! semaphore bounding how many blocking threads a single walk can occupy at
//! once so one large tree doesn't starve the rest of the runtime.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use gazebo::cmp::PartialEqAny;
use once_cell::sync::Lazy;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::FileSystem;
use super::Stat;
use super::StatKind;
use super::VisitedEntry;
use crate::error::MetadataError;

/// Bounds how many blocking-pool threads a tree walk may occupy
/// concurrently, mirroring the `SEMAPHORE` pattern in
/// `buck2_common::io::fs::FsIoProvider::read_dir`.
static WALK_SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(400));

#[derive(Clone)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn stat_kind(meta: &std::fs::Metadata) -> StatKind {
    let ft = meta.file_type();
    if ft.is_symlink() {
        StatKind::Symlink
    } else if ft.is_dir() {
        StatKind::Directory
    } else if ft.is_file() {
        StatKind::File
    } else {
        StatKind::Special
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 > 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn unix_fields(meta: &std::fs::Metadata) -> (i64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.ctime(), meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn unix_fields(_meta: &std::fs::Metadata) -> (i64, u64, u64) {
    (0, 0, 0)
}

fn stat_sync(path: &Path, follow_symlinks: bool) -> std::io::Result<Option<std::fs::Metadata>> {
    let result = if follow_symlinks {
        std::fs::metadata(path)
    } else {
        std::fs::symlink_metadata(path)
    };
    match result {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl FileSystem for RealFileSystem {
    async fn stat(&self, path: &Path, follow_symlinks: bool) -> anyhow::Result<Option<Stat>> {
        let path = path.to_path_buf();
        let meta = tokio::task::spawn_blocking(move || stat_sync(&path, follow_symlinks)).await??;
        Ok(meta.map(|meta| {
            let (ctime, dev, ino) = unix_fields(&meta);
            Stat {
                kind: stat_kind(&meta),
                size: meta.len(),
                mtime: meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                ctime,
                dev,
                ino,
                executable: is_executable(&meta),
                embedded_digest: None,
                is_remote: false,
            }
        }))
    }

    async fn readlink_and_resolve(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let start = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut current = start.clone();
            let mut visited = HashSet::new();

            loop {
                let meta = std::fs::symlink_metadata(&current)
                    .map_err(|e| MetadataError::io(current.clone(), e))?;
                if !meta.file_type().is_symlink() {
                    return Ok(current);
                }
                if !visited.insert(current.clone()) {
                    return Err(MetadataError::SymlinkCycle { path: start.clone() }.into());
                }
                let dest = std::fs::read_link(&current)
                    .map_err(|e| MetadataError::io(current.clone(), e))?;
                current = if dest.is_absolute() {
                    dest
                } else {
                    current
                        .parent()
                        .map(|p| p.join(&dest))
                        .unwrap_or(dest)
                };
            }
        })
        .await?
    }

    async fn read_link(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::read_link(&path).map_err(|e| MetadataError::io(path.clone(), e).into())
        })
        .await?
    }

    fn chmod(&self, path: &Path, executable: bool) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = match std::fs::metadata(path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(MetadataError::io(path, e).into()),
            };
            let mode = if executable { 0o755 } else { 0o644 };
            if meta.permissions().mode() & 0o777 != mode {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                    .map_err(|e| MetadataError::io(path, e))?;
            }
        }
        Ok(())
    }

    async fn visit_tree_in_parallel(&self, root: &Path) -> anyhow::Result<Vec<VisitedEntry>> {
        let mut out = Vec::new();
        walk_dir(root, PathBuf::new(), &mut out).await?;
        Ok(out)
    }

    fn read_xattr_digest(&self, path: &Path) -> Option<crate::digest::Digest> {
        read_xattr_digest_sync(path)
    }

    fn eq_token(&self) -> PartialEqAny<'_> {
        PartialEqAny::always_true()
    }
}

#[cfg(unix)]
fn read_xattr_digest_sync(path: &Path) -> Option<crate::digest::Digest> {
    let raw = xattr::get(path, "user.sha1").ok()??;
    if raw.len() != crate::digest::SHA1_SIZE * 2 {
        return None;
    }
    let mut bytes = [0u8; crate::digest::SHA1_SIZE];
    hex::decode_to_slice(&raw, &mut bytes).ok()?;
    Some(crate::digest::Digest::from_raw_sha1(bytes))
}

#[cfg(not(unix))]
fn read_xattr_digest_sync(_path: &Path) -> Option<crate::digest::Digest> {
    None
}

fn walk_dir<'a>(
    abs_root: &'a Path,
    rel: PathBuf,
    out: &'a mut Vec<VisitedEntry>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let dir_abs = abs_root.join(&rel);
        let _permit = WALK_SEMAPHORE.acquire().await.unwrap();

        let mut entries = match tokio::fs::read_dir(&dir_abs).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MetadataError::io(dir_abs.clone(), e).into()),
        };

        let mut subdirs = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MetadataError::io(dir_abs.clone(), e))?
        {
            let file_name = entry.file_name();
            let child_rel = rel.join(&file_name);
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| MetadataError::io(entry.path(), e))?;

            let kind = if file_type.is_symlink() {
                StatKind::Symlink
            } else if file_type.is_dir() {
                StatKind::Directory
            } else if file_type.is_file() {
                StatKind::File
            } else {
                StatKind::Special
            };

            out.push(VisitedEntry {
                relative_path: child_rel.clone(),
                kind,
            });

            if kind == StatKind::Directory {
                subdirs.push(child_rel);
            }
        }
        drop(_permit);

        // Recurse into subdirectories concurrently; tokio's multi-threaded
        // scheduler is the "work-stealing thread pool" this walk relies on.
        let mut join_set = JoinSet::new();
        for child_rel in subdirs {
            let abs_root = abs_root.to_path_buf();
            join_set.spawn(async move {
                let mut nested = Vec::new();
                walk_dir(&abs_root, child_rel, &mut nested).await?;
                anyhow::Ok(nested)
            });
        }
        while let Some(result) = join_set.join_next().await {
            out.extend(result??);
        }

        Ok(())
    })
}
