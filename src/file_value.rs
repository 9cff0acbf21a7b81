/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! `FileValue` and the file-value factory (§3 "FileValue", §4.C).

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::artifact::Artifact;
use crate::digest::digest_of_file;
use crate::digest::Digest;
use crate::error::MetadataError;
use crate::fs::FileSystem;
use crate::fs::Stat;
use crate::fs::StatKind;
use crate::tsgm::TimestampGranularityMonitor;

/// A cheap identity check for "did this file change", derived from stat
/// fields rather than content, per §3 "contents-proxy".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentsProxy {
    pub ctime: i64,
    pub dev: u64,
    pub ino: u64,
}

/// One artifact's metadata, as described by §3 "FileValue". `Missing` and
/// `Omitted` are the two sentinels §3 reserves; `Middleman` is the distinct
/// sentinel for middleman artifacts (`digest` is `None` until
/// `setDigestForVirtualArtifact` injects one).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileValue {
    Missing,
    Omitted,
    Middleman {
        digest: Option<Digest>,
    },
    RegularFile {
        size: u64,
        digest: Digest,
        contents_proxy: Option<ContentsProxy>,
        is_remote: bool,
        materialization_exec_path: Option<PathBuf>,
    },
    Directory {
        mtime: SystemTime,
        is_remote: bool,
        materialization_exec_path: Option<PathBuf>,
    },
    Symlink {
        digest: Digest,
        is_remote: bool,
        materialization_exec_path: Option<PathBuf>,
    },
    Special,
    /// What `getOutputMetadata` returns for a tree artifact: the tree's
    /// aggregate digest, reshaped into the same currency as every other
    /// output so callers building an action-cache key don't need a second
    /// code path for directories (§4.F op 2).
    AggregateTree {
        digest: Digest,
        is_remote: bool,
        materialization_exec_path: Option<PathBuf>,
    },
}

impl FileValue {
    pub fn is_remote(&self) -> bool {
        match self {
            FileValue::RegularFile { is_remote, .. }
            | FileValue::Directory { is_remote, .. }
            | FileValue::Symlink { is_remote, .. }
            | FileValue::AggregateTree { is_remote, .. } => *is_remote,
            _ => false,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            FileValue::RegularFile { digest, .. }
            | FileValue::Symlink { digest, .. }
            | FileValue::AggregateTree { digest, .. } => Some(digest),
            FileValue::Middleman { digest } => digest.as_ref(),
            _ => None,
        }
    }

    /// Applies the "remote symlink preservation" normalization from §4.C:
    /// when a stat-through-symlink reported remote content, the value is
    /// rewritten to carry where that content was materialized.
    fn with_materialization_exec_path(self, path: PathBuf) -> Self {
        match self {
            FileValue::RegularFile {
                size,
                digest,
                contents_proxy,
                is_remote,
                ..
            } => FileValue::RegularFile {
                size,
                digest,
                contents_proxy,
                is_remote,
                materialization_exec_path: Some(path),
            },
            FileValue::Directory { mtime, is_remote, .. } => FileValue::Directory {
                mtime,
                is_remote,
                materialization_exec_path: Some(path),
            },
            FileValue::Symlink { digest, is_remote, .. } => FileValue::Symlink {
                digest,
                is_remote,
                materialization_exec_path: Some(path),
            },
            other => other,
        }
    }
}

/// Result of [`build_file_value`]: the value plus the paths used to get
/// there, so callers (notably the tree builder, §4.E) don't need to redo the
/// resolution.
pub struct BuiltFileValue {
    pub path_no_follow: PathBuf,
    pub real_path: Option<PathBuf>,
    pub stat_no_follow: Option<Stat>,
    pub value: FileValue,
}

/// Implements §4.C: turns a stat (or symlink read) into a [`FileValue`].
///
/// `resolve` maps the artifact's exec path to an absolute path. `stat_hint`,
/// when given, is used instead of a fresh no-follow stat (this is how
/// [`crate::handler::ActionMetadataHandler::construct_metadata_for_digest`]
/// avoids a redundant syscall). `injected_digest` is compared against
/// whatever digest the filesystem path yields; a mismatch is a fatal
/// [`MetadataError::InvariantViolation`].
pub async fn build_file_value(
    artifact: &Artifact,
    fs: &dyn FileSystem,
    abs_path: PathBuf,
    stat_hint: Option<Stat>,
    injected_digest: Option<Digest>,
    tsgm: Option<&dyn TimestampGranularityMonitor>,
    exec_root: &Path,
) -> anyhow::Result<BuiltFileValue> {
    if artifact.is_symlink_artifact() {
        let target = fs.read_link(&abs_path).await?;
        let digest = match injected_digest {
            Some(d) => d,
            None => Digest::from_bytes(target.to_string_lossy().as_bytes()),
        };
        return Ok(BuiltFileValue {
            path_no_follow: abs_path,
            real_path: None,
            stat_no_follow: None,
            value: FileValue::Symlink {
                digest,
                is_remote: false,
                materialization_exec_path: None,
            },
        });
    }

    let stat_no_follow = match stat_hint {
        Some(stat) => Some(stat),
        None => fs.stat(&abs_path, false).await?,
    };

    let stat_no_follow = match stat_no_follow {
        Some(stat) => stat,
        None => {
            return Ok(BuiltFileValue {
                path_no_follow: abs_path,
                real_path: None,
                stat_no_follow: None,
                value: FileValue::Missing,
            });
        }
    };

    if stat_no_follow.kind != StatKind::Symlink {
        let value =
            build_from_stat(artifact, fs, &abs_path, &stat_no_follow, injected_digest, tsgm)
                .await?;
        return Ok(BuiltFileValue {
            path_no_follow: abs_path,
            real_path: None,
            stat_no_follow: Some(stat_no_follow),
            value,
        });
    }

    let real_path = fs.readlink_and_resolve(&abs_path).await?;
    if real_path == abs_path {
        return Err(MetadataError::SymlinkCycle { path: abs_path }.into());
    }

    let stat_real = fs.stat(&real_path, false).await?;
    let value = match stat_real {
        None => FileValue::Missing,
        Some(stat_real) => {
            let value =
                build_from_stat(artifact, fs, &real_path, &stat_real, injected_digest, tsgm)
                    .await?;
            if value.is_remote() {
                let rel = crate::artifact::strip_root(exec_root, &real_path);
                value.with_materialization_exec_path(rel)
            } else {
                value
            }
        }
    };

    Ok(BuiltFileValue {
        path_no_follow: abs_path,
        real_path: Some(real_path),
        stat_no_follow: Some(stat_no_follow),
        value,
    })
}

/// Builds the terminal (non-symlink) shape of a value from a stat already in
/// hand, applying digest computation/conflict-checking (§4.C rule 3 and the
/// "regular file without digest" terminal case).
async fn build_from_stat(
    artifact: &Artifact,
    fs: &dyn FileSystem,
    digest_path: &Path,
    stat: &Stat,
    injected_digest: Option<Digest>,
    tsgm: Option<&dyn TimestampGranularityMonitor>,
) -> anyhow::Result<FileValue> {
    match stat.kind {
        StatKind::Directory => Ok(FileValue::Directory {
            mtime: stat.mtime,
            is_remote: stat.is_remote,
            materialization_exec_path: None,
        }),
        StatKind::Special => Ok(FileValue::Special),
        StatKind::Symlink => unreachable!("caller only passes non-symlink stats here"),
        StatKind::File => {
            if !artifact.is_constant_metadata() {
                if let Some(tsgm) = tsgm {
                    tsgm.notify_stat(digest_path, stat.mtime);
                }
            }

            // The filesystem-derived digest is always established, either
            // from a fast hint or by reading the file, so an injected digest
            // can be validated against it rather than trusted blindly.
            let fs_digest = match stat
                .embedded_digest
                .clone()
                .or_else(|| fs.read_xattr_digest(digest_path))
            {
                Some(fast) => fast,
                None => {
                    let path = digest_path.to_path_buf();
                    let size = stat.size;
                    tokio::task::spawn_blocking(move || digest_of_file(&path, Some(size)))
                        .await?
                        .map_err(|e| MetadataError::io(digest_path, e))?
                }
            };

            if let Some(injected) = injected_digest {
                if injected != fs_digest {
                    return Err(MetadataError::invariant(format!(
                        "injected digest `{}` conflicts with filesystem digest `{}` for `{}`",
                        injected,
                        fs_digest,
                        digest_path.display()
                    )));
                }
            }
            let digest = fs_digest;

            Ok(FileValue::RegularFile {
                size: stat.size,
                digest,
                contents_proxy: Some(ContentsProxy {
                    ctime: stat.ctime,
                    dev: stat.dev,
                    ino: stat.ino,
                }),
                is_remote: stat.is_remote,
                materialization_exec_path: None,
            })
        }
    }
}
