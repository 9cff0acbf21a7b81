/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! `TreeValue` and the tree builder (§3 "TreeValue", §4.E).

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::artifact::Artifact;
use crate::digest::Digest;
use crate::file_value::build_file_value;
use crate::file_value::FileValue;
use crate::fs::FileSystem;
use crate::fs::StatKind;
use crate::tsgm::TimestampGranularityMonitor;

/// Aggregate metadata for a tree artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeValue {
    pub parent: Artifact,
    /// Keys are files only — subdirectories are flattened away (§3 invariant
    /// 4).
    pub children: HashMap<Artifact, FileValue>,
    pub archived_representation: Option<(Artifact, FileValue)>,
    pub aggregate_digest: Digest,
    pub materialization_exec_path: Option<PathBuf>,
}

/// The sentinel-carrying wrapper the store actually holds, mirroring how
/// [`crate::file_value::FileValue`] folds `Missing`/`Omitted` into the same
/// enum as real values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeMetadata {
    MissingTree,
    OmittedTree,
    Present(TreeValue),
}

impl TreeMetadata {
    pub fn children_or_empty(&self) -> std::collections::HashSet<Artifact> {
        match self {
            TreeMetadata::Present(tree) => tree.children.keys().cloned().collect(),
            _ => std::collections::HashSet::new(),
        }
    }
}

/// Canonicalizes child order by exec path before hashing, so the aggregate
/// digest doesn't depend on the (unordered) concurrent walk's insertion
/// order — §4.E step 8.
fn aggregate_digest(children: &HashMap<Artifact, FileValue>) -> Digest {
    let mut entries: Vec<(&Path, &FileValue)> = children
        .iter()
        .map(|(a, v)| (a.exec_path().as_path(), v))
        .collect();
    entries.sort_by_key(|(path, _)| path.to_path_buf());

    let mut buf = Vec::new();
    for (path, value) in entries {
        buf.extend_from_slice(path.to_string_lossy().as_bytes());
        buf.push(0);
        if let Some(d) = value.digest() {
            buf.extend_from_slice(d.as_bytes());
        }
        buf.push(0xff);
    }
    Digest::from_bytes(&buf)
}

/// Configuration the tree builder needs beyond the filesystem itself.
pub struct TreeBuildContext<'a> {
    pub fs: &'a dyn FileSystem,
    pub chmod_enabled: bool,
    pub tsgm: Option<&'a dyn TimestampGranularityMonitor>,
    pub exec_root: &'a Path,
    /// The archived representation's artifact and absolute path, when
    /// archived-tree support is configured (§4.E step 6, §3 invariant 5).
    pub archived_representation: Option<(Artifact, PathBuf)>,
}

/// Implements §4.E: walks `abs_path` (the parent tree artifact's resolved
/// path) and builds its aggregate [`TreeValue`].
pub async fn build_tree_value(
    parent: &Artifact,
    abs_path: PathBuf,
    ctx: &TreeBuildContext<'_>,
) -> anyhow::Result<TreeMetadata> {
    let stat = ctx.fs.stat(&abs_path, true).await?;
    match &stat {
        Some(s) if s.kind == StatKind::Directory => {}
        Some(s) => {
            if ctx.chmod_enabled && s.kind == StatKind::File {
                ctx.fs.chmod(&abs_path, s.executable)?;
            }
            return Ok(TreeMetadata::MissingTree);
        }
        None => return Ok(TreeMetadata::MissingTree),
    };

    if ctx.chmod_enabled {
        ctx.fs.chmod(&abs_path, true)?;
    }

    let remote_seen = AtomicBool::new(false);
    let mut children: HashMap<Artifact, FileValue> = HashMap::new();

    let entries = ctx.fs.visit_tree_in_parallel(&abs_path).await?;

    // Each entry's stat+digest work is issued as a separate future and
    // driven concurrently by `FuturesUnordered`; the real filesystem pushes
    // the actual blocking I/O onto tokio's blocking thread pool underneath,
    // which is the "work-stealing thread pool" §4.E/§9 call for.
    let mut tasks: FuturesUnordered<BoxFuture<'_, anyhow::Result<(Artifact, FileValue)>>> =
        FuturesUnordered::new();

    for entry in entries {
        if entry.kind == StatKind::Directory {
            continue;
        }

        let child_abs = abs_path.join(&entry.relative_path);
        let child_rel = entry.relative_path.clone();
        let is_symlink = entry.kind == StatKind::Symlink;

        let fut: BoxFuture<'_, anyhow::Result<(Artifact, FileValue)>> = Box::pin(async move {
            let pre_stat = ctx.fs.stat(&child_abs, false).await?;
            if ctx.chmod_enabled && !is_symlink {
                let executable = pre_stat.as_ref().map(|s| s.executable).unwrap_or(false);
                ctx.fs.chmod(&child_abs, executable)?;
            }

            let child = Artifact::tree_child(parent, &child_rel)?;
            let built = build_file_value(
                &child,
                ctx.fs,
                child_abs,
                pre_stat,
                None,
                ctx.tsgm,
                ctx.exec_root,
            )
            .await?;

            if matches!(built.value, FileValue::Missing) {
                anyhow::bail!(
                    "tree child `{}` disappeared while building tree `{}`",
                    child_rel.display(),
                    parent
                );
            }

            Ok((child, built.value))
        });
        tasks.push(fut);
    }

    while let Some(result) = tasks.next().await {
        let (child, value) = result?;
        if value.is_remote() {
            remote_seen.store(true, Ordering::SeqCst);
        }
        children.insert(child, value);
    }

    let archived_representation = match &ctx.archived_representation {
        Some((archive_artifact, archive_abs)) => match ctx.fs.stat(archive_abs, false).await? {
            Some(stat) => {
                let built = build_file_value(
                    archive_artifact,
                    ctx.fs,
                    archive_abs.clone(),
                    Some(stat),
                    None,
                    ctx.tsgm,
                    ctx.exec_root,
                )
                .await?;
                Some((archive_artifact.clone(), built.value))
            }
            None => {
                tracing::info!(
                    archive_path = %archive_abs.display(),
                    tree = %parent,
                    "no archived representation found for tree",
                );
                None
            }
        },
        None => None,
    };

    let materialization_exec_path = if remote_seen.load(Ordering::SeqCst) {
        match ctx.fs.stat(&abs_path, false).await? {
            Some(pnf) if pnf.kind == StatKind::Symlink => {
                let real = ctx.fs.readlink_and_resolve(&abs_path).await?;
                Some(crate::artifact::strip_root(ctx.exec_root, &real))
            }
            _ => None,
        }
    } else {
        None
    };

    let digest = aggregate_digest(&children);

    Ok(TreeMetadata::Present(TreeValue {
        parent: parent.clone(),
        children,
        archived_representation,
        aggregate_digest: digest,
        materialization_exec_path,
    }))
}
