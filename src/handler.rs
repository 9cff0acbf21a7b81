/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The metadata handler (§4.F): the crate's top-level API.
//!
//! Grounded on `buck2_execute::execute::action_digest::ActionMetadataBlobData`
//! and the surrounding `buck2_build_api::actions::execute` orchestration: one
//! handler per in-flight action, holding the phase flag and the three
//! metadata sources (§1), and delegating to the filesystem/digest/tree
//! components (A–E) it owns.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashSet;

use crate::artifact::Artifact;
use crate::artifact::ExecPath;
use crate::digest::Digest;
use crate::error::MetadataError;
use crate::file_value::build_file_value;
use crate::file_value::FileValue;
use crate::fileset::FilesetEntries;
use crate::fileset::FilesetMapping;
use crate::fs::FileSystem;
use crate::fs::Stat;
use crate::fs::StatKind;
use crate::output_store::OutputStore;
use crate::tree_value::build_tree_value;
use crate::tree_value::TreeBuildContext;
use crate::tree_value::TreeMetadata;
use crate::tree_value::TreeValue;
use crate::tsgm::TimestampGranularityMonitor;

/// How the handler should treat the executable bit when it chmods a freshly
/// discovered output during execution phase (§10.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputPermissions {
    /// Normalize permissions from what the filesystem reports (the default
    /// the teacher's `FsIoProvider` applies).
    Normalize,
    /// Leave whatever bits the producer left; skip the chmod call entirely.
    NoOp,
}

/// The handler's own knobs, gathered at construction (§10.3).
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub archived_tree_artifacts_enabled: bool,
    pub output_permissions: OutputPermissions,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            archived_tree_artifacts_enabled: false,
            output_permissions: OutputPermissions::Normalize,
        }
    }
}

/// A lookup key for `getInputMetadata`: either a declared artifact, or a
/// fileset member identified by its exec-root-relative path (§4.F op 1).
#[derive(Clone, Debug)]
pub enum ActionInput {
    Artifact(Artifact),
    FilesetMember(PathBuf),
}

pub struct ActionMetadataHandler {
    execution_mode: AtomicBool,
    omitted: DashSet<Artifact>,
    outputs: HashSet<Artifact>,
    input_artifact_data: HashMap<Artifact, FileValue>,
    fileset_mapping: FilesetMapping,
    output_store: OutputStore,
    config: HandlerConfig,
    fs: Arc<dyn FileSystem>,
    tsgm: Option<Arc<dyn TimestampGranularityMonitor>>,
    exec_root: PathBuf,
}

impl ActionMetadataHandler {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        exec_root: PathBuf,
        input_artifact_data: HashMap<Artifact, FileValue>,
        outputs: HashSet<Artifact>,
        filesets: Vec<FilesetEntries>,
        config: HandlerConfig,
        tsgm: Option<Arc<dyn TimestampGranularityMonitor>>,
    ) -> Self {
        Self {
            execution_mode: AtomicBool::new(false),
            omitted: DashSet::new(),
            outputs,
            input_artifact_data,
            fileset_mapping: FilesetMapping::build(filesets),
            output_store: OutputStore::new(),
            config,
            fs,
            tsgm,
            exec_root,
        }
    }

    fn is_execution_phase(&self) -> bool {
        self.execution_mode.load(Ordering::SeqCst)
    }

    fn ensure_execution_phase(&self) -> anyhow::Result<()> {
        if !self.is_execution_phase() {
            return Err(MetadataError::invariant(
                "operation is only valid during the execution phase",
            ));
        }
        Ok(())
    }

    fn chmod_enabled(&self) -> bool {
        self.is_execution_phase() && self.config.output_permissions == OutputPermissions::Normalize
    }

    fn reject_sentinel(
        &self,
        artifact: &Artifact,
        value: FileValue,
    ) -> anyhow::Result<Option<FileValue>> {
        match value {
            FileValue::Missing | FileValue::Omitted => {
                Err(MetadataError::not_found(artifact.clone()).into())
            }
            other => Ok(Some(other)),
        }
    }

    fn is_declared_output(&self, artifact: &Artifact) -> bool {
        self.outputs.contains(artifact)
            || artifact
                .tree_parent()
                .map_or(false, |parent| self.outputs.contains(parent))
    }

    /// The archive path a tree's archived representation would live at, when
    /// archived-tree support is configured. The exact naming convention isn't
    /// specified upstream of this crate; `<tree>.tar.zst` alongside the tree
    /// itself is the simplification this crate picked.
    fn archived_representation_for(&self, parent: &Artifact) -> Option<(Artifact, PathBuf)> {
        if !self.config.archived_tree_artifacts_enabled {
            return None;
        }
        let archive_rel = parent.exec_path().as_path().with_extension("tar.zst");
        let archive_artifact = Artifact::plain_file(ExecPath::new(&archive_rel).ok()?);
        let archive_abs = self.exec_root.join(&archive_rel);
        Some((archive_artifact, archive_abs))
    }

    async fn build_or_get_tree(&self, parent: &Artifact) -> anyhow::Result<TreeMetadata> {
        if let Some(cached) = self.output_store.get_tree(parent) {
            return Ok(cached);
        }
        let abs_path = self.exec_root.join(parent.exec_path().as_path());
        let ctx = TreeBuildContext {
            fs: self.fs.as_ref(),
            chmod_enabled: self.chmod_enabled(),
            tsgm: self.tsgm.as_deref(),
            exec_root: &self.exec_root,
            archived_representation: self.archived_representation_for(parent),
        };
        let built = build_tree_value(parent, abs_path, &ctx).await?;
        self.output_store.set_tree(parent.clone(), built.clone());
        Ok(built)
    }

    /// §4.F op 1.
    pub fn get_input_metadata(&self, input: &ActionInput) -> anyhow::Result<Option<FileValue>> {
        match input {
            ActionInput::FilesetMember(path) => {
                let key = path
                    .strip_prefix(&self.exec_root)
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|_| path.clone());
                Ok(self.fileset_mapping.get(&key))
            }
            ActionInput::Artifact(artifact) => match self.input_artifact_data.get(artifact) {
                None => Ok(None),
                Some(FileValue::Missing) | Some(FileValue::Omitted) => {
                    Err(MetadataError::not_found(artifact.clone()).into())
                }
                Some(value) => Ok(Some(value.clone())),
            },
        }
    }

    /// §4.F op 2.
    pub async fn get_output_metadata(
        &self,
        artifact: &Artifact,
    ) -> anyhow::Result<Option<FileValue>> {
        if !self.is_declared_output(artifact) {
            return Ok(None);
        }

        if artifact.is_middleman() {
            let value = self
                .output_store
                .get_or_insert_file(artifact.clone(), FileValue::Middleman { digest: None });
            return Ok(Some(value));
        }

        if artifact.is_tree_artifact() {
            let tree = self.get_tree_artifact_value(artifact).await?;
            return Ok(Some(FileValue::AggregateTree {
                digest: tree.aggregate_digest.clone(),
                is_remote: tree.materialization_exec_path.is_some(),
                materialization_exec_path: tree.materialization_exec_path.clone(),
            }));
        }

        if let Some(parent) = artifact.tree_parent() {
            let meta = self.build_or_get_tree(parent).await?;
            let value = match meta {
                TreeMetadata::Present(tree) => {
                    tree.children.get(artifact).cloned().unwrap_or(FileValue::Missing)
                }
                TreeMetadata::MissingTree => FileValue::Missing,
                TreeMetadata::OmittedTree => FileValue::Omitted,
            };
            return self.reject_sentinel(artifact, value);
        }

        if let Some(cached) = self.output_store.get_file(artifact) {
            return self.reject_sentinel(artifact, cached);
        }

        let abs_path = self.exec_root.join(artifact.exec_path().as_path());
        let stat_hint = if self.is_execution_phase() {
            let stat = self.fs.stat(&abs_path, false).await?;
            if self.chmod_enabled() {
                if let Some(stat) = &stat {
                    if stat.kind == StatKind::File {
                        self.fs.chmod(&abs_path, stat.executable)?;
                    }
                }
            }
            stat
        } else {
            None
        };

        let built = build_file_value(
            artifact,
            self.fs.as_ref(),
            abs_path,
            stat_hint,
            None,
            self.tsgm.as_deref(),
            &self.exec_root,
        )
        .await?;
        self.output_store.set_file(artifact.clone(), built.value.clone());
        self.reject_sentinel(artifact, built.value)
    }

    /// §4.F op 3.
    pub fn set_digest_for_virtual_artifact(
        &self,
        artifact: &Artifact,
        digest: Digest,
    ) -> anyhow::Result<()> {
        if !artifact.is_middleman() {
            return Err(MetadataError::invariant(format!(
                "setDigestForVirtualArtifact called on non-middleman `{}`",
                artifact
            )));
        }
        self.output_store.set_file(
            artifact.clone(),
            FileValue::Middleman {
                digest: Some(digest),
            },
        );
        Ok(())
    }

    /// §4.F op 4.
    pub async fn get_tree_artifact_value(&self, tree: &Artifact) -> anyhow::Result<TreeValue> {
        match self.build_or_get_tree(tree).await? {
            TreeMetadata::Present(value) => Ok(value),
            TreeMetadata::MissingTree | TreeMetadata::OmittedTree => {
                Err(MetadataError::not_found(tree.clone()).into())
            }
        }
    }

    /// §4.F op 5.
    pub fn get_tree_artifact_children(&self, tree: &Artifact) -> HashSet<Artifact> {
        self.output_store
            .get_tree(tree)
            .map(|meta| meta.children_or_empty())
            .unwrap_or_default()
    }

    /// §4.F op 6.
    pub async fn construct_metadata_for_digest(
        &self,
        output: &Artifact,
        stat_no_follow: Stat,
        digest: Digest,
    ) -> anyhow::Result<FileValue> {
        self.ensure_execution_phase()?;
        if output.is_symlink_artifact() {
            return Err(MetadataError::invariant(format!(
                "constructMetadataForDigest called on symlink artifact `{}`",
                output
            )));
        }
        let abs_path = self.exec_root.join(output.exec_path().as_path());
        let built = build_file_value(
            output,
            self.fs.as_ref(),
            abs_path,
            Some(stat_no_follow),
            Some(digest),
            self.tsgm.as_deref(),
            &self.exec_root,
        )
        .await?;
        Ok(built.value)
    }

    /// §4.F op 7.
    pub fn inject_file(&self, output: &Artifact, value: FileValue) -> anyhow::Result<()> {
        self.ensure_execution_phase()?;
        if output.is_tree_artifact() || output.is_tree_child() {
            return Err(MetadataError::invariant(format!(
                "injectFile called on tree-shaped artifact `{}`",
                output
            )));
        }
        self.output_store.set_file(output.clone(), value);
        Ok(())
    }

    /// §4.F op 8.
    pub fn inject_tree(&self, output: &Artifact, tree: TreeValue) -> anyhow::Result<()> {
        self.ensure_execution_phase()?;
        if !output.is_tree_artifact() {
            return Err(MetadataError::invariant(format!(
                "injectTree called on non-tree artifact `{}`",
                output
            )));
        }
        if self.config.archived_tree_artifacts_enabled != tree.archived_representation.is_some() {
            return Err(MetadataError::invariant(format!(
                "injected tree `{}` archived-representation presence does not match handler configuration",
                output
            )));
        }
        self.output_store.set_tree(output.clone(), TreeMetadata::Present(tree));
        Ok(())
    }

    /// §4.F op 9.
    pub fn mark_omitted(&self, output: &Artifact) -> anyhow::Result<()> {
        self.ensure_execution_phase()?;
        if output.is_tree_artifact() {
            self.omitted.insert(output.clone());
            self.output_store.set_tree(output.clone(), TreeMetadata::OmittedTree);
        } else {
            if !self.omitted.insert(output.clone()) {
                return Err(MetadataError::invariant(format!(
                    "`{}` marked omitted twice",
                    output
                )));
            }
            self.output_store.set_file(output.clone(), FileValue::Omitted);
        }
        Ok(())
    }

    /// §4.F op 10.
    pub fn artifact_omitted(&self, artifact: &Artifact) -> bool {
        self.omitted.contains(artifact)
    }

    /// §4.F op 11.
    pub fn reset_outputs(
        &self,
        artifacts: impl IntoIterator<Item = Artifact>,
    ) -> anyhow::Result<()> {
        self.ensure_execution_phase()?;
        for artifact in artifacts {
            self.omitted.remove(&artifact);
            self.output_store.remove(&artifact);
        }
        Ok(())
    }

    /// §4.F op 12.
    pub fn prepare_for_action_execution(&self) -> anyhow::Result<()> {
        if self.execution_mode.swap(true, Ordering::SeqCst) {
            return Err(MetadataError::invariant(
                "prepareForActionExecution called more than once",
            ));
        }
        self.output_store.clear();
        Ok(())
    }

    /// §4.F op 13.
    pub fn get_output_store(&self) -> &OutputStore {
        &self.output_store
    }
}
