/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The output store (§4.D).
//!
//! Two concurrent maps, grounded on the `dashmap`-backed stores in
//! `buck2_execute_impl::materializers::deferred`: sharded, lock-free-ish
//! insertion so a multi-threaded tree walk (§4.E) and independent
//! `getOutputMetadata` calls never contend on one global mutex.

use dashmap::DashMap;

use crate::artifact::Artifact;
use crate::file_value::FileValue;
use crate::tree_value::TreeMetadata;

#[derive(Default)]
pub struct OutputStore {
    files: DashMap<Artifact, FileValue>,
    trees: DashMap<Artifact, TreeMetadata>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_file(&self, artifact: &Artifact) -> Option<FileValue> {
        self.files.get(artifact).map(|v| v.clone())
    }

    pub fn set_file(&self, artifact: Artifact, value: FileValue) {
        self.files.insert(artifact, value);
    }

    /// Returns the value that ended up in the store: either `value` if this
    /// call inserted it, or whatever a racing insert already put there
    /// (§4.F op 2 "Middleman" / §5 "last writer wins" tolerance).
    pub fn get_or_insert_file(&self, artifact: Artifact, value: FileValue) -> FileValue {
        self.files.entry(artifact).or_insert(value).clone()
    }

    pub fn get_tree(&self, artifact: &Artifact) -> Option<TreeMetadata> {
        self.trees.get(artifact).map(|v| v.clone())
    }

    pub fn set_tree(&self, artifact: Artifact, value: TreeMetadata) {
        self.trees.insert(artifact, value);
    }

    /// Removes `artifact` from both maps (§4.D, used by `resetOutputs`).
    pub fn remove(&self, artifact: &Artifact) {
        self.files.remove(artifact);
        self.trees.remove(artifact);
    }

    /// Empties both maps. Called exactly once, at `prepareForActionExecution`.
    pub fn clear(&self) {
        self.files.clear();
        self.trees.clear();
    }
}
