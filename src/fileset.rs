/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The fileset mapping builder (§4.G).
//!
//! Grounded on `buck2_execute::execute::action_digest`'s flattening of a
//! symlink-tree input into exec-path-keyed entries: built once, read-only for
//! the handler's whole lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use crate::artifact::Artifact;
use crate::file_value::FileValue;

/// A single declared fileset: an ordered list of `(execPath, value)` output
/// symlinks that make up one fileset artifact.
pub struct FilesetEntries {
    pub artifact: Artifact,
    pub members: Vec<(PathBuf, FileValue)>,
}

/// The flattened, immutable exec-path → value mapping every fileset
/// collapses into.
#[derive(Default)]
pub struct FilesetMapping {
    entries: HashMap<PathBuf, FileValue>,
}

impl FilesetMapping {
    /// Flattens `filesets` into one mapping, skipping any member whose value
    /// has no digest (§4.G) — those can't identify their content and would
    /// otherwise poison lookups with unusable entries.
    pub fn build(filesets: Vec<FilesetEntries>) -> Self {
        let mut entries = HashMap::new();
        for fileset in filesets {
            for (path, value) in fileset.members {
                if value.digest().is_none() {
                    continue;
                }
                entries.insert(path, value);
            }
        }
        Self { entries }
    }

    /// Looks up `exec_path`, which the caller has already made relative to
    /// the exec root when it falls under one (§4.F op 1, §8 S6).
    pub fn get(&self, exec_path: &Path) -> Option<FileValue> {
        self.entries.get(exec_path).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
