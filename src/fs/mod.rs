/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The filesystem abstraction (§4.A).
//!
//! Mirrors the shape of `buck2_common::io::IoProvider` / `FileOps`: a small
//! async trait the rest of the crate programs against, with a real
//! tokio-backed implementation ([`real::RealFileSystem`]) and an in-memory
//! test double ([`testing::TestFileSystem`]) for fast unit tests of the
//! handler state machine.

pub mod real;
pub mod testing;

use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use gazebo::cmp::PartialEqAny;

use crate::digest::Digest;

/// The on-disk shape a path was found to have, as reported by a no-follow
/// stat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKind {
    File,
    Directory,
    Symlink,
    /// Sockets, device files, FIFOs: things this model has no metadata shape
    /// for beyond "it's there".
    Special,
}

/// A stat result. Deliberately narrow: only the fields §3/§4.C actually
/// consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub kind: StatKind,
    pub size: u64,
    pub mtime: SystemTime,
    /// ctime, expressed as seconds since epoch; combined with `dev`/`ino`
    /// into a [`crate::file_value::ContentsProxy`].
    pub ctime: i64,
    pub dev: u64,
    pub ino: u64,
    pub executable: bool,
    /// A digest embedded by a network filesystem layer (e.g. an EdenFS-style
    /// overlay that already knows the content hash). When present, §4.C
    /// skips reading the file to compute one.
    pub embedded_digest: Option<Digest>,
    /// Set when the filesystem layer knows this content is backed by a
    /// remote store rather than genuinely local bytes.
    pub is_remote: bool,
}

/// A single entry observed during a [`FileSystem::visit_tree_in_parallel`]
/// walk, relative to the root that was walked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitedEntry {
    pub relative_path: PathBuf,
    pub kind: StatKind,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns `None` if `path` does not exist. `follow_symlinks = false`
    /// reports the symlink itself (`StatKind::Symlink`) rather than its
    /// target.
    async fn stat(&self, path: &Path, follow_symlinks: bool) -> anyhow::Result<Option<Stat>>;

    /// Fully resolves `path` through any chain of symlinks. Must detect
    /// cycles; callers treat `real_path == path` (no-follow) as the cycle
    /// signal per §4.C rule 4 / §9.
    async fn readlink_and_resolve(&self, path: &Path) -> anyhow::Result<PathBuf>;

    /// Reads the raw target of a symlink without resolving it further.
    async fn read_link(&self, path: &Path) -> anyhow::Result<PathBuf>;

    /// Best-effort, idempotent.
    fn chmod(&self, path: &Path, executable: bool) -> anyhow::Result<()>;

    /// Recursively walks `root`, returning every descendant (files,
    /// directories, symlinks) with internal parallelism across
    /// subdirectories. Returns an empty list if `root` does not exist.
    async fn visit_tree_in_parallel(&self, root: &Path) -> anyhow::Result<Vec<VisitedEntry>>;

    /// A fast digest hint read from extended attributes, when the platform
    /// and filesystem support it.
    fn read_xattr_digest(&self, path: &Path) -> Option<Digest>;

    fn eq_token(&self) -> PartialEqAny<'_>;
}

impl PartialEq for dyn FileSystem {
    fn eq(&self, other: &dyn FileSystem) -> bool {
        self.eq_token() == other.eq_token()
    }
}
