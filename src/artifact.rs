/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! The artifact identity model (§3 "Artifact").
//!
//! Real buck2 roots this in a whole cell/package/path hierarchy
//! (`buck2_core::fs::paths`); a standalone crate doesn't need that generality,
//! so an artifact here is just a validated relative path plus a shape tag. The
//! shape tag captures everything §3 says artifacts must disambiguate.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dupe::Dupe;

/// A path relative to the action's exec root. Never absolute, never escapes
/// upward (`..`), stored with forward slashes for stable hashing across
/// platforms.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecPath(PathBuf);

impl ExecPath {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.is_relative(), "exec path `{}` is not relative", path.display());
        anyhow::ensure!(
            !path.components().any(|c| matches!(c, std::path::Component::ParentDir)),
            "exec path `{}` escapes its root",
            path.display()
        );
        Ok(Self(path.to_path_buf()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Builds the exec path of a tree child: `self` must be a tree artifact's
    /// exec path, `rel` the path of the child relative to the tree's root.
    pub fn join_child(&self, rel: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::new(self.0.join(rel.as_ref()))
    }

}

/// `path` expressed relative to `root`, or `path` unchanged if it doesn't
/// fall under `root`. Used to compute "materialization exec path" fields
/// when a stat-through-symlink resolves to remote content.
pub fn strip_root(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).map(|p| p.to_path_buf()).unwrap_or_else(|_| path.to_path_buf())
}

impl fmt::Display for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// The artifact shapes §3 requires the core to distinguish.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// A plain, non-directory output (or input) whose path is expected to
    /// hold regular file content once produced.
    PlainFile,
    /// A declared output whose executor contract is "create a symlink here";
    /// the handler never stats through it, only reads the link target.
    SymlinkArtifact,
    /// A declared output directory whose file list is discovered after
    /// execution.
    TreeArtifact,
    /// A named file beneath a tree artifact. Carries a back-reference to its
    /// parent tree so the handler can route `getOutputMetadata` calls without
    /// a shared mutable pointer cycle (the parent never points back at its
    /// children; the output set is the single source of truth).
    TreeChild { parent: Artifact },
    /// An opaque aggregation marker with no on-disk representation of its
    /// own.
    Middleman,
    /// A plain output whose mtime is intentionally not meaningful and must
    /// never be reported to (or monitored by) the timestamp-granularity
    /// monitor.
    ConstantMetadata,
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct ArtifactInner {
    exec_path: ExecPath,
    kind: ArtifactKind,
}

/// An opaque build-system identity for a file or directory. Cheap to clone
/// (an `Arc` underneath); value-equal by identity, per §3.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Dupe)]
pub struct Artifact(Arc<ArtifactInner>);

impl Artifact {
    pub fn new(exec_path: ExecPath, kind: ArtifactKind) -> Self {
        Self(Arc::new(ArtifactInner { exec_path, kind }))
    }

    pub fn plain_file(exec_path: ExecPath) -> Self {
        Self::new(exec_path, ArtifactKind::PlainFile)
    }

    pub fn symlink_artifact(exec_path: ExecPath) -> Self {
        Self::new(exec_path, ArtifactKind::SymlinkArtifact)
    }

    pub fn tree_artifact(exec_path: ExecPath) -> Self {
        Self::new(exec_path, ArtifactKind::TreeArtifact)
    }

    pub fn middleman(exec_path: ExecPath) -> Self {
        Self::new(exec_path, ArtifactKind::Middleman)
    }

    pub fn constant_metadata(exec_path: ExecPath) -> Self {
        Self::new(exec_path, ArtifactKind::ConstantMetadata)
    }

    /// Constructs the tree-child artifact for `rel` beneath `parent` (which
    /// must itself be a tree artifact).
    pub fn tree_child(parent: &Artifact, rel: impl AsRef<Path>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            parent.is_tree_artifact(),
            "tree child's parent `{}` is not a tree artifact",
            parent.exec_path()
        );
        let exec_path = parent.exec_path().join_child(rel)?;
        Ok(Self::new(
            exec_path,
            ArtifactKind::TreeChild {
                parent: parent.dupe(),
            },
        ))
    }

    pub fn exec_path(&self) -> &ExecPath {
        &self.0.exec_path
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.0.kind
    }

    pub fn is_tree_artifact(&self) -> bool {
        matches!(self.kind(), ArtifactKind::TreeArtifact)
    }

    pub fn is_tree_child(&self) -> bool {
        matches!(self.kind(), ArtifactKind::TreeChild { .. })
    }

    pub fn is_middleman(&self) -> bool {
        matches!(self.kind(), ArtifactKind::Middleman)
    }

    pub fn is_symlink_artifact(&self) -> bool {
        matches!(self.kind(), ArtifactKind::SymlinkArtifact)
    }

    pub fn is_constant_metadata(&self) -> bool {
        matches!(self.kind(), ArtifactKind::ConstantMetadata)
    }

    /// The parent tree artifact, for a tree child. `None` for every other
    /// shape.
    pub fn tree_parent(&self) -> Option<&Artifact> {
        match self.kind() {
            ArtifactKind::TreeChild { parent } => Some(parent),
            _ => None,
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exec_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_path_rejects_absolute_and_escaping() {
        assert!(ExecPath::new("/abs").is_err());
        assert!(ExecPath::new("../escape").is_err());
        assert!(ExecPath::new("out/a.txt").is_ok());
    }

    #[test]
    fn tree_child_requires_tree_parent() {
        let plain = Artifact::plain_file(ExecPath::new("out/a.txt").unwrap());
        assert!(Artifact::tree_child(&plain, "x").is_err());

        let tree = Artifact::tree_artifact(ExecPath::new("out/dir").unwrap());
        let child = Artifact::tree_child(&tree, "x/1").unwrap();
        assert_eq!(child.exec_path().as_path(), Path::new("out/dir/x/1"));
        assert_eq!(child.tree_parent().unwrap(), &tree);
    }

    #[test]
    fn artifacts_are_value_equal() {
        let a1 = Artifact::plain_file(ExecPath::new("out/a.txt").unwrap());
        let a2 = Artifact::plain_file(ExecPath::new("out/a.txt").unwrap());
        assert_eq!(a1, a2);
    }
}
