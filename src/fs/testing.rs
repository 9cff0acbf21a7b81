/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! An in-memory [`FileSystem`] double, grounded on
//! `buck2_common::file_ops::testing::TestFileOps`: good enough to drive the
//! handler's state machine in unit tests without touching real disk I/O.
//! Integration tests that need genuine stat/digest/symlink semantics use
//! [`super::real::RealFileSystem`] against a `tempfile::TempDir` instead.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use gazebo::cmp::PartialEqAny;
use parking_lot::Mutex;

use super::FileSystem;
use super::Stat;
use super::StatKind;
use super::VisitedEntry;
use crate::digest::Digest;
use crate::error::MetadataError;

enum TestEntry {
    File {
        data: Vec<u8>,
        executable: bool,
        embedded_digest: Option<Digest>,
        is_remote: bool,
    },
    Symlink {
        target: PathBuf,
    },
    Directory,
}

pub struct TestFileSystem {
    entries: Mutex<BTreeMap<PathBuf, TestEntry>>,
}

impl TestFileSystem {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn ensure_parents(entries: &mut BTreeMap<PathBuf, TestEntry>, path: &Path) {
        let mut cur = path;
        while let Some(parent) = cur.parent() {
            if parent.as_os_str().is_empty() {
                break;
            }
            entries.entry(parent.to_path_buf()).or_insert(TestEntry::Directory);
            cur = parent;
        }
    }

    pub fn add_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        self.add_file_ex(path, data, false, None, false)
    }

    pub fn add_file_ex(
        &self,
        path: impl AsRef<Path>,
        data: impl Into<Vec<u8>>,
        executable: bool,
        embedded_digest: Option<Digest>,
        is_remote: bool,
    ) {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.entries.lock();
        Self::ensure_parents(&mut entries, &path);
        entries.insert(
            path,
            TestEntry::File {
                data: data.into(),
                executable,
                embedded_digest,
                is_remote,
            },
        );
    }

    pub fn add_symlink(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        let mut entries = self.entries.lock();
        Self::ensure_parents(&mut entries, &path);
        entries.insert(
            path,
            TestEntry::Symlink {
                target: target.as_ref().to_path_buf(),
            },
        );
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.entries.lock().remove(path.as_ref());
    }
}

impl Default for TestFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for TestFileSystem {
    async fn stat(&self, path: &Path, follow_symlinks: bool) -> anyhow::Result<Option<Stat>> {
        let entries = self.entries.lock();
        let mut current = path.to_path_buf();
        let mut hops = 0;
        loop {
            let entry = match entries.get(&current) {
                Some(e) => e,
                None => return Ok(None),
            };
            match entry {
                TestEntry::Directory => {
                    return Ok(Some(Stat {
                        kind: StatKind::Directory,
                        size: 0,
                        mtime: SystemTime::UNIX_EPOCH,
                        ctime: 0,
                        dev: 1,
                        ino: current_ino(&current),
                        executable: false,
                        embedded_digest: None,
                        is_remote: false,
                    }));
                }
                TestEntry::File {
                    data,
                    executable,
                    embedded_digest,
                    is_remote,
                } => {
                    return Ok(Some(Stat {
                        kind: StatKind::File,
                        size: data.len() as u64,
                        mtime: SystemTime::UNIX_EPOCH,
                        ctime: 0,
                        dev: 1,
                        ino: current_ino(&current),
                        executable: *executable,
                        embedded_digest: embedded_digest.clone(),
                        is_remote: *is_remote,
                    }));
                }
                TestEntry::Symlink { target } => {
                    if !follow_symlinks {
                        return Ok(Some(Stat {
                            kind: StatKind::Symlink,
                            size: 0,
                            mtime: SystemTime::UNIX_EPOCH,
                            ctime: 0,
                            dev: 1,
                            ino: current_ino(&current),
                            executable: false,
                            embedded_digest: None,
                            is_remote: false,
                        }));
                    }
                    hops += 1;
                    if hops > 64 {
                        return Err(MetadataError::SymlinkCycle { path: path.to_path_buf() }.into());
                    }
                    current = resolve_one(&current, target);
                }
            }
        }
    }

    async fn readlink_and_resolve(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let entries = self.entries.lock();
        let mut current = path.to_path_buf();
        let mut visited = BTreeSet::new();
        loop {
            match entries.get(&current) {
                Some(TestEntry::Symlink { target }) => {
                    if !visited.insert(current.clone()) {
                        return Err(MetadataError::SymlinkCycle { path: path.to_path_buf() }.into());
                    }
                    current = resolve_one(&current, target);
                }
                _ => return Ok(current),
            }
        }
    }

    async fn read_link(&self, path: &Path) -> anyhow::Result<PathBuf> {
        let entries = self.entries.lock();
        match entries.get(path) {
            Some(TestEntry::Symlink { target }) => Ok(target.clone()),
            _ => Err(anyhow::anyhow!("`{}` is not a symlink", path.display())),
        }
    }

    fn chmod(&self, path: &Path, executable: bool) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        if let Some(TestEntry::File { executable: e, .. }) = entries.get_mut(path) {
            *e = executable;
        }
        Ok(())
    }

    async fn visit_tree_in_parallel(&self, root: &Path) -> anyhow::Result<Vec<VisitedEntry>> {
        let entries = self.entries.lock();
        if !entries.contains_key(root) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for (path, entry) in entries.iter() {
            if let Ok(rel) = path.strip_prefix(root) {
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let kind = match entry {
                    TestEntry::Directory => StatKind::Directory,
                    TestEntry::File { .. } => StatKind::File,
                    TestEntry::Symlink { .. } => StatKind::Symlink,
                };
                out.push(VisitedEntry {
                    relative_path: rel.to_path_buf(),
                    kind,
                });
            }
        }
        Ok(out)
    }

    fn read_xattr_digest(&self, path: &Path) -> Option<Digest> {
        let entries = self.entries.lock();
        match entries.get(path) {
            Some(TestEntry::File { embedded_digest, .. }) => embedded_digest.clone(),
            _ => None,
        }
    }

    fn eq_token(&self) -> PartialEqAny<'_> {
        PartialEqAny::always_false()
    }
}

fn resolve_one(from: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        target.to_path_buf()
    } else {
        from.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf())
    }
}

/// A stable, fake inode derived from the path, so tests can assert on
/// contents-proxy equality/inequality without real filesystem inodes.
fn current_ino(path: &Path) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hash;
    use std::hash::Hasher;
    let mut h = DefaultHasher::new();
    path.hash(&mut h);
    h.finish()
}
