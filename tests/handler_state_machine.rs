/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Exercises the handler's state machine (§4.F, §8) against the in-memory
//! [`buck2_action_metadata::fs::testing::TestFileSystem`], the way
//! `buck2_common::file_ops::testing::TestFileOps` is used to drive
//! higher-level logic without touching real disk.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use assert_matches::assert_matches;
use buck2_action_metadata::fs::testing::TestFileSystem;
use buck2_action_metadata::fs::FileSystem;
use buck2_action_metadata::fileset::FilesetEntries;
use buck2_action_metadata::handler::ActionInput;
use buck2_action_metadata::handler::ActionMetadataHandler;
use buck2_action_metadata::handler::HandlerConfig;
use buck2_action_metadata::Artifact;
use buck2_action_metadata::ExecPath;
use buck2_action_metadata::FileValue;
use buck2_action_metadata::TimestampGranularityMonitor;
use buck2_action_metadata::TreeValue;

fn artifact(path: &str) -> Artifact {
    Artifact::plain_file(ExecPath::new(path).unwrap())
}

fn handler(
    fs: Arc<dyn FileSystem>,
    exec_root: &Path,
    inputs: HashMap<Artifact, FileValue>,
    outputs: HashSet<Artifact>,
) -> ActionMetadataHandler {
    ActionMetadataHandler::new(
        fs,
        exec_root.to_path_buf(),
        inputs,
        outputs,
        Vec::new(),
        HandlerConfig::default(),
        None,
    )
}

/// S1 — cache-check then execute: the store isn't populated with a stale
/// digest once the phase flips and the file changes underneath it.
#[tokio::test]
async fn cache_check_then_execute_picks_up_new_digest() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"hello".to_vec());

    let out = artifact("out/a.txt");
    let h = handler(
        fs.clone(),
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
    );

    let v1 = h.get_output_metadata(&out).await.unwrap().unwrap();
    let d1 = v1.digest().cloned().unwrap();

    h.prepare_for_action_execution().unwrap();
    fs.add_file("/root/out/a.txt", b"goodbye".to_vec());

    let v2 = h.get_output_metadata(&out).await.unwrap().unwrap();
    let d2 = v2.digest().cloned().unwrap();

    assert_ne!(d1, d2);
}

/// S2 — the default middleman sentinel is stable across repeated lookups.
#[tokio::test]
async fn middleman_default_is_idempotent() {
    let fs = Arc::new(TestFileSystem::new());
    let m = Artifact::middleman(ExecPath::new("m").unwrap());
    let h = handler(fs, Path::new("/root"), HashMap::new(), HashSet::from([m.clone()]));

    let first = h.get_output_metadata(&m).await.unwrap().unwrap();
    let second = h.get_output_metadata(&m).await.unwrap().unwrap();
    assert_eq!(first, second);
    assert_matches!(first, FileValue::Middleman { digest: None });
}

/// S3 — tree walk flattens subdirectories, keeping only file descendants.
#[tokio::test]
async fn tree_walk_flattens_subdirectories() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/dir/x/1", b"1".to_vec());
    fs.add_file("/root/out/dir/x/2", b"2".to_vec());
    fs.add_file("/root/out/dir/y/3", b"3".to_vec());

    let tree = Artifact::tree_artifact(ExecPath::new("out/dir").unwrap());
    let h = handler(
        fs,
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([tree.clone()]),
    );

    let value = h.get_tree_artifact_value(&tree).await.unwrap();
    let mut paths: Vec<PathBuf> = value
        .children
        .keys()
        .map(|a| a.exec_path().as_path().to_path_buf())
        .collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("out/dir/x/1"),
            PathBuf::from("out/dir/x/2"),
            PathBuf::from("out/dir/y/3"),
        ]
    );
}

/// S4 — an omitted tree surfaces NotFound rather than an empty tree value.
#[tokio::test]
async fn omitted_tree_is_not_found() {
    let fs = Arc::new(TestFileSystem::new());
    let tree = Artifact::tree_artifact(ExecPath::new("out/dir").unwrap());
    let h = handler(
        fs,
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([tree.clone()]),
    );

    h.prepare_for_action_execution().unwrap();
    h.mark_omitted(&tree).unwrap();

    let err = h.get_tree_artifact_value(&tree).await.unwrap_err();
    assert!(err.to_string().contains("missing or omitted"));
}

/// S5 — an injected digest that disagrees with what's on disk is a fatal
/// invariant violation; a matching one succeeds.
#[tokio::test]
async fn injected_digest_mismatch_is_invariant_violation() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"hello".to_vec());
    let out = artifact("out/a.txt");
    let h = handler(
        fs.clone(),
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
    );
    h.prepare_for_action_execution().unwrap();

    let stat = fs
        .stat(Path::new("/root/out/a.txt"), false)
        .await
        .unwrap()
        .unwrap();
    let wrong = buck2_action_metadata::Digest::from_bytes(b"not hello");
    let err = h
        .construct_metadata_for_digest(&out, stat.clone(), wrong)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invariant"));

    let right = buck2_action_metadata::Digest::from_bytes(b"hello");
    let value = h
        .construct_metadata_for_digest(&out, stat, right.clone())
        .await
        .unwrap();
    assert_eq!(value.digest(), Some(&right));
}

/// S6 — fileset members are keyed by their exec-root-relative path.
#[test]
fn fileset_passthrough_resolves_relative_to_exec_root() {
    let v = FileValue::Symlink {
        digest: buck2_action_metadata::Digest::from_bytes(b"x"),
        is_remote: false,
        materialization_exec_path: None,
    };
    let fileset_artifact = artifact("gen");
    let filesets = vec![FilesetEntries {
        artifact: fileset_artifact,
        members: vec![(PathBuf::from("gen/a"), v.clone())],
    }];
    let h = ActionMetadataHandler::new(
        Arc::new(TestFileSystem::new()),
        PathBuf::from("/exec"),
        HashMap::new(),
        HashSet::new(),
        filesets,
        HandlerConfig::default(),
        None,
    );

    let found = h
        .get_input_metadata(&ActionInput::FilesetMember(PathBuf::from("/exec/gen/a")))
        .unwrap();
    assert_eq!(found, Some(v));

    let missing = h
        .get_input_metadata(&ActionInput::FilesetMember(PathBuf::from("/exec/gen/missing")))
        .unwrap();
    assert_eq!(missing, None);
}

/// Property 1 — phase guard.
#[test]
fn injection_before_execution_phase_fails() {
    let out = artifact("out/a.txt");
    let h = ActionMetadataHandler::new(
        Arc::new(TestFileSystem::new()),
        PathBuf::from("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
        Vec::new(),
        HandlerConfig::default(),
        None,
    );

    let err = h.inject_file(&out, FileValue::Missing).unwrap_err();
    assert!(err.to_string().contains("execution phase"));

    h.prepare_for_action_execution().unwrap();
    assert!(h.inject_file(&out, FileValue::Missing).is_ok());
}

/// Property 2 — at-most-once phase transition.
#[test]
fn prepare_for_action_execution_is_at_most_once() {
    let h = ActionMetadataHandler::new(
        Arc::new(TestFileSystem::new()),
        PathBuf::from("/root"),
        HashMap::new(),
        HashSet::new(),
        Vec::new(),
        HandlerConfig::default(),
        None,
    );
    assert!(h.prepare_for_action_execution().is_ok());
    assert!(h.prepare_for_action_execution().is_err());
}

/// Property 3 — an artifact in outputs never answers `getInputMetadata`.
#[tokio::test]
async fn input_output_partition_is_respected() {
    let out = artifact("out/a.txt");
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"x".to_vec());
    let h = handler(
        fs,
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
    );
    assert_eq!(
        h.get_input_metadata(&ActionInput::Artifact(out.clone())).unwrap(),
        None
    );
    assert!(h.get_output_metadata(&out).await.unwrap().is_some());
}

/// Property 4 — round-trip for files: inject then reset falls back to a
/// fresh filesystem read.
#[tokio::test]
async fn file_round_trips_through_inject_and_reset() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"hello".to_vec());
    let out = artifact("out/a.txt");
    let h = handler(
        fs,
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
    );
    h.prepare_for_action_execution().unwrap();

    let injected = FileValue::Missing;
    h.inject_file(&out, injected.clone()).unwrap();
    let err = h.get_output_metadata(&out).await.unwrap_err();
    assert!(err.to_string().contains("missing or omitted"));

    h.reset_outputs(vec![out.clone()]).unwrap();
    let recomputed = h.get_output_metadata(&out).await.unwrap().unwrap();
    assert!(recomputed.digest().is_some());
}

/// Property 6 — omission idempotence differs between trees and plain outputs.
#[test]
fn tree_omission_is_idempotent_plain_output_is_not() {
    let tree = Artifact::tree_artifact(ExecPath::new("out/dir").unwrap());
    let plain = artifact("out/a.txt");
    let h = ActionMetadataHandler::new(
        Arc::new(TestFileSystem::new()),
        PathBuf::from("/root"),
        HashMap::new(),
        HashSet::from([tree.clone(), plain.clone()]),
        Vec::new(),
        HandlerConfig::default(),
        None,
    );
    h.prepare_for_action_execution().unwrap();

    assert!(h.mark_omitted(&tree).is_ok());
    assert!(h.mark_omitted(&tree).is_ok());

    assert!(h.mark_omitted(&plain).is_ok());
    assert!(h.mark_omitted(&plain).is_err());
}

/// Property 11 — concurrent callers of an uncached output observe equal
/// values.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_get_output_metadata_converges() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"hello".to_vec());
    let out = artifact("out/a.txt");
    let h = Arc::new(handler(
        fs,
        Path::new("/root"),
        HashMap::new(),
        HashSet::from([out.clone()]),
    ));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let out = out.clone();
        tasks.push(tokio::spawn(async move { h.get_output_metadata(&out).await.unwrap() }));
    }

    let mut results = Vec::new();
    for t in tasks {
        results.push(t.await.unwrap().unwrap());
    }
    assert!(results.windows(2).all(|w| w[0] == w[1]));
}

/// Property 5 — an injected tree round-trips through `getTreeArtifactValue`
/// and `getTreeArtifactChildren`, and an archived-representation mismatch
/// against the handler's configuration is a fatal invariant violation.
#[tokio::test]
async fn inject_tree_round_trips_and_rejects_archived_representation_mismatch() {
    let parent = Artifact::tree_artifact(ExecPath::new("out/dir").unwrap());
    let child = Artifact::tree_child(&parent, "x/1").unwrap();
    let mut children = HashMap::new();
    children.insert(
        child.clone(),
        FileValue::RegularFile {
            size: 1,
            digest: buck2_action_metadata::Digest::from_bytes(b"1"),
            contents_proxy: None,
            is_remote: false,
            materialization_exec_path: None,
        },
    );
    let tree = TreeValue {
        parent: parent.clone(),
        children: children.clone(),
        archived_representation: None,
        aggregate_digest: buck2_action_metadata::Digest::from_bytes(b"agg"),
        materialization_exec_path: None,
    };

    let h = ActionMetadataHandler::new(
        Arc::new(TestFileSystem::new()),
        PathBuf::from("/root"),
        HashMap::new(),
        HashSet::from([parent.clone()]),
        Vec::new(),
        HandlerConfig::default(),
        None,
    );
    h.prepare_for_action_execution().unwrap();

    h.inject_tree(&parent, tree.clone()).unwrap();

    let got = h.get_tree_artifact_value(&parent).await.unwrap();
    assert_eq!(got, tree);
    assert_eq!(
        h.get_tree_artifact_children(&parent),
        tree.children.keys().cloned().collect::<HashSet<_>>()
    );

    let mismatched = TreeValue {
        archived_representation: Some((
            Artifact::plain_file(ExecPath::new("out/dir.tar.zst").unwrap()),
            FileValue::Missing,
        )),
        ..tree
    };
    let err = h.inject_tree(&parent, mismatched).unwrap_err();
    assert!(err.to_string().contains("archived-representation"));
}

/// A fake monitor that records every path it was notified about, for
/// asserting on the constant-metadata suppression rule (§4.C rule 3, §6).
struct RecordingMonitor {
    notified: StdMutex<Vec<PathBuf>>,
}

impl RecordingMonitor {
    fn new() -> Self {
        Self {
            notified: StdMutex::new(Vec::new()),
        }
    }
}

impl TimestampGranularityMonitor for RecordingMonitor {
    fn notify_stat(&self, path: &Path, _mtime: SystemTime) {
        self.notified.lock().unwrap().push(path.to_path_buf());
    }
}

/// §6 — the monitor is notified for a plain output's stat, but never for a
/// constant-metadata one.
#[tokio::test]
async fn tsgm_is_notified_for_plain_output_but_not_constant_metadata() {
    let fs = Arc::new(TestFileSystem::new());
    fs.add_file("/root/out/a.txt", b"hello".to_vec());
    fs.add_file("/root/out/const.txt", b"world".to_vec());

    let plain = artifact("out/a.txt");
    let constant = Artifact::constant_metadata(ExecPath::new("out/const.txt").unwrap());

    let monitor = Arc::new(RecordingMonitor::new());
    let h = ActionMetadataHandler::new(
        fs,
        PathBuf::from("/root"),
        HashMap::new(),
        HashSet::from([plain.clone(), constant.clone()]),
        Vec::new(),
        HandlerConfig::default(),
        Some(monitor.clone() as Arc<dyn TimestampGranularityMonitor>),
    );

    h.get_output_metadata(&plain).await.unwrap();
    h.get_output_metadata(&constant).await.unwrap();

    let notified = monitor.notified.lock().unwrap();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0], PathBuf::from("/root/out/a.txt"));
}
