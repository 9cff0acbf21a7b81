/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Action metadata handling: resolving, caching, producing, and validating
//! filesystem metadata for a build action's declared inputs and outputs
//! across the cache-check and execution phases of that action's lifecycle.

pub mod artifact;
pub mod digest;
pub mod error;
pub mod file_value;
pub mod fileset;
pub mod fs;
pub mod handler;
pub mod output_store;
pub mod tree_value;
pub mod tsgm;

pub use artifact::Artifact;
pub use artifact::ArtifactKind;
pub use artifact::ExecPath;
pub use digest::Digest;
pub use error::MetadataError;
pub use file_value::BuiltFileValue;
pub use file_value::ContentsProxy;
pub use file_value::FileValue;
pub use fileset::FilesetEntries;
pub use fileset::FilesetMapping;
pub use fs::FileSystem;
pub use fs::Stat;
pub use fs::StatKind;
pub use fs::VisitedEntry;
pub use handler::ActionInput;
pub use handler::ActionMetadataHandler;
pub use handler::HandlerConfig;
pub use handler::OutputPermissions;
pub use output_store::OutputStore;
pub use tree_value::TreeBuildContext;
pub use tree_value::TreeMetadata;
pub use tree_value::TreeValue;
pub use tsgm::TimestampGranularityMonitor;
