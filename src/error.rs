/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Error kinds surfaced by the action metadata handler (see §7 of the design doc).

use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::Artifact;

/// The closed set of error kinds the handler itself raises. Everything else (a
/// filesystem call failing for a reason we don't special-case) is wrapped as
/// [`MetadataError::Io`] and propagated with `anyhow::Context`.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata for `{artifact}` was requested but it is missing or omitted")]
    NotFound { artifact: Artifact },

    #[error("i/o error accessing `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symlink cycle detected resolving `{}`", path.display())]
    SymlinkCycle { path: PathBuf },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("operation interrupted")]
    Interrupted,
}

impl MetadataError {
    pub fn not_found(artifact: Artifact) -> Self {
        Self::NotFound { artifact }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invariant(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(Self::InvariantViolation(msg.into()))
    }
}
