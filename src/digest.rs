/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Content digests (§4.B "Digest utility").
//!
//! Grounded on `buck2_common::file_ops::FileDigest`: sha1 over the file
//! contents, with a fast xattr-hint path tried first by the caller (the
//! file-value factory, §4.C) before falling back to reading the file here.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use dupe::Dupe;
use sha1::Digest as _;
use sha1::Sha1;

pub const SHA1_SIZE: usize = 20;

/// A content digest. Cheap to clone (`Arc<[u8]>` underneath).
#[derive(Clone, Dupe, PartialEq, Eq, Hash)]
pub struct Digest(Arc<[u8]>);

impl Digest {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut h = Sha1::new();
        h.update(bytes);
        Self(Arc::from(h.finalize().as_slice()))
    }

    pub fn from_raw_sha1(bytes: [u8; SHA1_SIZE]) -> Self {
        Self(Arc::from(&bytes[..]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Reads `path` from disk and returns its content digest. `size_hint`, when
/// available from a prior stat, is used only to preallocate the read buffer's
/// backing allocation pattern decision (small vs large file); it is never
/// trusted for correctness — the digest always reflects exactly what was
/// read, regardless of whether it matches `size_hint`.
pub fn digest_of_file(path: &Path, size_hint: Option<u64>) -> std::io::Result<Digest> {
    let mut f = File::open(path)?;
    let mut h = Sha1::new();

    // Buffer size is independent of size_hint: a stale or wrong hint must
    // never change what we compute, only how eagerly we grow the buffer.
    let buffer_len = match size_hint {
        Some(n) if n < 64 * 1024 => 16 * 1024,
        _ => 64 * 1024,
    };
    let mut buffer = vec![0u8; buffer_len];

    loop {
        let count = f.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        h.update(&buffer[..count]);
    }

    Ok(Digest(Arc::from(h.finalize().as_slice())))
}
