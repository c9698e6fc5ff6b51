//! Integrity: whole-file MD5 digest, hex encoded, compared case-insensitively.

use std::fmt::Write as _;
use std::io::{self, Read};

use md5::{Digest, Md5};

/// Length of a hex-encoded digest.
pub const DIGEST_HEX_LEN: usize = 32;

const READ_BUF: usize = 4096;

/// Hex digest of an in-memory buffer.
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

/// Hex digest of everything `reader` yields.
pub fn digest_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Incremental digest, fed block by block while a file is chunked.
#[derive(Default)]
pub struct StreamingDigest {
    hasher: Md5,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish_hex(self) -> String {
        to_hex(&self.hasher.finalize())
    }
}

/// Compare a locally computed digest with one received on the wire.
pub fn digest_matches(computed: &str, received: &str) -> bool {
    computed.eq_ignore_ascii_case(received.trim())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
