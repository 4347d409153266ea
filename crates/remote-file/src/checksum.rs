use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::error::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Digest algorithms a checksum may be declared with.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumKind {
    pub const ALL: &'static [ChecksumKind] = &[
        ChecksumKind::Md5,
        ChecksumKind::Sha1,
        ChecksumKind::Sha224,
        ChecksumKind::Sha256,
        ChecksumKind::Sha384,
        ChecksumKind::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding of a digest of this kind.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha224 => 56,
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    pub fn digest_reader<R: Read>(self, reader: R) -> io::Result<String> {
        match self {
            Self::Md5 => stream::<md5::Md5, R>(reader),
            Self::Sha1 => stream::<sha1::Sha1, R>(reader),
            Self::Sha224 => stream::<sha2::Sha224, R>(reader),
            Self::Sha256 => stream::<sha2::Sha256, R>(reader),
            Self::Sha384 => stream::<sha2::Sha384, R>(reader),
            Self::Sha512 => stream::<sha2::Sha512, R>(reader),
        }
    }

    pub fn digest_bytes(self, data: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(md5::Md5::digest(data)),
            Self::Sha1 => hex::encode(sha1::Sha1::digest(data)),
            Self::Sha224 => hex::encode(sha2::Sha224::digest(data)),
            Self::Sha256 => hex::encode(sha2::Sha256::digest(data)),
            Self::Sha384 => hex::encode(sha2::Sha384::digest(data)),
            Self::Sha512 => hex::encode(sha2::Sha512::digest(data)),
        }
    }

    pub fn digest_file(self, path: &Path) -> Result<String> {
        let file = fs::File::open(path)
            .map_err(|e| Error::io(format!("failed to open {}", path.display()), e))?;
        self.digest_reader(file)
            .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::UnsupportedAlgorithm(wanted.to_string()))
    }
}

fn stream<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest `path` with the algorithm called `algorithm`.
pub fn digest(algorithm: &str, path: &Path) -> Result<String> {
    algorithm.parse::<ChecksumKind>()?.digest_file(path)
}

pub fn known_algorithms() -> BTreeSet<&'static str> {
    ChecksumKind::ALL.iter().map(|k| k.name()).collect()
}

/// Hex digests compare case-insensitively.
pub fn matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// A declared checksum: the algorithm and the expected hex digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: ChecksumKind,
    pub expected: String,
}

impl Checksum {
    pub fn new(kind: ChecksumKind, expected: impl Into<String>) -> Self {
        Self {
            kind,
            expected: expected.into().trim().to_ascii_lowercase(),
        }
    }

    /// Digest of the file at `path`, or `None` when it does not exist.
    pub fn current(&self, path: &Path) -> Result<Option<String>> {
        if !path.is_file() {
            return Ok(None);
        }
        self.kind.digest_file(path).map(Some)
    }

    pub fn is_satisfied_by(&self, actual: &str) -> bool {
        matches(&self.expected, actual)
    }
}
