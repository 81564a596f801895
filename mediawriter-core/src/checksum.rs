//! Incremental checksum accumulator shared by the downloader and the media
//! verifier.
//!
//! A [`Checksum`] is append-only: bytes are folded in with
//! [`Checksum::update`] and the digest only exists after
//! [`Checksum::finalize`] consumes the accumulator.
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum '{0}' is not a hexadecimal string")]
    NotHex(String),

    #[error("checksum has {0} hex digits; expected 32 (MD5) or 64 (SHA-256)")]
    UnsupportedLength(usize),
}

/// Digest algorithms the catalog publishes checksums in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Picks the algorithm from the length of a hex digest.
    pub fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha256 => write!(f, "SHA-256"),
        }
    }
}

/// An expected digest as supplied by the caller, validated up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ExpectedChecksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Case-insensitive, otherwise byte-exact comparison.
    pub fn matches(&self, computed: &str) -> bool {
        self.hex.eq_ignore_ascii_case(computed)
    }

    /// Starts an accumulator for this checksum's algorithm.
    pub fn accumulator(&self) -> Checksum {
        Checksum::new(self.algorithm)
    }
}

impl FromStr for ExpectedChecksum {
    type Err = ChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ChecksumError::NotHex(hex.to_string()));
        }
        let algorithm = ChecksumAlgorithm::from_hex_len(hex.len())
            .ok_or(ChecksumError::UnsupportedLength(hex.len()))?;
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl fmt::Display for ExpectedChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.hex)
    }
}

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

/// Append-only hash accumulator.
pub struct Checksum {
    hasher: Hasher,
    bytes: u64,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        let hasher = match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        };
        Self { hasher, bytes: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
        self.bytes += data.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Produces the lowercase hex digest.
    pub fn finalize(self) -> String {
        match self.hasher {
            Hasher::Md5(h) => format!("{:x}", h.finalize()),
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}
