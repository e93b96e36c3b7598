//! Hashing utilities.
//!
//! Artifacts are addressed by two kinds of hash strings:
//!
//! - The 32-character Nix base32 hash of a store path, used to key
//!   `.narinfo` documents.
//! - The hash embedded in a NAR URL, either 52 base32 characters or
//!   64 hexadecimal characters (both encode a SHA-256 digest).
//!
//! `Hash` is the typed digest carried in `FileHash`/`NarHash` fields.

use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{MagpieError, MagpieResult};

lazy_static! {
    static ref NARINFO_HASH_REGEX: Regex = Regex::new(r"^[0-9a-df-np-sv-z]{32}$").unwrap();
    static ref NAR_HASH_REGEX: Regex =
        Regex::new(r"^([0-9a-df-np-sv-z]{32}|[0-9a-df-np-sv-z]{52}|[0-9a-f]{64})$").unwrap();
}

/// A hashing error.
#[derive(Debug, Display)]
pub enum Error {
    /// The string lacks a colon separator.
    NoColonSeparator,

    /// Hash algorithm {0} is not supported.
    UnsupportedHashAlgorithm(String),

    /// Invalid base16 hash: {0}
    InvalidBase16Hash(hex::FromHexError),

    /// Invalid base32 hash.
    InvalidBase32Hash,

    /// Invalid length for {typ} string: Must be either {base16_len} (hexadecimal) or {base32_len} (base32), got {actual}.
    InvalidHashStringLength {
        typ: &'static str,
        base16_len: usize,
        base32_len: usize,
        actual: usize,
    },
}

impl std::error::Error for Error {}

/// Validates the 32-character base32 hash that keys a narinfo.
pub fn validate_narinfo_hash(hash: &str) -> MagpieResult<()> {
    if NARINFO_HASH_REGEX.is_match(hash) {
        Ok(())
    } else {
        Err(MagpieError::InvalidHash {
            hash: hash.to_string(),
            reason: "must be 32 base32 characters",
        })
    }
}

/// Validates a normalized NAR hash.
///
/// Accepts 32 or 52 base32 characters, or 64 hexadecimal characters.
/// Prefixed upstream-historical forms must be normalized first.
pub fn validate_nar_hash(hash: &str) -> MagpieResult<()> {
    if NAR_HASH_REGEX.is_match(hash) {
        Ok(())
    } else {
        Err(MagpieError::InvalidHash {
            hash: hash.to_string(),
            reason: "must be 32 or 52 base32 characters, or 64 hexadecimal characters",
        })
    }
}

/// A typed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hash {
    /// An SHA-256 hash.
    Sha256([u8; 32]),
}

impl Hash {
    /// Convenience function to generate a SHA-256 hash from a slice.
    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Parses a typed representation of a hash, like `sha256:1w1ff...`.
    pub fn from_typed(s: &str) -> MagpieResult<Self> {
        let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

        let (typ, rest) = s.split_at(colon);
        let hash = &rest[1..];

        match typ {
            "sha256" => {
                let v = decode_hash(hash, "SHA-256", 32)?;
                Ok(Self::Sha256(v.try_into().unwrap()))
            }
            _ => Err(Error::UnsupportedHashAlgorithm(typ.to_owned()).into()),
        }
    }

    /// Returns the hash in Nix-specific Base32 format, with the hash type prepended.
    ///
    /// This is the representation used in narinfo documents.
    pub fn to_typed_base32(&self) -> String {
        format!("{}:{}", self.hash_type(), self.to_base32())
    }

    /// Returns the hash in hexadecimal format, with the hash type prepended.
    ///
    /// This is the canonical representation in the metadata index.
    pub fn to_typed_base16(&self) -> String {
        format!("{}:{}", self.hash_type(), hex::encode(self.data()))
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Sha256(d) => d,
        }
    }

    fn hash_type(&self) -> &'static str {
        match self {
            Self::Sha256(_) => "sha256",
        }
    }

    fn to_base32(&self) -> String {
        nix_base32::to_nix_base32(self.data())
    }
}

/// Decodes a base16 or base32 encoded hash containing a specified number of bytes.
fn decode_hash(s: &str, typ: &'static str, expected_bytes: usize) -> MagpieResult<Vec<u8>> {
    let base16_len = expected_bytes * 2;
    let base32_len = (expected_bytes * 8 - 1) / 5 + 1;

    let v = if s.len() == base16_len {
        hex::decode(s).map_err(Error::InvalidBase16Hash)?
    } else if s.len() == base32_len {
        nix_base32::from_nix_base32(s).ok_or(Error::InvalidBase32Hash)?
    } else {
        return Err(Error::InvalidHashStringLength {
            typ,
            base16_len,
            base32_len,
            actual: s.len(),
        }
        .into());
    };

    assert!(v.len() == expected_bytes);

    Ok(v)
}
