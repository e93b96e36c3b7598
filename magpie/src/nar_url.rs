//! NAR URLs.
//!
//! A NAR is addressed by a relative URL of the form:
//!
//! ```text
//! nar/{hash}.nar[.{ext}][?{query}]
//! ```
//!
//! The hash is 32 or 52 Nix base32 characters, or 64 hexadecimal
//! characters. Some upstream caches historically prefix it with the
//! narinfo hash (`{narinfoHash}-{narHash}.nar.xz`); [`NarUrl::normalize`]
//! strips that prefix so local storage is keyed by the bare hash.
//!
//! The extension maps to a closed set of compression algorithms, the
//! same set Nix itself emits.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MagpieError, MagpieResult};
use crate::hash;

/// NAR compression type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "bzip2")]
    Bzip2,
    #[serde(rename = "zstd")]
    Zstd,
    #[serde(rename = "lzip")]
    Lzip,
    #[serde(rename = "lz4")]
    Lz4,
    #[serde(rename = "br")]
    Brotli,
    #[serde(rename = "xz")]
    Xz,
}

/// A relative URL referencing a NAR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarUrl {
    /// The hash portion of the file name.
    ///
    /// May still carry a narinfo-hash prefix until [`NarUrl::normalize`]
    /// is called.
    pub hash: String,

    /// Compression, as implied by the file extension.
    pub compression: Compression,

    /// Query string, without the leading `?`.
    pub query: Option<String>,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
            Self::Lzip => "lzip",
            Self::Lz4 => "lz4",
            Self::Brotli => "br",
            Self::Xz => "xz",
        }
    }

    /// Returns the file extension for this compression, if any.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Bzip2 => Some("bz2"),
            Self::Zstd => Some("zst"),
            Self::Lzip => Some("lzip"),
            Self::Lz4 => Some("lz4"),
            Self::Brotli => Some("br"),
            Self::Xz => Some("xz"),
        }
    }

    /// Maps a file extension back to a compression type.
    pub fn from_extension(ext: &str) -> MagpieResult<Self> {
        match ext {
            "bz2" => Ok(Self::Bzip2),
            "zst" => Ok(Self::Zstd),
            "lzip" => Ok(Self::Lzip),
            "lz4" => Ok(Self::Lz4),
            "br" => Ok(Self::Brotli),
            "xz" => Ok(Self::Xz),
            _ => Err(MagpieError::InvalidCompressionType {
                name: ext.to_string(),
            }),
        }
    }
}

impl FromStr for Compression {
    type Err = MagpieError;

    fn from_str(s: &str) -> MagpieResult<Self> {
        match s {
            "none" => Ok(Self::None),
            "bzip2" => Ok(Self::Bzip2),
            "zstd" => Ok(Self::Zstd),
            "lzip" => Ok(Self::Lzip),
            "lz4" => Ok(Self::Lz4),
            "br" => Ok(Self::Brotli),
            "xz" => Ok(Self::Xz),
            _ => Err(MagpieError::InvalidCompressionType {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NarUrl {
    /// Creates a NAR URL from an already-validated hash.
    pub fn new(hash: String, compression: Compression) -> MagpieResult<Self> {
        validate_lenient(&hash)?;

        Ok(Self {
            hash,
            compression,
            query: None,
        })
    }

    /// Parses a relative NAR URL.
    pub fn parse(s: &str) -> MagpieResult<Self> {
        let invalid = |reason| MagpieError::InvalidNarUrl {
            url: s.to_string(),
            reason,
        };

        let (path, query) = match s.split_once('?') {
            Some((path, "")) => (path, None),
            Some((path, query)) => (path, Some(query.to_string())),
            None => (s, None),
        };

        let file = path
            .strip_prefix("nar/")
            .ok_or_else(|| invalid("must start with nar/"))?;

        if file.contains('/') {
            return Err(invalid("file name must not contain a slash"));
        }

        let (hash, rest) = file
            .split_once(".nar")
            .ok_or_else(|| invalid("file name must contain .nar"))?;

        let compression = match rest {
            "" => Compression::None,
            _ => {
                let ext = rest
                    .strip_prefix('.')
                    .ok_or_else(|| invalid("junk after .nar"))?;
                Compression::from_extension(ext)?
            }
        };

        validate_lenient(hash)?;

        Ok(Self {
            hash: hash.to_string(),
            compression,
            query,
        })
    }

    /// Returns the file name, `{hash}.nar[.{ext}]`.
    pub fn file_name(&self) -> String {
        match self.compression.extension() {
            Some(ext) => format!("{}.nar.{}", self.hash, ext),
            None => format!("{}.nar", self.hash),
        }
    }

    /// Joins this URL onto an upstream base URL.
    ///
    /// Query parameters already present on the base are preserved and
    /// concatenated with ours.
    pub fn join_url(&self, base: &str) -> String {
        let (base_path, base_query) = match base.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (base, None),
        };

        let mut url = format!("{}/nar/{}", base_path.trim_end_matches('/'), self.file_name());

        match (base_query, self.query.as_deref()) {
            (Some(a), Some(b)) => {
                url.push('?');
                url.push_str(a);
                url.push('&');
                url.push_str(b);
            }
            (Some(q), None) | (None, Some(q)) => {
                url.push('?');
                url.push_str(q);
            }
            (None, None) => {}
        }

        url
    }

    /// Computes the sharded storage path, `{h[0]}/{h[0..2]}/{file_name}`.
    ///
    /// The hash must be in normalized form.
    pub fn file_path(&self) -> MagpieResult<PathBuf> {
        if self.hash.len() < 3 {
            return Err(MagpieError::InvalidHash {
                hash: self.hash.clone(),
                reason: "too short to shard",
            });
        }
        hash::validate_nar_hash(&self.hash)?;

        let mut path = PathBuf::from(&self.hash[0..1]);
        path.push(&self.hash[0..2]);
        path.push(self.file_name());

        Ok(path)
    }

    /// Returns a normalized copy with any narinfo-hash prefix stripped.
    ///
    /// Upstreams historically serve NARs under
    /// `nar/{narinfoHash}-{narHash}.nar.xz`; locally we key on the bare
    /// NAR hash. The stripped result is re-validated against the hash
    /// regexes and checked for traversal fragments, since this struct is
    /// constructible with arbitrary strings.
    pub fn normalize(&self) -> MagpieResult<Self> {
        let mut hash = self.hash.as_str();

        if hash.len() > 33 {
            let (prefix, rest) = hash.split_at(32);
            if hash::validate_narinfo_hash(prefix).is_ok() {
                if let Some(suffix) = rest.strip_prefix(['-', '_']) {
                    if !suffix.is_empty() {
                        hash = suffix;
                    }
                }
            }
        }

        if hash.starts_with('/') || hash.contains('/') || hash.contains("..") {
            return Err(MagpieError::InvalidHash {
                hash: hash.to_string(),
                reason: "path traversal artifact",
            });
        }

        hash::validate_nar_hash(hash)?;

        Ok(Self {
            hash: hash.to_string(),
            compression: self.compression,
            query: self.query.clone(),
        })
    }
}

impl fmt::Display for NarUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nar/{}", self.file_name())?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for NarUrl {
    type Err = MagpieError;

    fn from_str(s: &str) -> MagpieResult<Self> {
        Self::parse(s)
    }
}

/// Accepts normalized hashes as well as the prefixed upstream-historical form.
fn validate_lenient(h: &str) -> MagpieResult<()> {
    if hash::validate_nar_hash(h).is_ok() {
        return Ok(());
    }

    if h.len() > 33 {
        let (prefix, rest) = h.split_at(32);
        if hash::validate_narinfo_hash(prefix).is_ok() {
            if let Some(suffix) = rest.strip_prefix(['-', '_']) {
                return hash::validate_nar_hash(suffix);
            }
        }
    }

    Err(MagpieError::InvalidHash {
        hash: h.to_string(),
        reason: "not a valid NAR hash",
    })
}
