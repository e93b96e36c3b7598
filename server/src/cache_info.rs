//! The `nix-cache-info` document.
//!
//! Every binary cache serves a small manifest at `/nix-cache-info`:
//!
//! ```text
//! StoreDir: /nix/store
//! WantMassQuery: 1
//! Priority: 40
//! ```
//!
//! We both serve one (with a fixed priority of 10, so substituters
//! prefer the local proxy) and parse the ones served by upstreams to
//! rank them.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ServerError, ServerResult};
use magpie::mime;

/// The priority advertised by this proxy.
pub const OWN_PRIORITY: u64 = 10;

/// The priority assumed for an upstream that does not advertise one.
///
/// cache.nixos.org answers 40; a cache that omits the field is treated
/// the same way.
pub const DEFAULT_PRIORITY: u64 = 40;

/// Nix cache information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NixCacheInfo {
    /// The Nix store path this binary cache uses.
    pub store_dir: PathBuf,

    /// Whether this binary cache supports bulk queries.
    pub want_mass_query: bool,

    /// The priority of the binary cache.
    ///
    /// A lower number denotes a higher priority.
    pub priority: u64,
}

impl NixCacheInfo {
    /// The document served by this proxy.
    pub fn own() -> Self {
        Self {
            store_dir: PathBuf::from("/nix/store"),
            want_mass_query: true,
            priority: OWN_PRIORITY,
        }
    }

    /// Parses a `nix-cache-info` document.
    ///
    /// Absent fields fall back to their conventional values; unknown
    /// keys are ignored.
    pub fn from_str(document: &str) -> ServerResult<Self> {
        let invalid = |reason: &str| ServerError::InvalidCacheInfo {
            reason: reason.to_string(),
        };

        let mut info = Self {
            store_dir: PathBuf::from("/nix/store"),
            want_mass_query: false,
            priority: DEFAULT_PRIORITY,
        };

        for line in document.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| invalid("line without a colon"))?;
            let value = value.trim();

            match key {
                "StoreDir" => {
                    info.store_dir = PathBuf::from(value);
                }
                "WantMassQuery" => {
                    info.want_mass_query = match value {
                        "1" => true,
                        "0" => false,
                        _ => return Err(invalid("bad WantMassQuery")),
                    };
                }
                "Priority" => {
                    info.priority = value.parse::<u64>().map_err(|_| invalid("bad Priority"))?;
                }
                _ => {}
            }
        }

        Ok(info)
    }

    /// Returns the serialized representation of the document.
    pub fn to_string(&self) -> String {
        let mut buf = itoa::Buffer::new();

        format!(
            "StoreDir: {}\nWantMassQuery: {}\nPriority: {}\n",
            self.store_dir.to_string_lossy(),
            if self.want_mass_query { "1" } else { "0" },
            buf.format(self.priority),
        )
    }
}

impl IntoResponse for NixCacheInfo {
    fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime::NIX_CACHE_INFO)
            .body(self.to_string())
            .unwrap()
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let info =
            NixCacheInfo::from_str("StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 40\n")
                .unwrap();

        assert_eq!(PathBuf::from("/nix/store"), info.store_dir);
        assert!(info.want_mass_query);
        assert_eq!(40, info.priority);
    }

    #[test]
    fn test_round_trip() {
        let info = NixCacheInfo::own();
        assert_eq!(info, NixCacheInfo::from_str(&info.to_string()).unwrap());
    }

    #[test]
    fn test_defaults() {
        let info = NixCacheInfo::from_str("StoreDir: /nix/store\n").unwrap();
        assert!(!info.want_mass_query);
        assert_eq!(DEFAULT_PRIORITY, info.priority);
    }

    #[test]
    fn test_rejects_garbage() {
        NixCacheInfo::from_str("Priority: -1\n").unwrap_err();
        NixCacheInfo::from_str("Priority: forty\n").unwrap_err();
        NixCacheInfo::from_str("no colon here\n").unwrap_err();
    }
}
