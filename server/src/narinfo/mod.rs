//! NAR info.
//!
//! ## `.narinfo` format
//!
//! An example of [a valid
//! .narinfo](https://cache.nixos.org/p4pclmv1gyja5kzc26npqpia1qqxrf0l.narinfo)
//! signed by https://cache.nixos.org:
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
//! Compression: xz
//! FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
//! FileSize: 4029176
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3 a4yw1svqqk4d8lhwinn9xp847zz9gfma-bash-4.4-p23
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```
//!
//! The format is a flat map of `Key: Value` lines, except that the
//! `Sig` key may repeat: a narinfo that has passed through several
//! caches accumulates one signature per cache. The proxy preserves
//! upstream signatures it trusts and appends its own.
//!
//! ## Fingerprint
//!
//! Signatures cover a fingerprint of the full store path, the NAR hash,
//! the NAR size, and the full store paths of all references:
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
//! ```

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ServerError, ServerResult};
use magpie::hash::Hash;
use magpie::mime;
use magpie::nar_url::{Compression, NarUrl};
use magpie::signing::Keypair;

#[cfg(test)]
mod tests;

/// NAR information.
#[derive(Debug, Clone)]
pub struct NarInfo {
    /// The full store path being cached, including the store directory.
    ///
    /// Part of the fingerprint.
    ///
    /// Example: `/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3`.
    pub store_path: PathBuf,

    /// The relative URL of the NAR.
    ///
    /// Upstream documents may carry a narinfo-hash prefix in the hash
    /// portion; the engine normalizes the field before a narinfo is
    /// persisted or served.
    pub url: NarUrl,

    /// Compression in use.
    pub compression: Compression,

    /// The hash of the compressed file.
    pub file_hash: Option<Hash>,

    /// The size of the compressed file.
    pub file_size: Option<u64>,

    /// The hash of the NAR archive.
    ///
    /// Part of the fingerprint.
    pub nar_hash: Hash,

    /// The size of the NAR archive.
    ///
    /// Part of the fingerprint.
    pub nar_size: u64,

    /// Other store paths this object directly references.
    ///
    /// This only includes the base paths, not the store directory itself.
    ///
    /// Part of the fingerprint.
    pub references: Vec<String>,

    /// The system this derivation is built for.
    pub system: Option<String>,

    /// The derivation that produced this object.
    pub deriver: Option<String>,

    /// Signatures over the fingerprint, in canonical `name:base64` form.
    pub signatures: Vec<String>,

    /// The content address of the object.
    pub ca: Option<String>,
}

impl NarInfo {
    /// Parses a narinfo from its textual representation.
    pub fn from_str(document: &str) -> ServerResult<Self> {
        let invalid = |reason: &str| ServerError::InvalidNarInfo {
            reason: reason.to_string(),
        };

        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut references = None;
        let mut system = None;
        let mut deriver = None;
        let mut signatures = Vec::new();
        let mut ca = None;

        for line in document.lines() {
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| invalid("line without a colon"))?;
            let value = value.strip_prefix(' ').unwrap_or(value);

            match key {
                "StorePath" => {
                    store_path = Some(PathBuf::from(value));
                }
                "URL" => {
                    url = Some(NarUrl::parse(value)?);
                }
                "Compression" => {
                    compression = Some(value.parse::<Compression>()?);
                }
                "FileHash" => {
                    file_hash = Some(Hash::from_typed(value)?);
                }
                "FileSize" => {
                    file_size =
                        Some(value.parse::<u64>().map_err(|_| invalid("bad FileSize"))?);
                }
                "NarHash" => {
                    nar_hash = Some(Hash::from_typed(value)?);
                }
                "NarSize" => {
                    nar_size = Some(value.parse::<u64>().map_err(|_| invalid("bad NarSize"))?);
                }
                "References" => {
                    references = Some(
                        value
                            .split_ascii_whitespace()
                            .map(str::to_string)
                            .collect::<Vec<_>>(),
                    );
                }
                "System" => {
                    system = Some(value.to_string());
                }
                "Deriver" => {
                    // produced by legacy tools
                    if value != "unknown-deriver" {
                        deriver = Some(value.to_string());
                    }
                }
                "Sig" => {
                    signatures.push(value.to_string());
                }
                "CA" => {
                    ca = Some(value.to_string());
                }
                // ignore unknown keys for forward compatibility
                _ => {}
            }
        }

        let url: NarUrl = url.ok_or_else(|| invalid("missing URL"))?;
        let compression = compression.unwrap_or(url.compression);

        Ok(Self {
            store_path: store_path.ok_or_else(|| invalid("missing StorePath"))?,
            url,
            compression,
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or_else(|| invalid("missing NarHash"))?,
            nar_size: nar_size.ok_or_else(|| invalid("missing NarSize"))?,
            references: references.unwrap_or_default(),
            system,
            deriver,
            signatures,
            ca,
        })
    }

    /// Returns the serialized representation of the narinfo.
    pub fn to_string(&self) -> String {
        let mut out = String::with_capacity(512);
        let mut buf = itoa::Buffer::new();

        out.push_str("StorePath: ");
        out.push_str(&self.store_path.to_string_lossy());
        out.push('\n');

        out.push_str("URL: ");
        out.push_str(&self.url.to_string());
        out.push('\n');

        out.push_str("Compression: ");
        out.push_str(self.compression.as_str());
        out.push('\n');

        if let Some(file_hash) = &self.file_hash {
            out.push_str("FileHash: ");
            out.push_str(&file_hash.to_typed_base32());
            out.push('\n');
        }

        if let Some(file_size) = self.file_size {
            out.push_str("FileSize: ");
            out.push_str(buf.format(file_size));
            out.push('\n');
        }

        out.push_str("NarHash: ");
        out.push_str(&self.nar_hash.to_typed_base32());
        out.push('\n');

        out.push_str("NarSize: ");
        out.push_str(buf.format(self.nar_size));
        out.push('\n');

        out.push_str("References: ");
        out.push_str(&self.references.join(" "));
        out.push('\n');

        if let Some(deriver) = &self.deriver {
            out.push_str("Deriver: ");
            out.push_str(deriver);
            out.push('\n');
        }

        if let Some(system) = &self.system {
            out.push_str("System: ");
            out.push_str(system);
            out.push('\n');
        }

        for signature in &self.signatures {
            out.push_str("Sig: ");
            out.push_str(signature);
            out.push('\n');
        }

        if let Some(ca) = &self.ca {
            out.push_str("CA: ");
            out.push_str(ca);
            out.push('\n');
        }

        out
    }

    /// Validates internal consistency.
    pub fn check(&self) -> ServerResult<()> {
        let invalid = |reason: &str| ServerError::InvalidNarInfo {
            reason: reason.to_string(),
        };

        if !self.store_path.is_absolute() {
            return Err(invalid("StorePath must be absolute"));
        }

        if self.store_path.file_name().is_none() {
            return Err(invalid("StorePath has no base name"));
        }

        if self.compression != self.url.compression {
            return Err(invalid("Compression disagrees with the URL extension"));
        }

        if self.references.iter().any(|r| r.is_empty() || r.contains('/')) {
            return Err(invalid("malformed reference"));
        }

        Ok(())
    }

    /// Returns the store directory of this object.
    pub fn store_dir(&self) -> &Path {
        // check() requires an absolute path with a base name
        self.store_path.parent().unwrap_or(Path::new("/"))
    }

    /// Signs the narinfo, appending the signature.
    ///
    /// Any previous signature under the same key name is replaced;
    /// signatures from other keys are preserved.
    pub fn sign(&mut self, keypair: &Keypair) {
        let our_name = keypair.name();
        self.signatures
            .retain(|sig| magpie::signing::signature_key_name(sig) != Some(our_name));

        let signature = keypair.sign(&self.fingerprint());
        self.signatures.push(signature);
    }

    /// Returns the fingerprint of the object.
    pub fn fingerprint(&self) -> Vec<u8> {
        let store_dir = self.store_dir();
        let mut fingerprint = b"1;".to_vec();

        // 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}

        // storePath
        fingerprint.extend(self.store_path.as_os_str().as_bytes());
        fingerprint.extend(b";");

        // narHash
        fingerprint.extend(self.nar_hash.to_typed_base32().as_bytes());
        fingerprint.extend(b";");

        // narSize
        let mut buf = itoa::Buffer::new();
        let nar_size = buf.format(self.nar_size);
        fingerprint.extend(nar_size.as_bytes());
        fingerprint.extend(b";");

        // commaDelimitedReferences
        let mut iter = self.references.iter().peekable();
        while let Some(reference) = iter.next() {
            fingerprint.extend(store_dir.as_os_str().as_bytes());
            fingerprint.extend(b"/");
            fingerprint.extend(reference.as_bytes());

            if iter.peek().is_some() {
                fingerprint.extend(b",");
            }
        }

        fingerprint
    }
}

impl IntoResponse for NarInfo {
    fn into_response(self) -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime::NARINFO)
            .body(self.to_string())
            .unwrap()
            .into_response()
    }
}
