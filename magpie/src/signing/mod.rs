//! Object Signing and Verification.
//!
//! Narinfo fingerprints are signed with Ed25519. The proxy holds one
//! signing keypair, generated on first boot and named after the cache
//! hostname; upstream caches are verified against their published
//! public keys.
//!
//! ## String format
//!
//! All signing-related strings follow the canonical format used by the
//! Nix ecosystem:
//!
//! ```text
//! {keyName}:{base64Payload}
//! ```
//!
//! Keys generated with the Nix CLI work unchanged, and the signatures
//! we emit verify with stock Nix clients.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::{DecodeError, Engine};
use displaydoc::Display;
use ed25519_compact::{
    Error as SignatureError, KeyPair, PublicKey as Ed25519PublicKey, Signature,
};

use crate::error::MagpieResult;


/// An ed25519 keypair for signing.
#[derive(Debug)]
pub struct Keypair {
    /// Name of this key.
    name: String,

    /// The keypair.
    keypair: KeyPair,
}

/// An ed25519 public key for verification.
#[derive(Debug, Clone)]
pub struct PublicKey {
    /// Name of this key.
    name: String,

    /// The public key.
    public: Ed25519PublicKey,
}

/// A signing error.
#[derive(Debug, Display)]
#[ignore_extra_doc_attributes]
pub enum Error {
    /// Signature error: {0}
    SignatureError(SignatureError),

    /// The string has a wrong key name attached to it: Our name is "{our_name}" and the string has "{string_name}"
    WrongKeyName {
        our_name: String,
        string_name: String,
    },

    /// The string lacks a colon separator.
    NoColonSeparator,

    /// The name portion of the string is blank.
    BlankKeyName,

    /// The payload portion of the string is blank.
    BlankPayload,

    /// Base64 decode error: {0}
    Base64DecodeError(DecodeError),

    /// Invalid base64 payload length: Expected {expected} ({usage}), got {actual}
    InvalidPayloadLength {
        expected: usize,
        actual: usize,
        usage: &'static str,
    },

    /// Invalid signing key name "{0}".
    ///
    /// A valid name cannot be empty and must not contain colons (:).
    InvalidSigningKeyName(String),
}

impl std::error::Error for Error {}

impl Keypair {
    /// Generates a new keypair.
    pub fn generate(name: &str) -> MagpieResult<Self> {
        let keypair = KeyPair::generate();

        validate_name(name)?;

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Imports an existing keypair from its canonical representation.
    pub fn from_str(keypair: &str) -> MagpieResult<Self> {
        let (name, bytes) = decode_string(keypair, "keypair", KeyPair::BYTES, None)?;

        let keypair = KeyPair::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Returns the name of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the canonical representation of the keypair.
    ///
    /// The 64-byte base64 payload contains the private key and the
    /// public key, in that order. This is the form persisted by the
    /// config store and must be kept secret.
    pub fn export_keypair(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair))
    }

    /// Returns the canonical representation of the public key.
    ///
    /// For example, it can look like:
    ///     cache.example.org:C929acssgtJoINkUtLbc81GFJPUW9maR77TxEu9ZpRw=
    pub fn export_public_key(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.keypair.pk))
    }

    /// Returns the public key portion of the keypair.
    pub fn to_public_key(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            public: self.keypair.pk,
        }
    }

    /// Signs a message, returning the signature in canonical form.
    pub fn sign(&self, message: &[u8]) -> String {
        let bytes = self.keypair.sk.sign(message, None);
        format!("{}:{}", self.name, BASE64_STANDARD.encode(bytes))
    }

    /// Verifies a message signed by this key.
    pub fn verify(&self, message: &[u8], signature: &str) -> MagpieResult<()> {
        self.to_public_key().verify(message, signature)
    }
}

impl PublicKey {
    /// Imports an existing public key from its canonical representation.
    pub fn from_str(public_key: &str) -> MagpieResult<Self> {
        let (name, bytes) = decode_string(public_key, "public key", Ed25519PublicKey::BYTES, None)?;

        let public = Ed25519PublicKey::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            public,
        })
    }

    /// Returns the name of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the Nix-compatible textual representation of the public key.
    pub fn export(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.public))
    }

    /// Verifies a message.
    pub fn verify(&self, message: &[u8], signature: &str) -> MagpieResult<()> {
        let (_, bytes) = decode_string(signature, "signature", Signature::BYTES, Some(&self.name))?;

        let bytes: [u8; Signature::BYTES] = bytes.try_into().unwrap();
        let signature = Signature::from_slice(&bytes).map_err(Error::SignatureError)?;

        self.public
            .verify(message, &signature)
            .map_err(|e| Error::SignatureError(e).into())
    }
}

/// Returns the key name portion of a canonical signature string.
pub fn signature_key_name(signature: &str) -> Option<&str> {
    match signature.split_once(':') {
        Some((name, payload)) if !name.is_empty() && !payload.is_empty() => Some(name),
        _ => None,
    }
}

/// Tests whether a signature verifies against any of the given keys.
pub fn verifies_against(signature: &str, message: &[u8], keys: &[PublicKey]) -> bool {
    let Some(name) = signature_key_name(signature) else {
        return false;
    };

    keys.iter()
        .filter(|key| key.name == name)
        .any(|key| key.verify(message, signature).is_ok())
}

/// Tests whether at least one of the signatures verifies against the key set.
pub fn verify_first(signatures: &[String], message: &[u8], keys: &[PublicKey]) -> bool {
    signatures
        .iter()
        .any(|sig| verifies_against(sig, message, keys))
}

/// Validates the name/label of a signing key.
///
/// A valid name cannot be empty and must not contain colons (:).
fn validate_name(name: &str) -> MagpieResult<()> {
    if name.is_empty() || name.find(':').is_some() {
        Err(Error::InvalidSigningKeyName(name.to_string()).into())
    } else {
        Ok(())
    }
}

/// Decodes a colon-delimited string containing a key name and a base64 payload.
fn decode_string<'s>(
    s: &'s str,
    usage: &'static str,
    expected_payload_length: usize,
    expected_name: Option<&str>,
) -> MagpieResult<(&'s str, Vec<u8>)> {
    let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

    let (name, colon_and_payload) = s.split_at(colon);

    validate_name(name)?;

    // don't bother decoding base64 if the name doesn't match
    if let Some(expected_name) = expected_name {
        if expected_name != name {
            return Err(Error::WrongKeyName {
                our_name: expected_name.to_string(),
                string_name: name.to_string(),
            }
            .into());
        }
    }

    if colon_and_payload.len() <= 1 {
        return Err(Error::BlankPayload.into());
    }

    let bytes = BASE64_STANDARD
        .decode(&colon_and_payload[1..])
        .map_err(Error::Base64DecodeError)?;

    if bytes.len() != expected_payload_length {
        return Err(Error::InvalidPayloadLength {
            actual: bytes.len(),
            expected: expected_payload_length,
            usage,
        }
        .into());
    }

    Ok((name, bytes))
}
