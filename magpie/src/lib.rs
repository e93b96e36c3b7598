//! The Magpie Library.
//!
//! Components shared between the proxy server and anything else that
//! needs to speak the Nix binary cache dialect: artifact hashes, NAR
//! URLs, object signing, and MIME types.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod error;
pub mod hash;
pub mod mime;
pub mod nar_url;
pub mod signing;

pub use error::{MagpieError, MagpieResult};
