//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type MagpieResult<T> = Result<T, MagpieError>;

/// An error.
#[derive(Debug, Display)]
pub enum MagpieError {
    /// Invalid hash "{hash}": {reason}
    InvalidHash { hash: String, reason: &'static str },

    /// Invalid NAR URL "{url}": {reason}
    InvalidNarUrl { url: String, reason: &'static str },

    /// Invalid compression type "{name}"
    InvalidCompressionType { name: String },

    /// Signing error: {0}
    SigningError(super::signing::Error),

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}
    IoError { error: io::Error },
}

impl MagpieError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidHash { .. } => "InvalidHash",
            Self::InvalidNarUrl { .. } => "InvalidNarUrl",
            Self::InvalidCompressionType { .. } => "InvalidCompressionType",
            Self::SigningError(_) => "SigningError",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for MagpieError {}

impl From<io::Error> for MagpieError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::signing::Error> for MagpieError {
    fn from(error: super::signing::Error) -> Self {
        Self::SigningError(error)
    }
}

impl From<super::hash::Error> for MagpieError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
