//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use displaydoc::Display;
use serde::Serialize;

use magpie::error::MagpieError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Generic responses
    /// The requested artifact was not found.
    NotFound,

    /// Unauthorized.
    Unauthorized,

    /// The requested method is not permitted on this server.
    NotPermitted,

    /// The server encountered an internal error or misconfiguration.
    InternalServerError,

    // Specialized responses
    /// The artifact already exists in storage.
    AlreadyExists,

    /// The narinfo references a NAR that no peer can supply.
    DependencyMissing,

    /// Invalid narinfo: {reason}
    InvalidNarInfo { reason: String },

    /// Invalid nix-cache-info: {reason}
    InvalidCacheInfo { reason: String },

    /// Upstream {url} returned an unexpected status: {status}
    UnexpectedStatus { url: String, status: u16 },

    /// Upstream {url} served a narinfo with no acceptable signature
    SignatureInvalid { url: String },

    /// Upstream error: {0}
    UpstreamError(AnyError),

    /// The operation was cancelled or timed out.
    Cancelled,

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components.
    MagpieError(MagpieError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn upstream_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::UpstreamError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::NotPermitted => "NotPermitted",
            Self::InternalServerError => "InternalServerError",

            Self::AlreadyExists => "AlreadyExists",
            Self::DependencyMissing => "DependencyMissing",
            Self::InvalidNarInfo { .. } => "InvalidNarInfo",
            Self::InvalidCacheInfo { .. } => "InvalidCacheInfo",
            Self::UnexpectedStatus { .. } => "UnexpectedStatus",
            Self::SignatureInvalid { .. } => "SignatureInvalid",
            Self::UpstreamError(_) => "UpstreamError",
            Self::Cancelled => "Cancelled",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::RequestError(_) => "RequestError",
            Self::MagpieError(e) => e.name(),
        }
    }

    /// Returns a version of this error for clients.
    ///
    /// Internal causes are not leaked over the wire.
    fn into_clients(self) -> Self {
        match self {
            // A narinfo whose NAR nobody can supply has been purged and
            // is reported as absent.
            Self::DependencyMissing => Self::NotFound,

            Self::DatabaseError(_) => Self::InternalServerError,
            Self::StorageError(_) => Self::InternalServerError,

            _ => self,
        }
    }

    fn http_status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotPermitted => StatusCode::METHOD_NOT_ALLOWED,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,

            Self::AlreadyExists => StatusCode::BAD_REQUEST,
            Self::InvalidNarInfo { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidCacheInfo { .. } => StatusCode::BAD_REQUEST,
            Self::RequestError(_) => StatusCode::BAD_REQUEST,
            Self::MagpieError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl StdError for ServerError {}

impl From<MagpieError> for ServerError {
    fn from(error: MagpieError) -> Self {
        Self::MagpieError(error)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(error: std::io::Error) -> Self {
        Self::StorageError(AnyError::new(error))
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            Self::DatabaseError(_) | Self::StorageError(_) | Self::UpstreamError(_)
        ) {
            tracing::error!("{:?}", self);
        }

        let sanitized = self.into_clients();

        let status_code = sanitized.http_status_code();
        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: sanitized.to_string(),
            error: sanitized.name().to_string(),
        };

        (status_code, Json(error_response)).into_response()
    }
}
