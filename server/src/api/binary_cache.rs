//! Nix Binary Cache server.
//!
//! This module implements the Nix Binary Cache API.
//!
//! The implementation is based on the specifications at <https://github.com/fzakaria/nix-http-binary-cache-api-spec>.

use async_compression::tokio::bufread::ZstdEncoder;
use axum::{
    body::Body,
    extract::{Extension, Path, RawQuery},
    http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE},
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use futures::TryStreamExt;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::instrument;

use crate::cache::NarStream;
use crate::cache_info::NixCacheInfo;
use crate::error::{ServerError, ServerResult};
use crate::middleware::UploadScope;
use crate::narinfo::NarInfo;
use crate::State;
use magpie::mime;
use magpie::nar_url::{Compression, NarUrl};

/// Liveness probe.
async fn healthz() -> &'static str {
    "OK"
}

/// Serves this cache's `nix-cache-info`.
async fn get_nix_cache_info() -> NixCacheInfo {
    NixCacheInfo::own()
}

/// Serves this cache's public key in canonical form.
async fn get_public_key(Extension(state): Extension<State>) -> String {
    state.cache.public_key()
}

/// Extracts the narinfo hash from a `{hash}.narinfo` path segment.
fn nar_info_hash(path: &str) -> ServerResult<&str> {
    path.strip_suffix(".narinfo").ok_or(ServerError::NotFound)
}

/// Reassembles the relative NAR URL from a `/nar/{file}` request.
fn nar_url(path: &str, query: Option<&str>) -> ServerResult<NarUrl> {
    let url = match query {
        Some(query) => format!("nar/{}?{}", path, query),
        None => format!("nar/{}", path),
    };

    Ok(NarUrl::parse(&url)?)
}

/// Gets (or HEADs) a narinfo.
///
/// `GET /{hash}.narinfo`
#[instrument(skip_all, fields(path))]
async fn get_nar_info(
    Extension(state): Extension<State>,
    scope: Option<Extension<UploadScope>>,
    Path(path): Path<String>,
) -> ServerResult<NarInfo> {
    let hash = nar_info_hash(&path)?;

    state.cache.get_nar_info(hash, scope.is_some()).await
}

/// Uploads a narinfo.
///
/// `PUT /{hash}.narinfo`
#[instrument(skip_all, fields(path))]
async fn put_nar_info(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    body: String,
) -> ServerResult<StatusCode> {
    state.permissions.require_put()?;

    let hash = nar_info_hash(&path)?;
    state.cache.put_nar_info(hash, &body).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Deletes a narinfo.
///
/// `DELETE /{hash}.narinfo`
#[instrument(skip_all, fields(path))]
async fn delete_nar_info(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
) -> ServerResult<StatusCode> {
    state.permissions.require_delete()?;

    let hash = nar_info_hash(&path)?;
    state.cache.delete_nar_info(hash).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Gets or HEADs a NAR.
///
/// `GET /nar/{hash}.nar[.{ext}]`
///
/// HEAD is answered from the metadata index when possible; otherwise
/// the engine's reader is drained to learn the length. An uncompressed
/// body is transparently zstd-encoded for clients advertising
/// `Accept-Encoding: zstd`.
#[instrument(skip_all, fields(path))]
async fn get_nar(
    Extension(state): Extension<State>,
    scope: Option<Extension<UploadScope>>,
    method: Method,
    headers: HeaderMap,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> ServerResult<Response> {
    let url = nar_url(&path, query.as_deref())?;

    if method == Method::HEAD {
        return head_nar(&state, &url, scope.is_some()).await;
    }

    let nar = state.cache.get_nar(&url, scope.is_some()).await?;

    let accepts_zstd = headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("zstd"))
        .unwrap_or(false);

    if accepts_zstd && url.compression == Compression::None {
        let encoder = ZstdEncoder::new(BufReader::new(nar.reader));

        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, mime::NAR)
            .header(CONTENT_ENCODING, "zstd")
            .body(Body::from_stream(ReaderStream::new(encoder)))
            .unwrap());
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime::NAR);

    if let Some(size) = nar.size {
        builder = builder.header(CONTENT_LENGTH, size);
    }

    Ok(builder
        .body(Body::from_stream(ReaderStream::new(nar.reader)))
        .unwrap())
}

async fn head_nar(state: &State, url: &NarUrl, upload_only: bool) -> ServerResult<Response> {
    let size = match state.cache.get_nar_file_size(url).await {
        Ok(size) => size,
        Err(ServerError::NotFound) => {
            // fall back to the streaming path; a known size answers
            // immediately, otherwise drain the reader to count
            let NarStream { size, reader } = state.cache.get_nar(url, upload_only).await?;
            match size {
                Some(size) => size,
                None => drain(reader).await?,
            }
        }
        Err(e) => return Err(e),
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime::NAR)
        .header(CONTENT_LENGTH, size)
        .body(Body::empty())
        .unwrap())
}

async fn drain(mut reader: Box<dyn AsyncRead + Send + Unpin>) -> ServerResult<u64> {
    let mut sink = tokio::io::sink();
    tokio::io::copy(&mut reader, &mut sink)
        .await
        .map_err(ServerError::storage_error)
}

/// Uploads a NAR.
///
/// `PUT /nar/{hash}.nar[.{ext}]`
#[instrument(skip_all, fields(path))]
async fn put_nar(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    body: Body,
) -> ServerResult<StatusCode> {
    state.permissions.require_put()?;

    let url = nar_url(&path, query.as_deref())?;

    let stream = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(stream);

    state.cache.put_nar(&url, &mut reader).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Deletes a NAR.
///
/// `DELETE /nar/{hash}.nar[.{ext}]`
#[instrument(skip_all, fields(path))]
async fn delete_nar(
    Extension(state): Extension<State>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> ServerResult<StatusCode> {
    state.permissions.require_delete()?;

    let url = nar_url(&path, query.as_deref())?;
    state.cache.delete_nar(&url).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub fn get_router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/nix-cache-info", get(get_nix_cache_info))
        .route("/pubkey", get(get_public_key))
        .route(
            "/:path",
            get(get_nar_info).put(put_nar_info).delete(delete_nar_info),
        )
        .route("/nar/:path", get(get_nar).put(put_nar).delete(delete_nar))
}
