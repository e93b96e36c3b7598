//! Remote artifact index consultation.
//!
//! Some deployments publish a probabilistic index of an upstream's
//! contents so that narinfo misses can be answered without a round
//! trip. The index machinery itself lives elsewhere; the engine only
//! cares about its ternary answer.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

/// The answer of an index lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup {
    /// The artifact is certainly present upstream.
    DefiniteHit,

    /// The artifact is probably present; a false positive is possible.
    ProbableHit,

    /// The artifact is certainly absent upstream.
    DefiniteMiss,
}

/// A queryable artifact index for an upstream.
///
/// Lookup failures (an unreachable or corrupt index) are not misses:
/// callers must treat them as "no signal" and query the upstream
/// directly.
#[async_trait]
pub trait UpstreamIndex: Send + Sync + fmt::Debug {
    /// Looks up a narinfo hash.
    async fn lookup(&self, hash: &str) -> Result<IndexLookup>;
}
