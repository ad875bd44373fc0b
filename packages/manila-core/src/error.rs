//! The closed error taxonomy for the execution & caching subsystem.
//!
//! Every component-level operation in this crate returns `Result<T, EngineError>`
//! (or a narrower alias such as [`CacheResult`]) instead of an erased
//! `anyhow`/`color_eyre` error: callers need to match on `NotCached` vs `Cycle`
//! vs `BuildFailed` to implement their own recovery, which an opaque error type
//! would not allow.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::ExecutableId;

/// Errors surfaced by the execution graph, scheduler, artifact manager, and
/// cache tiers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Disk access failed while hashing, reading, writing, or deleting.
    #[error("io error at {path:?}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The cache file exists but could not be parsed as JSON.
    #[error("cache file corrupted: {path:?}")]
    CacheCorruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Topological layering found a cycle in the execution graph.
    #[error("cycle detected in execution graph: {} of {} nodes were ordered", emitted, total)]
    Cycle { emitted: usize, total: usize },

    /// No cache entry exists for the fingerprint (or project) in question.
    ///
    /// Recoverable: callers generally fall back to building the artifact.
    #[error("no cache entry for {0}")]
    NotCached(String),

    /// A blueprint cannot consume a dependency of the declared type.
    #[error("blueprint for {artifact} cannot consume dependency of type {dependency_type:?}")]
    IncompatibleDependency {
        artifact: String,
        dependency_type: String,
    },

    /// A blueprint's build hook returned a failing exit code.
    #[error("build failed for {node:?}: {reason}")]
    BuildFailed {
        node: Option<ExecutableId>,
        reason: String,
    },

    /// The remote cache tier was configured but could not be reached at
    /// startup.
    #[error("remote cache unavailable at {host}")]
    RemoteUnavailable {
        host: String,
        #[source]
        source: Option<manila_remote::RemoteError>,
    },

    /// A push to the remote cache tier failed after the local cache entry
    /// was already written. This is a warning-only condition; local state
    /// stands.
    #[error("remote push failed for fingerprint {fingerprint}")]
    RemotePushFailed {
        fingerprint: String,
        #[source]
        source: manila_remote::RemoteError,
    },

    /// A cooperative cancellation signal was observed; the node completed
    /// its cleanup and the scheduler returned early.
    #[error("build cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    pub fn cache_corruption(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::CacheCorruption {
            path: path.into(),
            source,
        }
    }
}

/// Shorthand for results returned by the cache tiers.
pub type CacheResult<T> = Result<T, EngineError>;

/// Shorthand for results returned by the artifact manager.
pub type ManagerResult<T> = Result<T, EngineError>;
