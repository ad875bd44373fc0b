//! Errors surfaced by the remote cache wire client.
//!
//! `manila-core` maps these onto its own closed `EngineError` taxonomy
//! (`RemoteUnavailable`/`RemotePushFailed`); this crate has no dependency on
//! `manila-core`, so it keeps its own narrow error type at this boundary.

use thiserror::Error;

/// Errors that can occur while talking to a remote cache endpoint.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    #[error("token must not be empty")]
    EmptyToken,

    #[cfg(feature = "client")]
    #[error("request to remote cache failed")]
    Transport(#[from] reqwest::Error),

    #[cfg(feature = "client")]
    #[error("parse remote cache URL")]
    UrlParse(#[from] url::ParseError),

    #[cfg(feature = "client")]
    #[error("remote cache returned unexpected status {status}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[cfg(feature = "client")]
    #[error("read artifact file for upload")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "client")]
    #[error("build artifact archive")]
    Archive(#[from] zip::result::ZipError),

    #[cfg(feature = "client")]
    #[error("join archive builder task")]
    Join(#[from] tokio::task::JoinError),
}
