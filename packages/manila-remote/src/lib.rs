//! Wire types and HTTP client for the remote artifact cache tier.
//!
//! This library provides the types exchanged with a remote cache endpoint and,
//! behind the `client` feature, the `reqwest`-based client that speaks the
//! three-endpoint protocol (`GET /ping`, `PUT /artifacts/{fingerprint}`,
//! `POST /artifacts/{fingerprint}/output`). The local cache tier in
//! `manila-core` is authoritative; this crate never reads state back, only
//! pushes it.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. The intention here is that users must generally construct the
//! types either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! We do this because some types in this module may contain invariants that
//! need to be upheld, and it's easier to ensure that all types follow these
//! guidelines in the module than do it piecemeal.

use std::{fmt, str::FromStr};

use http::header::{self, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

pub mod error;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "client")]
pub use client::RemoteClient;

pub use error::RemoteError;

/// A bearer authentication token for the remote cache API.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = error::RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(error::RemoteError::EmptyToken);
        }
        Ok(Self(s.to_string()))
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The default buffer size used when streaming artifact archives over the
/// network.
pub const NETWORK_BUFFER_SIZE: usize = 1024 * 1024;

/// Content types used by the remote cache wire protocol.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ContentType {
    Zip,
    Json,
}

impl ContentType {
    pub const HEADER: HeaderName = header::CONTENT_TYPE;

    pub const fn to_str(self) -> &'static str {
        match self {
            ContentType::Zip => "application/zip",
            ContentType::Json => "application/json",
        }
    }

    pub fn value(self) -> HeaderValue {
        HeaderValue::from_static(self.to_str())
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

/// Metadata pushed to the remote cache alongside an artifact's fingerprint,
/// mirroring the JSON body of `PUT /artifacts/{fingerprint}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ArtifactMetadata {
    pub name: String,
    pub project: String,
    #[serde(rename = "type")]
    pub blueprint_type: String,
}

impl ArtifactMetadata {
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        blueprint_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            blueprint_type: blueprint_type.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_redaction() {
        let token = Token::from("super-secret-token-12345");
        assert_eq!(format!("{:?}", token), "[redacted]");
        assert_eq!(format!("{}", token), "[redacted]");
        assert_eq!(token.expose(), "super-secret-token-12345");
    }

    #[test]
    fn token_from_str() {
        let token = "test-token".parse::<Token>().unwrap();
        assert_eq!(token.expose(), "test-token");
        assert!("".parse::<Token>().is_err());
    }

    #[test]
    fn token_serialization() {
        let token = Token::from("test-token-12345");
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, r#""test-token-12345""#);
        let deserialized = serde_json::from_str::<Token>(&json).unwrap();
        assert_eq!(deserialized.expose(), "test-token-12345");
    }

    #[test]
    fn content_type_str() {
        assert_eq!(ContentType::Zip.to_str(), "application/zip");
        assert_eq!(ContentType::Json.to_str(), "application/json");
    }
}
