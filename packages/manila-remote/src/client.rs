//! HTTP client for the remote artifact cache tier.
//!
//! Speaks the three endpoints specified for the remote cache: `GET /ping`,
//! `PUT /artifacts/{fingerprint}`, `POST /artifacts/{fingerprint}/output`.
//! This client is push-only; there is no method to fetch an artifact back
//! down, matching the decision recorded for the remote-pull open question.

use std::{io::Write, path::PathBuf, sync::Arc};

use reqwest::{StatusCode, multipart};
use tracing::instrument;
use url::Url;

use crate::{ArtifactMetadata, ContentType, RemoteError, Token};

/// Client for the remote artifact cache API.
///
/// Cheaply cloneable; clones share the underlying HTTP connection pool.
#[derive(Clone, Debug)]
pub struct RemoteClient {
    base: Arc<Url>,
    http: reqwest::Client,
    token: Option<Token>,
}

impl RemoteClient {
    /// Create a new client for the given base URL, optionally authenticating
    /// with a bearer token.
    pub fn new(base: Url, token: Option<Token>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder().gzip(true).brotli(true).build()?;
        Ok(Self {
            base: Arc::new(base),
            http,
            token,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    /// Check that the remote cache is reachable. Fails closed: any transport
    /// error or non-2xx response is treated as "unavailable".
    #[instrument(skip(self))]
    pub async fn check_availability(&self) -> Result<(), RemoteError> {
        let url = self.base.join("ping")?;
        let response = self.authed(self.http.get(url)).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Push artifact metadata: `PUT /artifacts/{fingerprint}`.
    ///
    /// Non-2xx aborts the push before any output is uploaded; local cache
    /// state is never touched by this call.
    #[instrument(skip(self, metadata))]
    pub async fn push_metadata(
        &self,
        fingerprint: &str,
        metadata: &ArtifactMetadata,
    ) -> Result<(), RemoteError> {
        let url = self.base.join(&format!("artifacts/{fingerprint}"))?;
        let response = self
            .authed(self.http.put(url))
            .header(ContentType::HEADER, ContentType::Json.value())
            .json(metadata)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Push artifact output: `POST /artifacts/{fingerprint}/output`.
    ///
    /// `files` pairs each file's path relative to `artifact_root` with its
    /// absolute on-disk location. The archive is built off the async runtime
    /// since `zip`'s writer is synchronous.
    #[instrument(name = "RemoteClient::push_output", skip(self, files), fields(files = files.len()))]
    pub async fn push_output(
        &self,
        fingerprint: &str,
        files: Vec<(String, PathBuf)>,
    ) -> Result<(), RemoteError> {
        let url = self.base.join(&format!("artifacts/{fingerprint}/output"))?;
        let archive = tokio::task::spawn_blocking(move || build_zip_archive(&files)).await??;

        let part = multipart::Part::bytes(archive)
            .file_name("artifact.zip")
            .mime_str(ContentType::Zip.to_str())?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .authed(self.http.post(url))
            .multipart(form)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }
}

fn build_zip_archive(files: &[(String, PathBuf)]) -> Result<Vec<u8>, RemoteError> {
    let buffer = Vec::new();
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(buffer));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (entry_path, abs_path) in files {
        writer.start_file(entry_path, options)?;
        let bytes = std::fs::read(abs_path)?;
        writer.write_all(&bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

async fn unexpected_status(status: StatusCode, response: reqwest::Response) -> RemoteError {
    let body = response.text().await.unwrap_or_default();
    RemoteError::UnexpectedStatus { status, body }
}
