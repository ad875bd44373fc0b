//! The remote cache tier: a thin, best-effort push wrapper around
//! [`LocalCache`] (`spec.md` §5.C).
//!
//! Reads are always served locally; this tier never pulls. On
//! `cache_artifact`, it additionally pushes the artifact's metadata and
//! output to the configured remote endpoint after the local entry is
//! written. A push failure is logged and surfaced to the caller as a
//! warning-carrying error variant, but the local cache entry already stands:
//! the caller's build did not fail because of it.

use manila_remote::{ArtifactMetadata, RemoteClient};
use tracing::{instrument, warn};

use crate::{
    cache::local::LocalCache,
    error::{CacheResult, EngineError},
    value::{ArtifactOutput, BuildConfig, CreatedArtifact, Project},
};

/// Wraps a [`LocalCache`] with an optional remote push target.
///
/// Constructing with `remote: None` makes this behave identically to
/// `LocalCache` alone; `{CACHE_HOST}` absent means local-only (`spec.md`
/// §7).
#[derive(Debug)]
pub struct RemoteCache {
    local: LocalCache,
    remote: Option<RemoteClient>,
}

impl RemoteCache {
    pub fn new(local: LocalCache, remote: Option<RemoteClient>) -> Self {
        Self { local, remote }
    }

    /// Ping the remote endpoint, if configured. Fails closed: any transport
    /// error treats the remote as unavailable. Callers should invoke this
    /// once before accepting the cache as usable and fall back to
    /// local-only operation if it fails.
    #[instrument(skip(self))]
    pub async fn check_availability(&self) -> CacheResult<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        remote.check_availability().await.map_err(|err| EngineError::RemoteUnavailable {
            host: "configured remote".to_string(),
            source: Some(err),
        })
    }

    pub async fn load(&self) -> CacheResult<()> {
        self.local.load().await
    }

    pub async fn flush(&self) -> CacheResult<()> {
        self.local.flush().await
    }

    pub async fn is_cached(&self, fingerprint: &str) -> bool {
        self.local.is_cached(fingerprint).await
    }

    pub fn artifact_root_for(
        &self,
        config: &BuildConfig,
        project_name: &str,
        artifact_name: &str,
        fingerprint: &str,
    ) -> CacheResult<crate::path::AbsDirPath> {
        self.local.artifact_root_for(config, project_name, artifact_name, fingerprint)
    }

    pub async fn update_access_time(&self, fingerprint: &str) {
        self.local.update_access_time(fingerprint).await
    }

    pub async fn append_cached_data(
        &self,
        artifact: CreatedArtifact,
        config: &BuildConfig,
    ) -> CacheResult<CreatedArtifact> {
        self.local.append_cached_data(artifact, config).await
    }

    pub async fn most_recent_output_for_project(&self, project: &Project) -> CacheResult<ArtifactOutput> {
        self.local.most_recent_output_for_project(project).await
    }

    /// Write the local entry, then best-effort push to the remote tier.
    ///
    /// Returns the fingerprint on success regardless of whether the remote
    /// push succeeded; a push failure is logged, not propagated, per the
    /// "remote tier is best-effort" failure model.
    #[instrument(skip(self, artifact, config, output))]
    pub async fn cache_artifact(
        &self,
        artifact: &CreatedArtifact,
        config: &BuildConfig,
        output: ArtifactOutput,
    ) -> CacheResult<String> {
        let fingerprint = self.local.cache_artifact(artifact, config, output.clone()).await?;

        if let Some(remote) = &self.remote {
            if let Err(err) = self.push(remote, &fingerprint, artifact, &output).await {
                warn!(?err, fingerprint, "remote cache push failed, local entry stands");
            }
        }

        Ok(fingerprint)
    }

    async fn push(
        &self,
        remote: &RemoteClient,
        fingerprint: &str,
        artifact: &CreatedArtifact,
        output: &ArtifactOutput,
    ) -> CacheResult<()> {
        let metadata = ArtifactMetadata::new(
            artifact.name().to_string(),
            artifact.project_ref().to_string(),
            artifact.decl.blueprint_type.clone(),
        );
        remote
            .push_metadata(fingerprint, &metadata)
            .await
            .map_err(|source| EngineError::RemotePushFailed { fingerprint: fingerprint.to_string(), source })?;

        let files = output
            .file_paths
            .iter()
            .filter_map(|path| {
                use crate::path::RelativeTo as _;
                let rel = path.relative_to(&output.artifact_root).ok()?;
                Some((rel.as_str_lossy().into_owned(), path.as_std_path().to_path_buf()))
            })
            .collect();

        remote
            .push_output(fingerprint, files)
            .await
            .map_err(|source| EngineError::RemotePushFailed { fingerprint: fingerprint.to_string(), source })
    }
}
