//! The Artifact Manager: the single-flight build gate deciding, per
//! fingerprint, whether to build, reuse, or wait (`spec.md` §5.D).
//!
//! The per-fingerprint gate map is the only globally shared mutable
//! structure in the build path; `dashmap`'s atomic `entry().or_insert_with`
//! is what makes step 4's lookup-or-insert race-free without a
//! map-wide lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    cache::RemoteCache,
    collab::PluginComponent,
    error::{EngineError, ManagerResult},
    fingerprint,
    path::AbsDirPath,
    value::{ArtifactOutput, BuildConfig, BuildExitCode, CreatedArtifact, Project},
};

/// Orchestrates build-vs-reuse decisions over a [`RemoteCache`].
#[derive(Debug)]
pub struct ArtifactManager {
    cache: RemoteCache,
    build_gates: DashMap<String, Arc<Mutex<()>>>,
}

impl ArtifactManager {
    pub fn new(cache: RemoteCache) -> Self {
        Self { cache, build_gates: DashMap::new() }
    }

    pub fn cache(&self) -> &RemoteCache {
        &self.cache
    }

    /// Build `created_artifact`, or reuse the cached output if one already
    /// exists for its fingerprint and `invalidate_cache` is not set.
    ///
    /// At most one caller executes `blueprint.build_hook` for a given
    /// fingerprint at a time, across any interleaving of concurrent calls.
    #[instrument(skip(self, blueprint, created_artifact, project, config))]
    pub async fn build_from_dependencies(
        &self,
        blueprint: &dyn PluginComponent,
        created_artifact: CreatedArtifact,
        project: &Project,
        config: &BuildConfig,
        invalidate_cache: bool,
    ) -> ManagerResult<BuildExitCode> {
        let fingerprint = fingerprint::fingerprint_artifact(&created_artifact, config)?;
        let artifact_root =
            self.cache.artifact_root_for(config, created_artifact.project_ref(), created_artifact.name(), &fingerprint)?;

        if self.fast_path_hit(&artifact_root, &fingerprint, invalidate_cache).await {
            self.cache.update_access_time(&fingerprint).await;
            return Ok(BuildExitCode::Cached(fingerprint));
        }

        let gate = self
            .build_gates
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = gate.lock().await;

        // Re-check: a concurrent builder may have finished between the fast
        // path above and acquiring the gate.
        if self.fast_path_hit(&artifact_root, &fingerprint, invalidate_cache).await {
            self.cache.update_access_time(&fingerprint).await;
            drop(guard);
            self.release_gate(&fingerprint, gate);
            return Ok(BuildExitCode::Cached(fingerprint));
        }

        let outcome = self
            .build_locked(blueprint, created_artifact, project, config, &artifact_root, invalidate_cache, &fingerprint)
            .await;

        drop(guard);
        self.release_gate(&fingerprint, gate);
        outcome
    }

    async fn fast_path_hit(&self, artifact_root: &AbsDirPath, fingerprint: &str, invalidate_cache: bool) -> bool {
        !invalidate_cache && crate::fs::is_dir(artifact_root.as_std_path()).await && self.cache.is_cached(fingerprint).await
    }

    /// Steps 6-10: stale-directory eviction, dependency consumption, the
    /// build hook itself, and the cache write on success. Only ever called
    /// with the per-fingerprint gate held.
    #[allow(clippy::too_many_arguments)]
    async fn build_locked(
        &self,
        blueprint: &dyn PluginComponent,
        created_artifact: CreatedArtifact,
        project: &Project,
        config: &BuildConfig,
        artifact_root: &AbsDirPath,
        invalidate_cache: bool,
        fingerprint: &str,
    ) -> ManagerResult<BuildExitCode> {
        if invalidate_cache && crate::fs::is_dir(artifact_root.as_std_path()).await {
            crate::fs::remove_dir_all(artifact_root)
                .await
                .map_err(|err| EngineError::io(artifact_root.as_std_path(), std::io::Error::other(err.to_string())))?;
        }
        crate::fs::create_dir_all(artifact_root)
            .await
            .map_err(|err| EngineError::io(artifact_root.as_std_path(), std::io::Error::other(err.to_string())))?;

        for dependency in &created_artifact.dependencies {
            let dep_project = Project { name: dependency.project_ref().to_string() };
            let dep_output = self.cache.most_recent_output_for_project(&dep_project).await?;
            let consume = blueprint.consume_hook(&dependency.decl.blueprint_type, &dep_output, &dep_project);
            match consume {
                Some(fut) => fut.await?,
                None => {
                    return Err(EngineError::IncompatibleDependency {
                        artifact: created_artifact.name().to_string(),
                        dependency_type: dependency.decl.blueprint_type.clone(),
                    });
                }
            }
        }

        match blueprint.build_hook(artifact_root, project, config).await? {
            BuildExitCode::Success => {
                let output = collect_artifact_output(artifact_root)?;
                let mut built = created_artifact;
                built.output = Some(output.clone());
                self.cache.cache_artifact(&built, config, output).await?;
                info!(fingerprint, "artifact built and cached");
                Ok(BuildExitCode::Success)
            }
            // A blueprint that returns `Cached`/`Failed` directly (rather
            // than raising an error) is honored as-is; neither writes a
            // cache entry.
            other => Ok(other),
        }
    }

    /// Best-effort removal of the gate entry once its holder is done, so the
    /// map does not grow without bound. Skipped if another caller is still
    /// waiting on the same gate.
    fn release_gate(&self, fingerprint: &str, gate: Arc<Mutex<()>>) {
        if Arc::strong_count(&gate) <= 2 {
            self.build_gates.remove_if(fingerprint, |_, existing| Arc::ptr_eq(existing, &gate));
        } else {
            warn!(fingerprint, "build gate still has waiters, leaving entry in place");
        }
    }
}

/// Walk `artifact_root` and list every file beneath it, sorted, as the
/// `ArtifactOutput` a successful build produced.
fn collect_artifact_output(artifact_root: &AbsDirPath) -> ManagerResult<ArtifactOutput> {
    use crate::path::AbsFilePath;

    let mut file_paths = Vec::new();
    for entry in jwalk::WalkDir::new(artifact_root.as_std_path()) {
        let entry = entry.map_err(|err| EngineError::io(artifact_root.as_std_path(), std::io::Error::other(err)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = AbsFilePath::try_from(entry.path())
            .map_err(|err| EngineError::io(artifact_root.as_std_path(), std::io::Error::other(err.to_string())))?;
        file_paths.push(path);
    }
    file_paths.sort_by(|a, b| a.as_std_path().cmp(b.as_std_path()));

    Ok(ArtifactOutput::builder().artifact_root(artifact_root.clone()).file_paths(file_paths).build())
}
