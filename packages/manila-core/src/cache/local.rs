//! The local artifact cache tier: a fingerprint-keyed map persisted to a
//! single JSON file, plus the deterministic on-disk artifact root layout
//! (`spec.md` §5.B).

use std::{
    collections::BTreeMap,
    io::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use jiff::Timestamp;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::{CacheResult, EngineError},
    fingerprint,
    fs::{Locked, LockFile},
    path::{AbsDirPath, AbsFilePath, TryJoinWith as _},
    value::{ArtifactOutput, BuildConfig, CacheEntry, CreatedArtifact, Project},
};

/// Fingerprint-keyed, JSON-backed artifact cache.
///
/// The map is a `BTreeMap` rather than a `HashMap` so that [`LocalCache::flush`]
/// writes a deterministically ordered file, which makes the "crash leaves
/// either the old or new file intact" invariant easy to test.
#[derive(Debug)]
pub struct LocalCache {
    cache_file: AbsFilePath,
    artifacts_dir: AbsDirPath,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
    loaded: AtomicBool,
    /// Held for the lifetime of the cache once [`LocalCache::load`] succeeds,
    /// enforcing that the cache file is exclusively owned by this process for
    /// the duration of a run. Dropping the cache (or the lock itself) frees
    /// it; nothing in this module unlocks it explicitly.
    lock: RwLock<Option<LockFile<Locked>>>,
}

impl LocalCache {
    /// Root the cache at `cache_root`; `cache_root/cache.json` holds the
    /// persisted map, `cache_root/artifacts` holds materialized outputs.
    pub fn new(cache_root: AbsDirPath) -> Self {
        let cache_file = cache_root
            .try_join_file("cache.json")
            .expect("\"cache.json\" is a valid path segment");
        let artifacts_dir = cache_root
            .try_join_dir("artifacts")
            .expect("\"artifacts\" is a valid path segment");
        Self {
            cache_file,
            artifacts_dir,
            entries: RwLock::new(BTreeMap::new()),
            loaded: AtomicBool::new(false),
            lock: RwLock::new(None),
        }
    }

    /// Read the persisted map from disk. A missing file is treated as an
    /// empty cache; a present-but-unparseable file is `CacheCorruption`.
    ///
    /// Idempotent, but logs a warning if called more than once: re-loading
    /// discards any in-memory entries written since the first load. The
    /// process-exclusive lock is acquired once, on the first successful call.
    #[instrument(skip(self))]
    pub async fn load(&self) -> CacheResult<()> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            warn!(path = ?self.cache_file, "cache reloaded; discarding in-memory entries");
        } else {
            self.acquire_lock().await?;
        }

        let bytes = match crate::fs::read_buffered(&self.cache_file).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(path = ?self.cache_file, "no existing cache file, starting empty");
                return Ok(());
            }
            Err(err) => {
                return Err(EngineError::io(
                    self.cache_file.as_std_path(),
                    std::io::Error::other(err.to_string()),
                ));
            }
        };

        let parsed: BTreeMap<String, CacheEntry> = serde_json::from_slice(&bytes)
            .map_err(|err| EngineError::cache_corruption(self.cache_file.as_std_path(), err))?;
        *self.entries.write().await = parsed;
        Ok(())
    }

    /// Open and lock `{cache_file}.lock` beside the cache file, guarding
    /// against two engine invocations pointed at the same cache root.
    async fn acquire_lock(&self) -> CacheResult<()> {
        let mut lock_path = self.cache_file.as_std_path().as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = AbsFilePath::try_from(std::path::PathBuf::from(lock_path))
            .map_err(|err| EngineError::io(self.cache_file.as_std_path(), std::io::Error::other(err.to_string())))?;

        let unlocked = LockFile::open(lock_path.clone())
            .await
            .map_err(|err| EngineError::io(lock_path.as_std_path(), std::io::Error::other(err.to_string())))?;
        let locked = unlocked
            .lock()
            .await
            .map_err(|err| EngineError::io(lock_path.as_std_path(), std::io::Error::other(err.to_string())))?;
        *self.lock.write().await = Some(locked);
        Ok(())
    }

    /// Atomically persist the current map: write to a temp file beside the
    /// target, fsync, then rename over it. A no-op if the map is empty, so
    /// an unused cache never creates a file.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> CacheResult<()> {
        let map = self.entries.read().await;
        if map.is_empty() {
            trace!("cache is empty, skipping flush");
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(&*map).expect("CacheEntry map is always serializable");
        drop(map);

        let cache_file = self.cache_file.clone();
        let tmp_path = {
            let mut name = cache_file.as_std_path().as_os_str().to_owned();
            name.push(".tmp");
            std::path::PathBuf::from(name)
        };

        tokio::task::spawn_blocking(move || -> CacheResult<()> {
            if let Some(parent) = cache_file.as_std_path().parent() {
                std::fs::create_dir_all(parent).map_err(|err| EngineError::io(parent, err))?;
            }
            let mut file = std::fs::File::create(&tmp_path).map_err(|err| EngineError::io(&tmp_path, err))?;
            file.write_all(&json).map_err(|err| EngineError::io(&tmp_path, err))?;
            file.sync_all().map_err(|err| EngineError::io(&tmp_path, err))?;
            std::fs::rename(&tmp_path, cache_file.as_std_path())
                .map_err(|err| EngineError::io(cache_file.as_std_path(), err))?;
            Ok(())
        })
        .await
        .expect("join task")?;

        debug!(path = ?self.cache_file, "flushed cache");
        Ok(())
    }

    /// Whether an entry exists for `fingerprint`.
    pub async fn is_cached(&self, fingerprint: &str) -> bool {
        self.entries.read().await.contains_key(fingerprint)
    }

    /// Compute the deterministic on-disk layout for an artifact build:
    /// `{artifacts_dir}/{platform}-{arch}/{project}-{artifact}/{fingerprint}/{config_key}/`.
    pub fn artifact_root_for(
        &self,
        config: &BuildConfig,
        project_name: &str,
        artifact_name: &str,
        fingerprint: &str,
    ) -> CacheResult<AbsDirPath> {
        let platform_arch = format!("{}-{}", config.platform, config.architecture);
        let project_artifact = format!("{project_name}-{artifact_name}");
        self.artifacts_dir
            .try_join_dirs([platform_arch.as_str(), project_artifact.as_str(), fingerprint, config.config_key().as_str()])
            .map_err(|err| EngineError::io(self.artifacts_dir.as_std_path(), std::io::Error::other(err.to_string())))
    }

    /// Insert or overwrite the entry for this artifact's fingerprint,
    /// stamping `created_at = last_accessed = now`. Returns the fingerprint.
    #[instrument(skip(self, artifact, config, output))]
    pub async fn cache_artifact(
        &self,
        artifact: &CreatedArtifact,
        config: &BuildConfig,
        output: ArtifactOutput,
    ) -> CacheResult<String> {
        let fingerprint = fingerprint::fingerprint_artifact(artifact, config)?;
        let size = total_size(&output.file_paths).await?;
        let now = Timestamp::now();

        let entry = CacheEntry::builder()
            .artifact_root(output.artifact_root.clone())
            .fingerprint(fingerprint.clone())
            .created_at(now)
            .last_accessed(now)
            .size(size)
            .log_cache(artifact.log_cache.clone().unwrap_or_default())
            .output(output)
            .blueprint_type(artifact.decl.blueprint_type.clone())
            .build();

        self.entries.write().await.insert(fingerprint.clone(), entry);
        Ok(fingerprint)
    }

    /// Bump `last_accessed` for `fingerprint`. No-ops silently if absent.
    pub async fn update_access_time(&self, fingerprint: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(fingerprint) {
            entry.last_accessed = Timestamp::now();
        }
    }

    /// If a cache entry exists for `artifact`'s fingerprint, attach its
    /// stored `LogCache` to the returned artifact. Unchanged otherwise.
    pub async fn append_cached_data(
        &self,
        mut artifact: CreatedArtifact,
        config: &BuildConfig,
    ) -> CacheResult<CreatedArtifact> {
        let fingerprint = fingerprint::fingerprint_artifact(&artifact, config)?;
        if let Some(entry) = self.entries.read().await.get(&fingerprint) {
            artifact.log_cache = Some(entry.log_cache.clone());
        }
        Ok(artifact)
    }

    /// Among entries whose artifact root's `{project}-{artifact}` path
    /// segment begins with `"{project.name}-"`, the output of the one with
    /// the largest `last_accessed`.
    pub async fn most_recent_output_for_project(&self, project: &Project) -> CacheResult<ArtifactOutput> {
        let prefix = format!("{}-", project.name);
        let map = self.entries.read().await;
        map.values()
            .filter(|entry| {
                project_artifact_segment(&entry.artifact_root).is_some_and(|segment| segment.starts_with(&prefix))
            })
            .max_by_key(|entry| entry.last_accessed)
            .map(|entry| entry.output.clone())
            .ok_or_else(|| EngineError::NotCached(project.name.clone()))
    }
}

/// Extract the `{project}-{artifact}` directory name from an artifact root
/// laid out per [`LocalCache::artifact_root_for`]: two levels up from the
/// `config_key` leaf is the `{fingerprint}` directory, and one more up is
/// the `{project}-{artifact}` directory.
fn project_artifact_segment(artifact_root: &AbsDirPath) -> Option<String> {
    let fingerprint_dir = artifact_root.parent()?;
    let project_artifact_dir = fingerprint_dir.parent()?;
    project_artifact_dir.file_name_str_lossy().map(|s| s.into_owned())
}

async fn total_size(paths: &[AbsFilePath]) -> CacheResult<u64> {
    let mut total = 0u64;
    for path in paths {
        if let Some(meta) = crate::fs::metadata(path.as_std_path())
            .await
            .map_err(|err| EngineError::io(path.as_std_path(), std::io::Error::other(err.to_string())))?
        {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::value::{Architecture, ArtifactDecl, Platform, SourceSet};

    fn config() -> BuildConfig {
        BuildConfig::builder()
            .profile("Debug")
            .platform(Platform::Linux)
            .architecture(Architecture::X64)
            .build()
    }

    fn artifact(root: &AbsDirPath) -> CreatedArtifact {
        let decl = ArtifactDecl::builder()
            .name("cli")
            .project_ref("app")
            .plugin_component_ref("rust-binary")
            .source_sets(vec![SourceSet::builder().root(root.clone()).includes(vec![]).excludes(vec![]).build()])
            .dependency_refs(vec![])
            .blueprint_type("binary".to_string())
            .build();
        CreatedArtifact::builder().decl(decl).dependencies(vec![]).build()
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(AbsDirPath::try_from(dir.path()).unwrap());
        cache.load().await.unwrap();
        assert!(!cache.is_cached("deadbeef").await);
    }

    #[tokio::test]
    async fn cache_artifact_then_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::new(root.clone());
        cache.load().await.unwrap();

        let config = config();
        let created = artifact(&root);
        let output = ArtifactOutput::builder().artifact_root(root.clone()).file_paths(vec![]).build();
        let fingerprint = cache.cache_artifact(&created, &config, output).await.unwrap();
        assert!(cache.is_cached(&fingerprint).await);
    }

    #[tokio::test]
    async fn flush_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::new(root.clone());
        cache.load().await.unwrap();

        let config = config();
        let created = artifact(&root);
        let output = ArtifactOutput::builder().artifact_root(root.clone()).file_paths(vec![]).build();
        let fingerprint = cache.cache_artifact(&created, &config, output).await.unwrap();
        cache.flush().await.unwrap();

        let reloaded = LocalCache::new(root);
        reloaded.load().await.unwrap();
        assert!(reloaded.is_cached(&fingerprint).await);
    }

    #[tokio::test]
    async fn update_access_time_on_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(AbsDirPath::try_from(dir.path()).unwrap());
        cache.load().await.unwrap();
        cache.update_access_time("nonexistent").await;
    }

    #[tokio::test]
    async fn most_recent_output_for_project_picks_latest() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let cache = LocalCache::new(root.clone());
        cache.load().await.unwrap();

        let config = config();
        let created = artifact(&root);
        let project = crate::value::Project { name: "app".to_string() };

        let artifact_root = cache
            .artifact_root_for(&config, "app", "cli", "fingerprint-one")
            .unwrap();
        let output = ArtifactOutput::builder().artifact_root(artifact_root).file_paths(vec![]).build();
        cache.cache_artifact(&created, &config, output).await.unwrap();

        let found = cache.most_recent_output_for_project(&project).await.unwrap();
        assert_eq!(found.file_paths.len(), 0);
    }

    #[tokio::test]
    async fn most_recent_output_for_project_missing_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(AbsDirPath::try_from(dir.path()).unwrap());
        cache.load().await.unwrap();
        let project = crate::value::Project { name: "app".to_string() };
        let err = cache.most_recent_output_for_project(&project).await.unwrap_err();
        assert!(matches!(err, EngineError::NotCached(_)));
    }
}
