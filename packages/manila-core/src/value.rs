//! Immutable descriptors consumed by the graph, scheduler, manager, and cache.
//!
//! Everything in this module is declared during configuration (by the script
//! host, out of scope for this crate) and becomes immutable before execution
//! begins, per the lifecycle invariant in `spec.md` §4.

use std::fmt;

use bon::Builder;
use derive_more::Display;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::{AbsDirPath, AbsFilePath};

/// A 128-bit random identifier for an [`ExecutionNode`].
///
/// Its hex form is used for log correlation (each node runs inside a
/// `tracing::info_span!` keyed by this id).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{}", _0.simple())]
pub struct ExecutableId(Uuid);

impl ExecutableId {
    /// Mint a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Render the hex form used for log correlation.
    pub fn as_hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for ExecutableId {
    fn default() -> Self {
        Self::new()
    }
}

/// The operating system family an artifact is built for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[display("windows")]
    Windows,
    #[display("linux")]
    Linux,
    #[display("macos")]
    Macos,
}

/// The CPU architecture an artifact is built for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[display("x86")]
    X86,
    #[display("x64")]
    X64,
    #[display("arm64")]
    Arm64,
    #[display("any")]
    Any,
}

/// A single extra, project-type-specific configuration field.
///
/// Base fields (`profile`, `platform`, `architecture`) are always
/// fingerprint-contributing; extra fields carry their own tag since project
/// types recognize different extension fields and not all of them influence
/// the artifact's identity (e.g. a verbosity flag does not change the output).
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize, Builder)]
pub struct ConfigField {
    pub name: String,
    pub value: String,
    pub fingerprint_contributing: bool,
}

/// A single build's typed configuration record.
///
/// Produced by the external script host (`spec.md` §2.C), not read from a
/// config file by this crate. Only fields tagged as fingerprint-contributing
/// influence [`crate::fingerprint::hash_config`].
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize, Builder)]
pub struct BuildConfig {
    pub profile: String,
    pub platform: Platform,
    pub architecture: Architecture,

    /// Project-type-specific fields beyond the base three, in declaration
    /// order.
    #[builder(default)]
    pub extra: Vec<ConfigField>,
}

impl BuildConfig {
    /// The string form of every fingerprint-contributing field, in declared
    /// field order (`profile`, `platform`, `architecture`, then `extra` in
    /// declaration order).
    pub fn fingerprint_fields(&self) -> Vec<String> {
        let mut fields = vec![self.profile.clone(), self.platform.to_string(), self.architecture.to_string()];
        fields.extend(
            self.extra
                .iter()
                .filter(|f| f.fingerprint_contributing)
                .map(|f| f.value.clone()),
        );
        fields
    }

    /// A deterministic, filesystem-safe key derived from the fingerprint
    /// fields, used as the last path component of the artifact root layout
    /// (`spec.md` §5.B).
    pub fn config_key(&self) -> String {
        crate::fingerprint::hash_config(self)
    }
}

/// `{ root, includes, excludes }`: produces a finite, deterministic ordered
/// sequence of absolute file paths when materialized.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize, Builder)]
pub struct SourceSet {
    pub root: AbsDirPath,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl SourceSet {
    /// Walk `root`, keep paths matching at least one `includes` glob and no
    /// `excludes` glob, and return them sorted lexicographically by
    /// root-relative path.
    ///
    /// Supplements the distilled spec (which specifies the output shape but
    /// not how it gets there, `spec.md` §5.A): this separation keeps
    /// `hash_file_set` itself free of any filesystem-walk-order sensitivity.
    pub fn materialize(&self) -> Result<Vec<AbsFilePath>, crate::error::EngineError> {
        use crate::error::EngineError;

        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>, EngineError> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p)
                        .map_err(|err| EngineError::io(self.root.as_std_path(), std::io::Error::other(err)))
                })
                .collect()
        };
        let includes = compile(&self.includes)?;
        let excludes = compile(&self.excludes)?;

        let mut matches = Vec::new();
        for entry in jwalk::WalkDir::new(self.root.as_std_path()) {
            let entry =
                entry.map_err(|err| EngineError::io(self.root.as_std_path(), std::io::Error::other(err)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let rel = path.strip_prefix(self.root.as_std_path()).unwrap_or(&path);
            let rel_str = rel.to_string_lossy();
            if !includes.iter().any(|pat| pat.matches(&rel_str)) {
                continue;
            }
            if excludes.iter().any(|pat| pat.matches(&rel_str)) {
                continue;
            }
            let path = AbsFilePath::try_from(path)
                .map_err(|err| EngineError::io(self.root.as_std_path(), std::io::Error::other(err.to_string())))?;
            matches.push(path);
        }
        matches.sort_by(|a, b| a.as_std_path().cmp(b.as_std_path()));
        Ok(matches)
    }
}

/// A reference to another artifact by `(project, artifact_name)`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct DependencyRef {
    pub project: String,
    pub artifact: String,
}

/// An artifact as declared by a project script, before dependency resolution.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct ArtifactDecl {
    pub name: String,
    pub project_ref: String,
    pub plugin_component_ref: String,
    pub source_sets: Vec<SourceSet>,
    pub dependency_refs: Vec<DependencyRef>,
    pub blueprint_type: String,
    #[builder(default)]
    pub description: String,
}

/// The declaration plus a resolved dependency closure.
///
/// After execution an [`ArtifactOutput`] and [`LogCache`] are attached by the
/// artifact manager / cache.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct CreatedArtifact {
    pub decl: ArtifactDecl,
    pub dependencies: Vec<CreatedArtifact>,
    #[builder(default)]
    pub output: Option<ArtifactOutput>,
    #[builder(default)]
    pub log_cache: Option<LogCache>,
}

impl CreatedArtifact {
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn project_ref(&self) -> &str {
        &self.decl.project_ref
    }
}

/// `{ artifact_root, file_paths }`: the set of files an artifact build
/// produced.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOutput {
    pub artifact_root: AbsDirPath,
    pub file_paths: Vec<AbsFilePath>,
}

/// A single replayable log entry attached to a cache entry.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
}

/// A replayable sequence of log entries, persisted alongside a cache entry so
/// a cache hit can still show the build's original output.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct LogCache(pub Vec<LogEntry>);

/// The persisted record for one fingerprint. Key is `fingerprint` in the
/// cache file's top-level map.
///
/// Unknown fields are preserved on round-trip via `#[serde(flatten)]` into
/// `extra`, permitting forward compatibility with newer cache writers.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub artifact_root: AbsDirPath,
    pub fingerprint: String,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    pub size: u64,
    pub log_cache: LogCache,
    pub output: ArtifactOutput,
    pub blueprint_type: String,

    #[serde(flatten)]
    #[builder(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The outcome of `Artifact Manager::build_from_dependencies` or the
/// scheduler's per-node execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BuildExitCode {
    Success,
    Cached(String),
    Failed(String),
}

impl BuildExitCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Cached(_))
    }
}

/// One of the closed set of actions a [`Job`] may perform.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobAction {
    ScriptInvocation { script: String },
    ShellCommand { command: String, args: Vec<String> },
    LogEmission { level: String, message: String },
}

/// Where a [`Job`] is declared, which determines the shape of
/// [`Job::identifier`].
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ComponentRef {
    Workspace,
    Project(String),
    Artifact(String, String),
}

/// `{ name, component_ref, dependencies, actions, blocking, description }`.
#[derive(Clone, Debug, Serialize, Deserialize, Builder)]
pub struct Job {
    pub name: String,
    pub component_ref: ComponentRef,
    pub dependencies: Vec<String>,
    pub actions: Vec<JobAction>,
    pub blocking: bool,
    #[builder(default)]
    pub description: String,
}

impl Job {
    /// `"{project}/{artifact}:{name}"`, with the `{project}/` prefix omitted
    /// for workspace-level jobs and the `/{artifact}` segment omitted for
    /// project-level jobs. Format is bit-exact (`spec.md` §5.G).
    pub fn identifier(&self) -> String {
        match &self.component_ref {
            ComponentRef::Workspace => self.name.clone(),
            ComponentRef::Project(project) => format!("{project}:{}", self.name),
            ComponentRef::Artifact(project, artifact) => {
                format!("{project}/{artifact}:{}", self.name)
            }
        }
    }
}

/// The tagged sum dispatched by the scheduler for each execution node,
/// replacing the inheritance hierarchy the original source built around a
/// single `ExecutableObject` base class.
#[derive(Clone, Debug)]
pub enum Executable {
    Job(Job),
    ArtifactBuild(CreatedArtifact),
    NoOp,
}

impl Executable {
    pub fn blocking(&self) -> bool {
        match self {
            Executable::Job(job) => job.blocking,
            Executable::ArtifactBuild(_) | Executable::NoOp => false,
        }
    }
}

/// A vertex in the execution DAG.
///
/// Equality and hashing use `executable_id` only, matching `spec.md` §4's
/// "Equality and hashing use `executable_id`" invariant: two nodes wrapping
/// structurally identical jobs are still distinct vertices if minted with
/// different ids.
#[derive(Clone, Debug)]
pub struct ExecutionNode {
    pub executable_id: ExecutableId,
    pub executable: Executable,
    /// Monotonically increasing mint order, not part of identity.
    ///
    /// `graph.rs`'s layering sorts a layer by `executable_id` for
    /// determinism, which discards declaration order; the scheduler needs
    /// declaration order back to honor "multiple blocking nodes in a layer
    /// execute in declaration order" (`spec.md` §4.F), so it is captured
    /// here at mint time instead.
    pub sequence: u64,
}

impl ExecutionNode {
    pub fn new(executable: Executable) -> Self {
        static NEXT_SEQUENCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        Self {
            executable_id: ExecutableId::new(),
            executable,
            sequence: NEXT_SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// The name the graph's `find` operation looks nodes up by: a `Job`'s
    /// bit-exact identifier, an artifact build's `{project}/{artifact}`, or
    /// (for the rare bookkeeping no-op node) the node's own hex id.
    pub fn identifier(&self) -> String {
        match &self.executable {
            Executable::Job(job) => job.identifier(),
            Executable::ArtifactBuild(artifact) => format!("{}/{}", artifact.project_ref(), artifact.name()),
            Executable::NoOp => self.executable_id.as_hex(),
        }
    }
}

impl PartialEq for ExecutionNode {
    fn eq(&self, other: &Self) -> bool {
        self.executable_id == other.executable_id
    }
}

impl Eq for ExecutionNode {}

impl std::hash::Hash for ExecutionNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.executable_id.hash(state);
    }
}

/// The minimal shape of a project the core consumes: the collaborator
/// (script host) is responsible for everything else about a project.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
}

/// The minimal shape of a workspace the core consumes.
///
/// `jobs` and `artifacts` are the flattened declarations gathered from every
/// project's script evaluation (`spec.md` §7's `ScriptContext`); dependency
/// closures among artifacts are already resolved by the time they land here
/// (`CreatedArtifact.dependencies` embeds the closure directly), and job
/// dependencies are resolved by identifier string against the whole graph
/// (`spec.md` §5.E) by [`crate::engine::Engine::create_execution_graph`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub projects: Vec<Project>,
    pub jobs: Vec<Job>,
    pub artifacts: Vec<CreatedArtifact>,
}

impl fmt::Display for BuildExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildExitCode::Success => write!(f, "success"),
            BuildExitCode::Cached(fp) => write!(f, "cached({fp})"),
            BuildExitCode::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}
