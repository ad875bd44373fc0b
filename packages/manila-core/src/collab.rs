//! External collaborator seams (`spec.md` §7).
//!
//! The core never implements these traits itself and never calls back into
//! script code mid-execution: a script host produces fully-typed
//! `Workspace`/`Project` records before graph construction, and a plugin
//! system provides the blueprint hooks the artifact manager invokes. This is
//! the "dynamic typing / duck-typing bridge" design note resolved as an
//! explicit configuration builder boundary, matching how this codebase seams
//! off its other swappable implementations (`CacheBackend`).

use std::{future::Future, pin::Pin};

use crate::{
    error::EngineError,
    path::AbsDirPath,
    value::{ArtifactOutput, BuildConfig, BuildExitCode, Project, Workspace},
};

/// A boxed, owned future — the object-safe shape `PluginComponent` and
/// `ScriptContext` need so they can be stored as trait objects and swapped by
/// the plugin loader (out of scope for this crate) at runtime.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces the fully-typed configuration records this crate consumes.
///
/// The core does not care how these are produced, only that they are
/// complete before graph construction begins.
pub trait ScriptContext: Send + Sync {
    /// Evaluate the workspace script, producing the full project list.
    fn run_workspace_script(&self) -> BoxFuture<'_, Result<Workspace, EngineError>>;

    /// Evaluate a single project's script.
    fn run_project_script(&self, workspace: &Workspace) -> BoxFuture<'_, Result<Project, EngineError>>;
}

/// The plugin-provided recipe for an artifact.
///
/// Supplies a mandatory `build_hook` and an optional `consume_hook`; an
/// artifact's blueprint that has no use for a given dependency's output
/// simply returns `None` from `consume_hook`, which the artifact manager
/// turns into `IncompatibleDependency`.
pub trait PluginComponent: Send + Sync {
    /// Build the artifact at `artifact_root`. Invoked by the artifact
    /// manager after dependency consumption (`spec.md` §5.D step 9).
    fn build_hook<'a>(
        &'a self,
        artifact_root: &'a AbsDirPath,
        project: &'a Project,
        config: &'a BuildConfig,
    ) -> BoxFuture<'a, Result<BuildExitCode, EngineError>>;

    /// Consume a dependency's output, if this blueprint knows how to consume
    /// artifacts of `dependency_blueprint_type`.
    fn consume_hook<'a>(
        &'a self,
        dependency_blueprint_type: &'a str,
        dependency_output: &'a ArtifactOutput,
        dependency_project: &'a Project,
    ) -> Option<BoxFuture<'a, Result<(), EngineError>>>;
}

/// Resolves an [`crate::value::ArtifactDecl::plugin_component_ref`] to the
/// concrete [`PluginComponent`] that knows how to build it.
///
/// Matches the plugin-discovery seam named in `spec.md` §7: the core does
/// not know how plugins are loaded or packaged, only that, given a
/// reference string, one can be produced.
pub trait BlueprintResolver: Send + Sync {
    fn resolve(&self, plugin_component_ref: &str) -> Option<std::sync::Arc<dyn PluginComponent>>;
}

/// Executes the payload of a [`crate::value::JobAction::ScriptInvocation`].
///
/// The core defines the closed `JobAction` taxonomy (`spec.md` §4) but does
/// not interpret script bodies itself (script-language semantics are a
/// non-goal, `spec.md` §1); running one is delegated to this collaborator.
pub trait ScriptRunner: Send + Sync {
    fn run_script<'a>(&'a self, script: &'a str) -> BoxFuture<'a, Result<(), EngineError>>;
}

/// Executes a [`crate::value::JobAction::ShellCommand`].
///
/// Kept as a trait, rather than calling `tokio::process::Command` directly
/// from the engine, so tests can substitute a fake without spawning real
/// processes, and so the cooperative-cancellation/draining behavior for
/// "a spawned subprocess must be drained, not killed abruptly" (`spec.md`
/// §6) is pluggable per platform.
pub trait CommandRunner: Send + Sync {
    fn run_command<'a>(&'a self, command: &'a str, args: &'a [String]) -> BoxFuture<'a, Result<(), EngineError>>;
}
