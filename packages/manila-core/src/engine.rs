//! The top-level facade: wires the execution graph, scheduler, and artifact
//! manager together behind the two operations `spec.md` §7 exposes from the
//! core (`create_execution_graph`, `execute`).
//!
//! Everything this module depends on beyond those three components is an
//! external collaborator (`crate::collab`): which blueprint builds a given
//! artifact, and how a job's `script-invocation`/`shell-command` actions are
//! actually carried out. The engine dispatches to those collaborators; it
//! never decides what they do.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    collab::{BlueprintResolver, BoxFuture, CommandRunner, ScriptRunner},
    error::EngineError,
    graph::ExecutionGraph,
    manager::ArtifactManager,
    scheduler::{NodeExecutor, Scheduler},
    value::{BuildConfig, BuildExitCode, CreatedArtifact, Executable, ExecutionNode, Job, JobAction, Project, Workspace},
};

/// `tokio::process::Command`-backed [`CommandRunner`], draining the child on
/// cancellation rather than killing it (`spec.md` §6's "nodes that have
/// begun their final OS-level action must be drained, not killed abruptly").
#[derive(Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run_command<'a>(&'a self, command: &'a str, args: &'a [String]) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            let status = tokio::process::Command::new(command)
                .args(args)
                .status()
                .await
                .map_err(|err| EngineError::io(command, err))?;
            if status.success() {
                Ok(())
            } else {
                Err(EngineError::BuildFailed {
                    node: None,
                    reason: format!("command {command:?} exited with {status}"),
                })
            }
        })
    }
}

/// Everything besides the graph/scheduler/manager that running a job or
/// artifact build needs, gathered behind one handle so [`Engine::new`]
/// doesn't take a growing argument list as collaborators are added.
pub struct EngineCollaborators {
    pub blueprints: Arc<dyn BlueprintResolver>,
    pub scripts: Arc<dyn ScriptRunner>,
    pub commands: Arc<dyn CommandRunner>,
}

/// The project and build config an artifact build or job runs under.
///
/// Threaded through [`Engine::execute`] since neither the graph nor the
/// scheduler know about projects or configs; only the manager does.
#[derive(Clone)]
pub struct ExecutionContext {
    pub project: Project,
    pub config: BuildConfig,
    pub invalidate_cache: bool,
}

/// Wires the execution graph, scheduler, and artifact manager together.
pub struct Engine {
    manager: Arc<ArtifactManager>,
    collaborators: EngineCollaborators,
}

impl Engine {
    pub fn new(manager: Arc<ArtifactManager>, collaborators: EngineCollaborators) -> Self {
        Self { manager, collaborators }
    }

    /// Build the frozen [`ExecutionGraph`] for a configured workspace.
    ///
    /// Deterministic: node identifiers and edges are entirely a function of
    /// `workspace.jobs`/`workspace.artifacts`, so two calls over structurally
    /// identical input (even attached via a different flattening order)
    /// produce the same graph, per the monotonicity property in `spec.md`
    /// §9.
    #[instrument(skip(workspace))]
    pub fn create_execution_graph(workspace: &Workspace) -> Result<ExecutionGraph, EngineError> {
        let mut graph = ExecutionGraph::new();
        let mut by_identifier: std::collections::HashMap<String, crate::value::ExecutableId> = std::collections::HashMap::new();

        let mut artifact_nodes: Vec<(ExecutionNode, Vec<String>)> = Vec::new();
        let mut seen_artifacts = std::collections::HashSet::new();
        for artifact in &workspace.artifacts {
            collect_artifact_nodes(artifact, &mut artifact_nodes, &mut seen_artifacts);
        }
        for (node, _) in &artifact_nodes {
            by_identifier.insert(node.identifier(), node.executable_id);
        }

        let mut job_nodes = Vec::with_capacity(workspace.jobs.len());
        for job in &workspace.jobs {
            let node = ExecutionNode::new(Executable::Job(job.clone()));
            by_identifier.insert(node.identifier(), node.executable_id);
            job_nodes.push((node, job.dependencies.clone()));
        }

        for (node, dep_identifiers) in artifact_nodes {
            let deps = resolve_dependencies(&dep_identifiers, &by_identifier);
            graph.attach(node, deps);
        }
        for (node, dep_identifiers) in job_nodes {
            let deps = resolve_dependencies(&dep_identifiers, &by_identifier);
            graph.attach(node, deps);
        }

        Ok(graph)
    }

    /// Run the scheduler over `graph` to satisfy `job_identifier`.
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        job_identifier: &str,
        context: ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<BuildExitCode, EngineError> {
        let target = graph
            .find(job_identifier)
            .ok_or_else(|| EngineError::NotCached(job_identifier.to_string()))?
            .executable_id;

        let executor = Arc::new(EngineNodeExecutor {
            manager: self.manager.clone(),
            blueprints: self.collaborators.blueprints.clone(),
            scripts: self.collaborators.scripts.clone(),
            commands: self.collaborators.commands.clone(),
            context,
        });

        Scheduler::new().execute(graph, target, executor, cancel).await
    }
}

/// Recursively flattens a [`CreatedArtifact`]'s dependency closure into the
/// flat `(node, direct_dep_identifiers)` list [`Engine::create_execution_graph`]
/// attaches from, deduplicating by `{project}/{artifact}` identifier so a
/// diamond-shaped dependency is only attached once.
fn collect_artifact_nodes(
    artifact: &CreatedArtifact,
    out: &mut Vec<(ExecutionNode, Vec<String>)>,
    seen: &mut std::collections::HashSet<String>,
) {
    let identifier = format!("{}/{}", artifact.project_ref(), artifact.name());
    if !seen.insert(identifier) {
        return;
    }
    for dependency in &artifact.dependencies {
        collect_artifact_nodes(dependency, out, seen);
    }
    let dep_identifiers = artifact
        .dependencies
        .iter()
        .map(|dep| format!("{}/{}", dep.project_ref(), dep.name()))
        .collect();
    let node = ExecutionNode::new(Executable::ArtifactBuild(artifact.clone()));
    out.push((node, dep_identifiers));
}

fn resolve_dependencies(
    identifiers: &[String],
    by_identifier: &std::collections::HashMap<String, crate::value::ExecutableId>,
) -> Vec<crate::value::ExecutableId> {
    identifiers
        .iter()
        .filter_map(|identifier| {
            let id = by_identifier.get(identifier).copied();
            if id.is_none() {
                warn!(identifier, "dependency identifier did not resolve to any attached node");
            }
            id
        })
        .collect()
}

struct EngineNodeExecutor {
    manager: Arc<ArtifactManager>,
    blueprints: Arc<dyn BlueprintResolver>,
    scripts: Arc<dyn ScriptRunner>,
    commands: Arc<dyn CommandRunner>,
    context: ExecutionContext,
}

impl NodeExecutor for EngineNodeExecutor {
    fn execute<'a>(&'a self, node: &'a ExecutionNode) -> BoxFuture<'a, Result<BuildExitCode, EngineError>> {
        Box::pin(async move {
            match &node.executable {
                Executable::Job(job) => self.run_job(job).await,
                Executable::ArtifactBuild(artifact) => self.run_artifact_build(artifact).await,
                Executable::NoOp => Ok(BuildExitCode::Success),
            }
        })
    }
}

impl EngineNodeExecutor {
    async fn run_job(&self, job: &Job) -> Result<BuildExitCode, EngineError> {
        for action in &job.actions {
            match action {
                JobAction::ScriptInvocation { script } => self.scripts.run_script(script).await?,
                JobAction::ShellCommand { command, args } => self.commands.run_command(command, args).await?,
                JobAction::LogEmission { level, message } => {
                    info!(job = job.name.as_str(), level = level.as_str(), message = message.as_str(), "job log");
                }
            }
        }
        Ok(BuildExitCode::Success)
    }

    async fn run_artifact_build(&self, artifact: &CreatedArtifact) -> Result<BuildExitCode, EngineError> {
        let blueprint = self.blueprints.resolve(&artifact.decl.plugin_component_ref).ok_or_else(|| {
            EngineError::BuildFailed {
                node: None,
                reason: format!("no blueprint registered for {:?}", artifact.decl.plugin_component_ref),
            }
        })?;

        self.manager
            .build_from_dependencies(
                blueprint.as_ref(),
                artifact.clone(),
                &self.context.project,
                &self.context.config,
                self.context.invalidate_cache,
            )
            .await
    }
}
