//! Error taxonomy for platform operations.
//!
//! Every layer has its own enum; [`PlatformError`] is what the orchestrator
//! surfaces. Git and build failures always carry the repository id so a
//! failure deep inside a multi-repository loop is still diagnosable.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command executable can not be empty")]
    EmptyExecutable,

    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` failed ({status}){}", output_suffix(.output))]
    Failed {
        program: String,
        status: String,
        output: String,
    },
}

fn output_suffix(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!(": {output}")
    }
}

/// Invalid platform configuration. Always raised before any repository is
/// touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("repoSrc must not be empty")]
    EmptyRepoSrc,

    #[error("context with id {context} not found")]
    ContextNotFound { context: String },

    #[error("context {context} references unexpected repository {repository}")]
    UnknownRepository { context: String, repository: String },

    #[error("base context {base} for context {context} not found")]
    UnknownBaseContext { context: String, base: String },

    #[error("repository {repository} depends on unknown repository {dependency}")]
    UnknownDependency {
        repository: String,
        dependency: String,
    },

    #[error("dependency cycle detected involving repositories: {}", .repos.join(" -> "))]
    DependencyCycle { repos: Vec<String> },

    #[error("context {context} has no branch for repository {repository}")]
    MissingBranch { context: String, repository: String },

    #[error("pipeline {pipeline} not found")]
    PipelineNotFound { pipeline: String },
}

/// The git operation that failed, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitOperation {
    Clone,
    Fetch,
    Checkout,
    Hash,
    BranchName,
    BranchLookup,
    Reset,
    Clean,
    Merge,
    Push,
}

impl fmt::Display for GitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GitOperation::Clone => "clone",
            GitOperation::Fetch => "fetch",
            GitOperation::Checkout => "checkout",
            GitOperation::Hash => "read commit hash of",
            GitOperation::BranchName => "read branch name of",
            GitOperation::BranchLookup => "look up local branch in",
            GitOperation::Reset => "reset",
            GitOperation::Clean => "clean",
            GitOperation::Merge => "merge into",
            GitOperation::Push => "push",
        };
        f.write_str(name)
    }
}

/// Git-level failure for one repository.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to {operation} repository {repository}: {source}")]
    Command {
        repository: String,
        operation: GitOperation,
        #[source]
        source: CommandError,
    },

    #[error("branch for repository {repository} is empty")]
    EmptyBranch { repository: String },

    #[error(
        "failed to inspect checkout of repository {repository} at {}: {source}",
        .path.display()
    )]
    Inspect {
        repository: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    pub fn operation(&self) -> Option<GitOperation> {
        match self {
            GitError::Command { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Source or image build failure.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to read build config {}: {source}", .path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse build config {}: {source}", .path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("repository {repository} has no resolved build information")]
    UnknownRepository { repository: String },

    #[error("image {image} of repository {repository} is tagged by unknown repository {tag_by}")]
    UnknownTagBy {
        repository: String,
        image: String,
        tag_by: String,
    },

    #[error("failed to build sources of repository {repository}: {source}")]
    Sources {
        repository: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to build image {image} of repository {repository}: {source}")]
    Image {
        repository: String,
        image: String,
        #[source]
        source: CommandError,
    },

    #[error("failed to push image {tag} of repository {repository}: {source}")]
    Push {
        repository: String,
        tag: String,
        #[source]
        source: CommandError,
    },
}

/// Pipeline template failure. Wrapped with the pipeline id by
/// [`PlatformError::Template`].
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("no template configured")]
    NotFound,

    #[error("failed to read template {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("undefined variable `{name}` on line {line}")]
    UndefinedVariable { name: String, line: usize },

    #[error("variable `{name}` on line {line} is an object and can not be rendered")]
    NotRenderable { name: String, line: usize },

    #[error("variable `{name}` on line {line} can not be iterated")]
    NotIterable { name: String, line: usize },

    #[error("failed to write pipeline script: {source}")]
    ScratchFile {
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by the platform orchestrator.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("failed to render {pipeline} pipeline: {source}")]
    Template {
        pipeline: String,
        #[source]
        source: TemplateError,
    },

    #[error("pipeline {pipeline} failed: {source}")]
    Pipeline {
        pipeline: String,
        #[source]
        source: CommandError,
    },

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Several independent failures, e.g. a failed merge followed by a
    /// failed reset of the same repository.
    #[error("{} errors occurred: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<PlatformError>),
}

fn join_messages(errors: &[PlatformError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PlatformError {
    /// Combine several errors into one. A single error is returned as is.
    pub fn join(mut errors: Vec<PlatformError>) -> PlatformError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            PlatformError::Multiple(errors)
        }
    }

    /// Every underlying cause, flattened.
    pub fn causes(&self) -> Vec<&PlatformError> {
        match self {
            PlatformError::Multiple(errors) => errors.iter().flat_map(|e| e.causes()).collect(),
            other => vec![other],
        }
    }
}

/// Result type for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;
