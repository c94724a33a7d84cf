//! Platform Core Library
//!
//! Checks out a set of git repositories onto a named context, computes
//! dependency-closure content hashes, builds repositories in dependency order
//! and drives release pipelines against the result.

pub mod builder;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod fakes;
pub mod git;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod resolver;
pub mod telemetry;

pub use builder::{
    branch_tag, build_arg_name, BuildConfigCache, BuildReport, BuiltRepository, ImageBuilder,
    RepositoryBuilder, BUILD_CONFIG_FILE,
};
pub use command::{silent_from_env, Command, CommandOutput, CommandRunner, ProcessRunner};
pub use config::{PlatformConfig, DEFAULT_CONFIG_FILE};
pub use context::{ContextManager, ContextOutcome, SkipReason};
pub use error::{
    BuildError, CommandError, ConfigError, GitError, GitOperation, PlatformError, Result,
    TemplateError,
};
pub use git::{GitRepositories, RepositoryProvider};
pub use graph::DependencyGraph;
pub use model::{
    BuildConfig, Context, ContextId, ImageSpec, PipelineId, Platform, Repository, RepositoryId,
    RepositoryInfo, RepositoryInfos, SourcesCommand,
};
pub use orchestrator::{Orchestrator, PipelineExecutor};
pub use resolver::ClosureResolver;
pub use telemetry::init_tracing;
