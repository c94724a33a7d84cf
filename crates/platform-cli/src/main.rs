//! Platform - multi-repository build and release orchestrator.
//!
//! The `platform` command drives a set of git repositories described by
//! `platform.json`.
//!
//! ## Commands
//!
//! - `checkout`: Put every repository on the branch of a context
//! - `build`: Check out, then build sources and images in dependency order
//! - `reset-context`: Discard local changes in every checkout
//! - `merge-context`: Check out, then merge another context's branches in
//! - `push-context`: Push context branches (dry run unless `--force`)
//! - `execute`: Run release pipelines against the current checkouts

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use platform_core::telemetry::level_for;
use platform_core::{
    init_tracing, silent_from_env, BuildReport, ContextOutcome, GitRepositories, ImageBuilder,
    Orchestrator, PlatformConfig, ProcessRunner, DEFAULT_CONFIG_FILE,
};
use platform_pipeline::ScriptExecutor;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "platform")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-repository build and release orchestrator", long_about = None)]
struct Cli {
    /// Context to operate on
    #[arg(long)]
    context: String,

    /// Platform configuration file
    #[arg(long, env = "PLATFORM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and a JSON result on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update every repository and switch it to the context branch
    Checkout,

    /// Check out the context, then build every repository
    Build {
        /// Push the built images to the registry
        #[arg(long)]
        push_images: bool,
    },

    /// Hard-reset and clean every checkout
    ResetContext,

    /// Check out the context, then merge the branches of another context
    MergeContext {
        /// Context whose branches are merged in
        #[arg(long)]
        from_context: String,
    },

    /// Push the context branches to their remotes
    PushContext {
        /// Really push instead of a dry run
        #[arg(long)]
        force: bool,
    },

    /// Run pipelines, in order, against the current checkouts
    Execute {
        /// Comma separated pipeline ids
        #[arg(long, value_delimiter = ',', required = true)]
        pipelines: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let result: Result<()> = tokio::select! {
        result = run(cli) => result,
        signal = shutdown_signal() => Err(anyhow!("interrupted by {signal}")),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let platform = Arc::new(
        PlatformConfig::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?,
    );

    let runner = Arc::new(ProcessRunner::new(silent_from_env()));
    let provider = Arc::new(GitRepositories::new(&platform.repo_src, runner.clone()));
    let builder = Arc::new(ImageBuilder::new(runner.clone(), provider.clone()));
    let executor = Arc::new(ScriptExecutor::new(&platform, runner, provider.clone()));
    let orchestrator = Orchestrator::new(platform, provider, builder, executor);

    let context = cli.context.as_str();
    match cli.command {
        Commands::Checkout => {
            let outcomes = orchestrator.checkout(context).await?;
            report_outcomes("checkout", &outcomes, cli.json)
        }
        Commands::Build { push_images } => {
            orchestrator.checkout(context).await?;
            let report = orchestrator.build(push_images).await?;
            report_build(&report, cli.json)
        }
        Commands::ResetContext => {
            let outcomes = orchestrator.reset_context().await?;
            report_outcomes("reset", &outcomes, cli.json)
        }
        Commands::MergeContext { from_context } => {
            orchestrator.checkout(context).await?;
            let outcomes = orchestrator.merge_context(&from_context).await?;
            report_outcomes("merge", &outcomes, cli.json)
        }
        Commands::PushContext { force } => {
            let outcomes = orchestrator.push_context(context, force).await?;
            report_outcomes("push", &outcomes, cli.json)
        }
        Commands::Execute { pipelines } => {
            orchestrator.execute_pipelines(context, &pipelines).await?;
            Ok(())
        }
    }
}

fn report_outcomes(operation: &str, outcomes: &[ContextOutcome], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }
    for outcome in outcomes {
        match outcome {
            ContextOutcome::Applied { repository } => {
                info!(repository = %repository, "{operation} applied")
            }
            ContextOutcome::Skipped { repository, reason } => {
                info!(repository = %repository, reason = ?reason, "{operation} skipped")
            }
        }
    }
    Ok(())
}

fn report_build(report: &BuildReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for built in &report.repositories {
        info!(
            repository = %built.repository,
            images = built.images.len(),
            duration_ms = built.duration_ms,
            "built"
        );
    }
    for tag in &report.pushed {
        info!(tag = %tag, "pushed");
    }
    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pipelines_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "platform",
            "--context",
            "release",
            "execute",
            "--pipelines",
            "tag,deploy",
        ])
        .unwrap();
        match cli.command {
            Commands::Execute { pipelines } => assert_eq!(pipelines, vec!["tag", "deploy"]),
            _ => panic!("expected execute"),
        }
        assert_eq!(cli.context, "release");
    }

    #[test]
    fn test_context_is_required() {
        assert!(Cli::try_parse_from(["platform", "checkout"]).is_err());
    }

    #[test]
    fn test_build_flags() {
        let cli = Cli::try_parse_from([
            "platform",
            "--context",
            "master",
            "--config",
            "/etc/platform.json",
            "build",
            "--push-images",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Build { push_images: true }));
        assert_eq!(cli.config, PathBuf::from("/etc/platform.json"));
    }
}
