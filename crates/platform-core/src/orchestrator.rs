//! Platform orchestrator: composes the context manager, the closure
//! resolver, the builder and the pipeline executor into the six platform
//! operations.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::builder::{BuildConfigCache, BuildReport, RepositoryBuilder};
use crate::context::{ContextManager, ContextOutcome};
use crate::error::Result;
use crate::git::RepositoryProvider;
use crate::model::{Platform, RepositoryInfos};
use crate::resolver::ClosureResolver;

/// Renders and runs one named pipeline against resolved repository infos.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn execute(&self, context_id: &str, pipeline: &str, infos: &RepositoryInfos)
        -> Result<()>;
}

/// Entry point for every platform operation.
///
/// Repository infos are recomputed on every call and never cached.
pub struct Orchestrator {
    platform: Arc<Platform>,
    provider: Arc<dyn RepositoryProvider>,
    contexts: ContextManager,
    builder: Arc<dyn RepositoryBuilder>,
    pipelines: Arc<dyn PipelineExecutor>,
}

impl Orchestrator {
    pub fn new(
        platform: Arc<Platform>,
        provider: Arc<dyn RepositoryProvider>,
        builder: Arc<dyn RepositoryBuilder>,
        pipelines: Arc<dyn PipelineExecutor>,
    ) -> Self {
        let contexts = ContextManager::new(Arc::clone(&platform), Arc::clone(&provider));
        Self {
            platform,
            provider,
            contexts,
            builder,
            pipelines,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    #[instrument(name = "checkout", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn checkout(&self, context_id: &str) -> Result<Vec<ContextOutcome>> {
        self.contexts.checkout(context_id).await
    }

    /// Resolve infos, build every repository and optionally push the images.
    #[instrument(name = "build", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn build(&self, push_images: bool) -> Result<BuildReport> {
        let infos = self.repository_infos().await?;
        let cache = BuildConfigCache::new();
        let registry = self.platform.registry.as_str();

        let mut report = self.builder.build(registry, &infos, &cache).await?;
        if push_images {
            report.pushed = self.builder.push(registry, &infos, &cache).await?;
        }
        info!(
            repositories = report.repositories.len(),
            pushed = report.pushed.len(),
            "build finished"
        );
        Ok(report)
    }

    #[instrument(name = "reset_context", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn reset_context(&self) -> Result<Vec<ContextOutcome>> {
        self.contexts.reset_context().await
    }

    #[instrument(name = "merge_context", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn merge_context(&self, from_context_id: &str) -> Result<Vec<ContextOutcome>> {
        self.contexts.merge_context(from_context_id).await
    }

    #[instrument(name = "push_context", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn push_context(&self, context_id: &str, force: bool) -> Result<Vec<ContextOutcome>> {
        self.contexts.push_context(context_id, force).await
    }

    /// Run `pipelines` in order against the current checkouts. Unknown
    /// pipeline ids are rejected before anything runs.
    #[instrument(name = "execute_pipelines", skip(self), fields(run_id = %Uuid::new_v4()))]
    pub async fn execute_pipelines(&self, context_id: &str, pipelines: &[String]) -> Result<()> {
        self.platform.context(context_id)?;
        for pipeline in pipelines {
            self.platform.pipeline(pipeline)?;
        }

        let infos = self.repository_infos().await?;
        for pipeline in pipelines {
            info!(pipeline = %pipeline, "executing pipeline");
            let start = Instant::now();
            self.pipelines.execute(context_id, pipeline, &infos).await?;
            info!(
                pipeline = %pipeline,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "pipeline finished"
            );
        }
        Ok(())
    }

    /// Hash and branch of every repository against the current checkouts.
    pub async fn repository_infos(&self) -> Result<RepositoryInfos> {
        ClosureResolver::new(self.provider.as_ref(), &self.platform.repositories)
            .resolve_all()
            .await
    }
}
