//! Renders a pipeline template into a shell script and runs it with `bash`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use platform_core::{
    Command, CommandRunner, PipelineExecutor, PipelineId, Platform, PlatformError,
    RepositoryInfos, RepositoryProvider, Result, TemplateError,
};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::template::{Template, Value};

/// Directory for rendered scripts, relative to the working directory.
pub const DEFAULT_SCRATCH_DIR: &str = ".platform";

/// [`PipelineExecutor`] for `bash` script templates.
pub struct ScriptExecutor {
    registry: String,
    pipelines: BTreeMap<PipelineId, PathBuf>,
    scratch_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    provider: Arc<dyn RepositoryProvider>,
}

impl ScriptExecutor {
    pub fn new(
        platform: &Platform,
        runner: Arc<dyn CommandRunner>,
        provider: Arc<dyn RepositoryProvider>,
    ) -> Self {
        Self {
            registry: platform.registry.clone(),
            pipelines: platform.pipelines.clone(),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            runner,
            provider,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Template variables for one pipeline run.
    pub fn variables(&self, context_id: &str, pipeline: &str, infos: &RepositoryInfos) -> Value {
        let mut repositories = Value::object();
        for info in infos {
            let directory = self.provider.repository_path(info.id());
            let images = info
                .repository
                .images
                .iter()
                .map(|image| Value::text(image.as_str()))
                .collect();
            repositories = repositories.with(
                info.id(),
                Value::object()
                    .with("hash", Value::text(info.hex_hash()))
                    .with("branch", Value::text(info.branch.clone().unwrap_or_default()))
                    .with("directory", Value::text(directory.to_string_lossy()))
                    .with("images", Value::List(images)),
            );
        }

        Value::object()
            .with("context_id", Value::text(context_id))
            .with("pipeline", Value::text(pipeline))
            .with("registry", Value::text(self.registry.as_str()))
            .with("repositories", repositories)
    }

    /// Render the template of `pipeline` without running it.
    pub async fn render(
        &self,
        context_id: &str,
        pipeline: &str,
        infos: &RepositoryInfos,
    ) -> std::result::Result<String, TemplateError> {
        let path = self.pipelines.get(pipeline).ok_or(TemplateError::NotFound)?;
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TemplateError::Read {
                path: path.clone(),
                source,
            })?;
        Template::parse(&source)?.render(&self.variables(context_id, pipeline, infos))
    }

    async fn write_script(
        &self,
        pipeline: &str,
        script: &str,
    ) -> std::result::Result<NamedTempFile, TemplateError> {
        let scratch = |source| TemplateError::ScratchFile { source };
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(scratch)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{pipeline}-"))
            .suffix(".sh")
            .tempfile_in(&self.scratch_dir)
            .map_err(scratch)?;
        file.write_all(script.as_bytes()).map_err(scratch)?;
        file.flush().map_err(scratch)?;
        Ok(file)
    }
}

#[async_trait]
impl PipelineExecutor for ScriptExecutor {
    async fn execute(
        &self,
        context_id: &str,
        pipeline: &str,
        infos: &RepositoryInfos,
    ) -> Result<()> {
        let template_error = |source| PlatformError::Template {
            pipeline: pipeline.to_string(),
            source,
        };
        let script = self
            .render(context_id, pipeline, infos)
            .await
            .map_err(template_error)?;
        let file = self
            .write_script(pipeline, &script)
            .await
            .map_err(template_error)?;
        debug!(pipeline = %pipeline, script = %file.path().display(), "running pipeline script");

        let command = Command::new("bash")
            .arg(file.path().to_string_lossy())
            .streamed();
        let result = self.runner.run(&command).await;

        let path = file.path().to_path_buf();
        if let Err(err) = file.close() {
            warn!(script = %path.display(), error = %err, "failed to remove pipeline script");
        }

        result.map(|_| ()).map_err(|source| PlatformError::Pipeline {
            pipeline: pipeline.to_string(),
            source,
        })
    }
}
