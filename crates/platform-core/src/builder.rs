//! Dependency-ordered source and image builds.
//!
//! For every repository the opaque `sources` command from its
//! `platform-build.json` runs first, then one `docker build` per declared
//! image. Images are tagged with the closure hash and, when the closure is
//! on a single branch, with that branch.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::{Command, CommandRunner};
use crate::error::{BuildError, Result};
use crate::git::RepositoryProvider;
use crate::graph::DependencyGraph;
use crate::model::{BuildConfig, ImageSpec, RepositoryInfo, RepositoryInfos};

/// Build configuration file inside every repository checkout.
pub const BUILD_CONFIG_FILE: &str = "platform-build.json";

#[derive(Debug, Deserialize)]
struct BuildConfigFile {
    build: BuildConfig,
}

/// `platform-build.json` files already read during one orchestration run,
/// keyed by file path.
#[derive(Debug, Default)]
pub struct BuildConfigCache {
    configs: Mutex<HashMap<PathBuf, Arc<BuildConfig>>>,
}

impl BuildConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the build config of the checkout at `checkout_dir`.
    pub async fn load(
        &self,
        checkout_dir: &Path,
    ) -> std::result::Result<Arc<BuildConfig>, BuildError> {
        let path = checkout_dir.join(BUILD_CONFIG_FILE);
        let cached = self.lock().get(&path).cloned();
        if let Some(config) = cached {
            return Ok(config);
        }

        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| BuildError::ReadConfig {
                path: path.clone(),
                source,
            })?;
        let file: BuildConfigFile =
            serde_json::from_str(&body).map_err(|source| BuildError::ParseConfig {
                path: path.clone(),
                source,
            })?;
        let config = Arc::clone(
            self.lock()
                .entry(path)
                .or_insert_with(|| Arc::new(file.build)),
        );
        Ok(config)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<BuildConfig>>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One repository built during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuiltRepository {
    pub repository: String,
    /// Every image tag produced.
    pub images: Vec<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Outcome of [`RepositoryBuilder::build`], optionally followed by a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// In build order.
    pub repositories: Vec<BuiltRepository>,
    pub pushed: Vec<String>,
}

/// Builds and publishes repository artifacts.
#[async_trait]
pub trait RepositoryBuilder: Send + Sync {
    /// Build every repository once, dependencies first. Stops at the first
    /// failure.
    async fn build(
        &self,
        registry: &str,
        infos: &RepositoryInfos,
        cache: &BuildConfigCache,
    ) -> Result<BuildReport>;

    /// Push the tags of every image not marked `skipPush`. Returns the
    /// pushed tags.
    async fn push(
        &self,
        registry: &str,
        infos: &RepositoryInfos,
        cache: &BuildConfigCache,
    ) -> Result<Vec<String>>;
}

/// [`RepositoryBuilder`] that runs the sources command and `docker`.
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    provider: Arc<dyn RepositoryProvider>,
}

impl ImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, provider: Arc<dyn RepositoryProvider>) -> Self {
        Self { runner, provider }
    }

    async fn build_sources(&self, info: &RepositoryInfo, config: &BuildConfig) -> Result<()> {
        let id = info.id();
        info!(repository = %id, "building sources");
        let start = Instant::now();

        let command = Command::new(config.sources.executable.as_str())
            .args(config.sources.args.iter().map(String::as_str))
            .current_dir(self.provider.repository_path(id));
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|source| BuildError::Sources {
                repository: id.to_string(),
                source,
            })?;
        debug!(repository = %id, output = %output.combined(), "sources output");
        info!(
            repository = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sources built"
        );
        Ok(())
    }

    async fn build_images(
        &self,
        registry: &str,
        info: &RepositoryInfo,
        infos: &RepositoryInfos,
        config: &BuildConfig,
    ) -> Result<Vec<String>> {
        let id = info.id();
        info!(repository = %id, images = config.images.len(), "building images");
        let start = Instant::now();

        let build_args = build_args(registry, info, infos)?;
        let mut built = Vec::new();
        for image in &config.images {
            let tags = image_tags(registry, image, info, infos)?;
            let mut args = vec![
                "build".to_string(),
                image.context.clone(),
                format!("--file={}", image.docker_file),
            ];
            args.extend(tags.iter().map(|tag| format!("--tag={tag}")));
            args.extend(
                build_args
                    .iter()
                    .map(|(key, value)| format!("--build-arg={key}={value}")),
            );

            let command = Command::new("docker")
                .args(args)
                .current_dir(self.provider.repository_path(id));
            let output = self
                .runner
                .run(&command)
                .await
                .map_err(|source| BuildError::Image {
                    repository: id.to_string(),
                    image: image.name.clone(),
                    source,
                })?;
            debug!(
                repository = %id,
                image = %image.name,
                output = %output.combined(),
                "docker build output"
            );
            built.extend(tags);
        }

        info!(
            repository = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "images built"
        );
        Ok(built)
    }
}

#[async_trait]
impl RepositoryBuilder for ImageBuilder {
    async fn build(
        &self,
        registry: &str,
        infos: &RepositoryInfos,
        cache: &BuildConfigCache,
    ) -> Result<BuildReport> {
        let order = DependencyGraph::new(infos.repositories()).build_order()?;
        let mut report = BuildReport::default();

        for repository in order {
            let info = infos
                .get(&repository.id)
                .ok_or_else(|| BuildError::UnknownRepository {
                    repository: repository.id.clone(),
                })?;
            let start = Instant::now();
            let config = cache
                .load(&self.provider.repository_path(info.id()))
                .await?;

            self.build_sources(info, &config).await?;
            let images = self.build_images(registry, info, infos, &config).await?;

            report.repositories.push(BuiltRepository {
                repository: info.id().to_string(),
                images,
                duration_ms: start.elapsed().as_millis() as u64,
                finished_at: Utc::now(),
            });
        }
        Ok(report)
    }

    async fn push(
        &self,
        registry: &str,
        infos: &RepositoryInfos,
        cache: &BuildConfigCache,
    ) -> Result<Vec<String>> {
        let mut pushed = Vec::new();
        for info in infos {
            let id = info.id();
            let checkout = self.provider.repository_path(id);
            let config = cache.load(&checkout).await?;
            for image in &config.images {
                if image.skip_push {
                    info!(
                        repository = %id,
                        image = %format!("{registry}/{}", image.name),
                        "skip push"
                    );
                    continue;
                }
                for tag in image_tags(registry, image, info, infos)? {
                    info!(repository = %id, tag = %tag, "pushing image");
                    let command = Command::new("docker")
                        .args(["push", tag.as_str()])
                        .current_dir(&checkout);
                    let output = self
                        .runner
                        .run(&command)
                        .await
                        .map_err(|source| BuildError::Push {
                            repository: id.to_string(),
                            tag: tag.clone(),
                            source,
                        })?;
                    debug!(repository = %id, output = %output.combined(), "docker push output");
                    pushed.push(tag);
                }
            }
        }
        Ok(pushed)
    }
}

/// Build argument name for a repository: uppercased, `-` replaced by `_`.
pub fn build_arg_name(id: &str) -> String {
    id.replace('-', "_").to_uppercase()
}

/// `REGISTRY` plus the hex hash of the repository and each direct
/// dependency, in sorted key order.
pub fn build_args(
    registry: &str,
    info: &RepositoryInfo,
    infos: &RepositoryInfos,
) -> std::result::Result<BTreeMap<String, String>, BuildError> {
    let mut args = BTreeMap::new();
    args.insert("REGISTRY".to_string(), registry.to_string());
    for dependency in &info.repository.depends_on {
        let dependency_info = infos
            .get(dependency)
            .ok_or_else(|| BuildError::UnknownRepository {
                repository: dependency.clone(),
            })?;
        args.insert(build_arg_name(dependency), dependency_info.hex_hash());
    }
    args.insert(build_arg_name(info.id()), info.hex_hash());
    Ok(args)
}

/// `<registry>/<image>:<hash>` and, for a consistent closure branch,
/// `<registry>/<image>:<branch>` (see [`branch_tag`]). `tagBy` swaps in
/// another repository's hash and branch.
pub fn image_tags(
    registry: &str,
    image: &ImageSpec,
    info: &RepositoryInfo,
    infos: &RepositoryInfos,
) -> std::result::Result<Vec<String>, BuildError> {
    let source = match &image.tag_by {
        Some(tag_by) => infos
            .get(tag_by)
            .ok_or_else(|| BuildError::UnknownTagBy {
                repository: info.id().to_string(),
                image: image.name.clone(),
                tag_by: tag_by.clone(),
            })?,
        None => info,
    };

    let mut tags = vec![format!("{registry}/{}:{}", image.name, source.hex_hash())];
    if let Some(branch) = &source.branch {
        tags.push(format!("{registry}/{}:{}", image.name, branch_tag(branch)));
    }
    Ok(tags)
}

/// Docker tag for a branch name. Tags allow `[A-Za-z0-9_.-]`, may not start
/// with `.` or `-` and are at most 128 characters, so `release/1.2` becomes
/// `release-1.2`.
pub fn branch_tag(branch: &str) -> String {
    branch
        .chars()
        .enumerate()
        .map(|(i, c)| match c {
            '.' | '-' if i == 0 => '_',
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') => c,
            _ => '-',
        })
        .take(MAX_TAG_LEN)
        .collect()
}

const MAX_TAG_LEN: usize = 128;
