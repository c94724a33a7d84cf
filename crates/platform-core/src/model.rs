//! Platform model: repositories, contexts, resolved repository info and
//! per-repository build configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub type RepositoryId = String;
pub type ContextId = String;
pub type PipelineId = String;

/// A git repository managed by the platform. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: RepositoryId,
    /// Clone URL.
    pub git_src: String,
    /// Direct dependencies, in declaration order. The order feeds the
    /// content hash.
    pub depends_on: Vec<RepositoryId>,
    /// Image names published by this repository.
    pub images: Vec<String>,
}

impl Repository {
    pub fn new(id: impl Into<RepositoryId>, git_src: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            git_src: git_src.into(),
            depends_on: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RepositoryId>,
    {
        self.depends_on = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = images.into_iter().map(Into::into).collect();
        self
    }
}

/// A named set of target branches.
///
/// Branches inherited from the base context are merged in at load time, so
/// `branches` is always the effective mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Context {
    pub id: ContextId,
    pub base_context: Option<ContextId>,
    pub branches: BTreeMap<RepositoryId, String>,
}

impl Context {
    pub fn branch(&self, repository: &str) -> Option<&str> {
        self.branches.get(repository).map(String::as_str)
    }
}

/// Aggregate root of a loaded `platform.json`.
#[derive(Debug, Clone, Default)]
pub struct Platform {
    /// Directory holding one checkout per repository.
    pub repo_src: PathBuf,
    /// Image registry host.
    pub registry: String,
    pub contexts: BTreeMap<ContextId, Context>,
    /// Declaration order is the processing order of every operation.
    pub repositories: Vec<Repository>,
    /// Pipeline id -> template file.
    pub pipelines: BTreeMap<PipelineId, PathBuf>,
}

impl Platform {
    pub fn context(&self, id: &str) -> Result<&Context, ConfigError> {
        self.contexts
            .get(id)
            .ok_or_else(|| ConfigError::ContextNotFound {
                context: id.to_string(),
            })
    }

    /// The base context of `context`, if it declares one.
    pub fn base_context(&self, context: &Context) -> Option<&Context> {
        context
            .base_context
            .as_deref()
            .and_then(|base| self.contexts.get(base))
    }

    pub fn repository(&self, id: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn pipeline(&self, id: &str) -> Result<&PathBuf, ConfigError> {
        self.pipelines
            .get(id)
            .ok_or_else(|| ConfigError::PipelineNotFound {
                pipeline: id.to_string(),
            })
    }
}

/// A repository together with its closure hash and closure branch,
/// computed fresh for every build or pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub repository: Repository,
    pub hash: Vec<u8>,
    /// `None` when the dependency closure is not on a single branch.
    pub branch: Option<String>,
}

impl RepositoryInfo {
    pub fn id(&self) -> &str {
        &self.repository.id
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(&self.hash)
    }
}

/// Resolved infos for one run, kept in repository declaration order.
#[derive(Debug, Clone, Default)]
pub struct RepositoryInfos {
    infos: Vec<RepositoryInfo>,
    index: HashMap<RepositoryId, usize>,
}

impl RepositoryInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `info`, replacing an earlier entry for the same repository in
    /// place.
    pub fn insert(&mut self, info: RepositoryInfo) {
        match self.index.get(info.id()) {
            Some(&position) => self.infos[position] = info,
            None => {
                self.index.insert(info.id().to_string(), self.infos.len());
                self.infos.push(info);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&RepositoryInfo> {
        self.index.get(id).map(|&position| &self.infos[position])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RepositoryInfo> {
        self.infos.iter()
    }

    pub fn repositories(&self) -> impl Iterator<Item = &Repository> {
        self.infos.iter().map(|info| &info.repository)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl<'a> IntoIterator for &'a RepositoryInfos {
    type Item = &'a RepositoryInfo;
    type IntoIter = std::slice::Iter<'a, RepositoryInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.infos.iter()
    }
}

impl FromIterator<RepositoryInfo> for RepositoryInfos {
    fn from_iter<T: IntoIterator<Item = RepositoryInfo>>(iter: T) -> Self {
        let mut infos = RepositoryInfos::new();
        for info in iter {
            infos.insert(info);
        }
        infos
    }
}

/// Contents of `platform-build.json` inside a repository checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub sources: SourcesCommand,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
}

/// The opaque command that compiles a repository's sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesCommand {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One container image built from a repository checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub name: String,
    /// Build context directory, relative to the checkout.
    pub context: String,
    pub docker_file: String,
    /// Repository whose hash and branch tag this image instead of the
    /// owning repository.
    #[serde(default)]
    pub tag_by: Option<RepositoryId>,
    #[serde(default)]
    pub skip_push: bool,
}
