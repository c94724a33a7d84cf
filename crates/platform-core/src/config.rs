//! `platform.json` loading and validation.
//!
//! The file is deserialized into raw structs that mirror the JSON layout and
//! then mapped into the [`Platform`] model. Everything that can be checked
//! without touching a repository is checked here.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;
use crate::graph::DependencyGraph;
use crate::model::{Context, Platform, Repository};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "platform.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawPlatform {
    repo_src: String,
    #[serde(default)]
    registry: String,
    #[serde(default)]
    contexts: BTreeMap<String, RawContext>,
    repositories: OrderedMap<RawRepository>,
    #[serde(default)]
    pipelines: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawContext {
    #[serde(default)]
    base_context: Option<String>,
    #[serde(default)]
    branches: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawRepository {
    git_src: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    images: Vec<String>,
}

/// A JSON object whose entry order is kept.
#[derive(Debug)]
struct OrderedMap<V>(Vec<(String, V)>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries: Vec<(String, V)> =
                    Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if entries.iter().any(|(existing, _)| *existing == key) {
                        return Err(de::Error::custom(format!("duplicate key `{key}`")));
                    }
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

/// Loader for the platform configuration file.
pub struct PlatformConfig;

impl PlatformConfig {
    /// Read, validate and map `path`. Relative `repoSrc` and pipeline paths
    /// are resolved against the directory holding the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Platform, ConfigError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        let platform = Self::parse(&body, base_dir).map_err(|err| match err {
            LoadError::Json(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            LoadError::Config(err) => err,
        })?;
        debug!(
            config = %path.display(),
            repositories = platform.repositories.len(),
            contexts = platform.contexts.len(),
            "loaded platform config"
        );
        Ok(platform)
    }

    /// Parse a config document. Relative paths are resolved against
    /// `base_dir`.
    pub fn from_json(body: &str, base_dir: impl AsRef<Path>) -> Result<Platform, ConfigError> {
        Self::parse(body, base_dir.as_ref()).map_err(|err| match err {
            LoadError::Json(source) => ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            },
            LoadError::Config(err) => err,
        })
    }

    fn parse(body: &str, base_dir: &Path) -> Result<Platform, LoadError> {
        let raw: RawPlatform = serde_json::from_str(body).map_err(LoadError::Json)?;
        map_platform(raw, base_dir).map_err(LoadError::Config)
    }
}

enum LoadError {
    Json(serde_json::Error),
    Config(ConfigError),
}

fn map_platform(raw: RawPlatform, base_dir: &Path) -> Result<Platform, ConfigError> {
    if raw.repo_src.trim().is_empty() {
        return Err(ConfigError::EmptyRepoSrc);
    }

    let repositories: Vec<Repository> = raw
        .repositories
        .0
        .into_iter()
        .map(|(id, repo)| {
            Repository::new(id, repo.git_src)
                .depends_on(repo.depends_on)
                .with_images(repo.images)
        })
        .collect();
    DependencyGraph::new(&repositories).validate()?;

    for (context_id, context) in &raw.contexts {
        if let Some(repository) = context
            .branches
            .keys()
            .find(|id| !repositories.iter().any(|r| &r.id == *id))
        {
            return Err(ConfigError::UnknownRepository {
                context: context_id.clone(),
                repository: repository.clone(),
            });
        }
    }

    let mut contexts = BTreeMap::new();
    for (context_id, context) in &raw.contexts {
        let mut branches = context.branches.clone();
        if let Some(base) = &context.base_context {
            let base_context =
                raw.contexts
                    .get(base)
                    .ok_or_else(|| ConfigError::UnknownBaseContext {
                        context: context_id.clone(),
                        base: base.clone(),
                    })?;
            for (repository, branch) in &base_context.branches {
                branches
                    .entry(repository.clone())
                    .or_insert_with(|| branch.clone());
            }
        }
        contexts.insert(
            context_id.clone(),
            Context {
                id: context_id.clone(),
                base_context: context.base_context.clone(),
                branches,
            },
        );
    }

    let pipelines = raw
        .pipelines
        .into_iter()
        .map(|(id, template)| (id, resolve(base_dir, &template)))
        .collect();

    Ok(Platform {
        repo_src: resolve(base_dir, Path::new(&raw.repo_src)),
        registry: raw.registry,
        contexts,
        repositories,
        pipelines,
    })
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "repoSrc": "repos",
        "registry": "registry.example.com",
        "contexts": {
            "master": {"branches": {"svc-b": "master", "svc-a": "master", "lib": "master"}},
            "release": {"baseContext": "master", "branches": {"svc-a": "release/1.2"}}
        },
        "repositories": {
            "svc-b": {"gitSrc": "git@example.com:svc-b.git", "dependsOn": ["lib"], "images": ["svc-b"]},
            "lib": {"gitSrc": "git@example.com:lib.git"},
            "svc-a": {"gitSrc": "git@example.com:svc-a.git", "dependsOn": ["lib"]}
        },
        "pipelines": {"deploy": "pipelines/deploy.sh"}
    }"#;

    #[test]
    fn test_repository_declaration_order_preserved() {
        let platform = PlatformConfig::from_json(CONFIG, "/etc/platform").unwrap();
        let ids: Vec<&str> = platform.repositories.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["svc-b", "lib", "svc-a"]);
        assert_eq!(platform.repositories[0].depends_on, vec!["lib"]);
        assert_eq!(platform.repositories[0].images, vec!["svc-b"]);
    }

    #[test]
    fn test_base_context_branches_inherited() {
        let platform = PlatformConfig::from_json(CONFIG, "/etc/platform").unwrap();
        let release = platform.context("release").unwrap();
        assert_eq!(release.branch("svc-a"), Some("release/1.2"));
        assert_eq!(release.branch("svc-b"), Some("master"));
        assert_eq!(release.branch("lib"), Some("master"));
        assert_eq!(release.base_context.as_deref(), Some("master"));
        assert_eq!(
            platform.base_context(release).map(|c| c.id.as_str()),
            Some("master")
        );
    }

    #[test]
    fn test_relative_paths_resolved_against_config_dir() {
        let platform = PlatformConfig::from_json(CONFIG, "/etc/platform").unwrap();
        assert_eq!(platform.repo_src, PathBuf::from("/etc/platform/repos"));
        assert_eq!(
            platform.pipeline("deploy").unwrap(),
            &PathBuf::from("/etc/platform/pipelines/deploy.sh")
        );
    }

    #[test]
    fn test_absolute_repo_src_kept() {
        let body = r#"{"repoSrc": "/srv/repos", "repositories": {}}"#;
        let platform = PlatformConfig::from_json(body, "/etc/platform").unwrap();
        assert_eq!(platform.repo_src, PathBuf::from("/srv/repos"));
        assert!(platform.pipelines.is_empty());
    }

    #[test]
    fn test_unknown_repository_in_context_rejected() {
        let body = r#"{
            "repoSrc": "repos",
            "contexts": {"master": {"branches": {"ghost": "master"}}},
            "repositories": {"a": {"gitSrc": "a.git"}}
        }"#;
        let err = PlatformConfig::from_json(body, "/").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownRepository { ref repository, .. } if repository == "ghost"
        ));
    }

    #[test]
    fn test_unknown_base_context_rejected() {
        let body = r#"{
            "repoSrc": "repos",
            "contexts": {"release": {"baseContext": "nope", "branches": {}}},
            "repositories": {}
        }"#;
        let err = PlatformConfig::from_json(body, "/").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBaseContext { ref base, .. } if base == "nope"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let body = r#"{
            "repoSrc": "repos",
            "repositories": {"a": {"gitSrc": "a.git", "dependsOn": ["b"]}}
        }"#;
        let err = PlatformConfig::from_json(body, "/").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let body = r#"{
            "repoSrc": "repos",
            "repositories": {
                "a": {"gitSrc": "a.git", "dependsOn": ["b"]},
                "b": {"gitSrc": "b.git", "dependsOn": ["a"]}
            }
        }"#;
        let err = PlatformConfig::from_json(body, "/").unwrap_err();
        assert!(matches!(err, ConfigError::DependencyCycle { .. }));
    }

    #[test]
    fn test_empty_repo_src_rejected() {
        let body = r#"{"repoSrc": "  ", "repositories": {}}"#;
        assert!(matches!(
            PlatformConfig::from_json(body, "/"),
            Err(ConfigError::EmptyRepoSrc)
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let body = r#"{"repoSrc": "repos", "repositories": {}, "registy": "typo"}"#;
        assert!(matches!(
            PlatformConfig::from_json(body, "/"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_duplicate_repository_rejected() {
        let body = r#"{
            "repoSrc": "repos",
            "repositories": {"a": {"gitSrc": "a.git"}, "a": {"gitSrc": "other.git"}}
        }"#;
        assert!(matches!(
            PlatformConfig::from_json(body, "/"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.json");
        std::fs::write(&path, CONFIG).unwrap();
        let platform = PlatformConfig::load(&path).unwrap();
        assert_eq!(platform.registry, "registry.example.com");
        assert_eq!(platform.repo_src, dir.path().join("repos"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PlatformConfig::load("/nonexistent/platform.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
