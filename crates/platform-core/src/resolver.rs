//! Dependency-closure content hashes and branch consistency.
//!
//! The hash of a repository is SHA-256 over its trimmed HEAD commit id
//! followed by the hash of every direct dependency in `depends_on` order.
//! The closure branch is the repository's branch when every repository in
//! its closure is on that same branch, and `None` otherwise.
//!
//! Results are memoized for the lifetime of one [`ClosureResolver`], so a
//! diamond-shaped graph queries each checkout once.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ConfigError, PlatformError, Result};
use crate::git::RepositoryProvider;
use crate::graph::DependencyGraph;
use crate::model::{Repository, RepositoryInfo, RepositoryInfos};

#[derive(Debug, Clone)]
struct Resolved {
    hash: Vec<u8>,
    branch: Option<String>,
}

/// Computes [`RepositoryInfo`] for a set of repositories against the current
/// state of their checkouts.
pub struct ClosureResolver<'a> {
    provider: &'a dyn RepositoryProvider,
    repositories: &'a [Repository],
    graph: DependencyGraph<'a>,
    resolved: HashMap<&'a str, Resolved>,
}

impl<'a> ClosureResolver<'a> {
    pub fn new(provider: &'a dyn RepositoryProvider, repositories: &'a [Repository]) -> Self {
        Self {
            provider,
            repositories,
            graph: DependencyGraph::new(repositories),
            resolved: HashMap::new(),
        }
    }

    /// Resolve every repository. The result is in declaration order.
    pub async fn resolve_all(&mut self) -> Result<RepositoryInfos> {
        for repository in self.graph.build_order()? {
            self.resolve_one(repository).await?;
        }

        let mut infos = RepositoryInfos::new();
        for repository in self.repositories {
            if let Some(resolved) = self.resolved.get(repository.id.as_str()) {
                infos.insert(RepositoryInfo {
                    repository: repository.clone(),
                    hash: resolved.hash.clone(),
                    branch: resolved.branch.clone(),
                });
            }
        }
        Ok(infos)
    }

    /// Content hash of `id` and its dependency closure.
    pub async fn compute_hash(&mut self, id: &str) -> Result<Vec<u8>> {
        Ok(self.resolve_closure(id).await?.hash)
    }

    /// Branch shared by the whole closure of `id`, if any.
    pub async fn compute_branch(&mut self, id: &str) -> Result<Option<String>> {
        Ok(self.resolve_closure(id).await?.branch)
    }

    async fn resolve_closure(&mut self, id: &str) -> Result<Resolved> {
        for repository in self.graph.closure_order(id)? {
            self.resolve_one(repository).await?;
        }
        self.resolved
            .get(id)
            .cloned()
            .ok_or_else(|| unknown_dependency(id, id))
    }

    /// Dependencies of `repository` must already be resolved.
    async fn resolve_one(&mut self, repository: &'a Repository) -> Result<Resolved> {
        if let Some(resolved) = self.resolved.get(repository.id.as_str()) {
            return Ok(resolved.clone());
        }

        let commit = self.provider.head_commit(&repository.id).await?;
        let own_branch = self.provider.branch_name(&repository.id).await?;

        let mut hasher = Sha256::new();
        hasher.update(commit.trim().as_bytes());
        let mut branch = Some(own_branch);
        for dependency in &repository.depends_on {
            let resolved = self
                .resolved
                .get(dependency.as_str())
                .ok_or_else(|| unknown_dependency(&repository.id, dependency))?;
            hasher.update(&resolved.hash);
            if resolved.branch != branch {
                branch = None;
            }
        }

        let resolved = Resolved {
            hash: hasher.finalize().to_vec(),
            branch,
        };
        debug!(
            repository = %repository.id,
            commit = %commit.trim(),
            hash = %hex::encode(&resolved.hash),
            branch = ?resolved.branch,
            "resolved dependency closure"
        );
        self.resolved
            .insert(repository.id.as_str(), resolved.clone());
        Ok(resolved)
    }
}

fn unknown_dependency(repository: &str, dependency: &str) -> PlatformError {
    ConfigError::UnknownDependency {
        repository: repository.to_string(),
        dependency: dependency.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryRepositories;

    fn repo(id: &str, deps: &[&str]) -> Repository {
        Repository::new(id, format!("git@example.com:{id}.git")).depends_on(deps.iter().copied())
    }

    fn fixture() -> (Vec<Repository>, MemoryRepositories) {
        let repos = vec![repo("svc-b", &["svc-a"]), repo("svc-a", &[])];
        let git = MemoryRepositories::new("/repos")
            .with_repository("svc-a", "main", "1111")
            .with_repository("svc-b", "main", "2222");
        (repos, git)
    }

    fn expected_hash(commit: &str, deps: &[&[u8]]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(commit.as_bytes());
        for dep in deps {
            hasher.update(dep);
        }
        hasher.finalize().to_vec()
    }

    #[tokio::test]
    async fn test_hash_covers_commit_and_dependencies() {
        let (repos, git) = fixture();
        let mut resolver = ClosureResolver::new(&git, &repos);
        let a = resolver.compute_hash("svc-a").await.unwrap();
        let b = resolver.compute_hash("svc-b").await.unwrap();
        assert_eq!(a, expected_hash("1111", &[]));
        assert_eq!(b, expected_hash("2222", &[&a]));
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let (repos, git) = fixture();
        let first = ClosureResolver::new(&git, &repos)
            .compute_hash("svc-b")
            .await
            .unwrap();
        let second = ClosureResolver::new(&git, &repos)
            .compute_hash("svc-b")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_dependent_hash_changes_with_dependency_commit() {
        let (repos, git) = fixture();
        let before = ClosureResolver::new(&git, &repos)
            .compute_hash("svc-b")
            .await
            .unwrap();
        git.set_commit("svc-a", "3333");
        let after = ClosureResolver::new(&git, &repos)
            .compute_hash("svc-b")
            .await
            .unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_dependency_order_is_part_of_the_hash() {
        let git = MemoryRepositories::new("/repos")
            .with_repository("x", "main", "1")
            .with_repository("y", "main", "2")
            .with_repository("app", "main", "3");
        let forward = vec![repo("x", &[]), repo("y", &[]), repo("app", &["x", "y"])];
        let reversed = vec![repo("x", &[]), repo("y", &[]), repo("app", &["y", "x"])];
        let a = ClosureResolver::new(&git, &forward)
            .compute_hash("app")
            .await
            .unwrap();
        let b = ClosureResolver::new(&git, &reversed)
            .compute_hash("app")
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_branch_shared_by_closure() {
        let (repos, git) = fixture();
        let mut resolver = ClosureResolver::new(&git, &repos);
        assert_eq!(
            resolver.compute_branch("svc-b").await.unwrap().as_deref(),
            Some("main")
        );
    }

    #[tokio::test]
    async fn test_branch_divergent_when_dependency_differs() {
        let (repos, git) = fixture();
        git.set_branch("svc-a", "feature-x");
        let mut resolver = ClosureResolver::new(&git, &repos);
        assert_eq!(resolver.compute_branch("svc-b").await.unwrap(), None);
        assert_eq!(
            resolver.compute_branch("svc-a").await.unwrap().as_deref(),
            Some("feature-x")
        );
    }

    #[tokio::test]
    async fn test_branch_divergent_deep_in_closure() {
        let git = MemoryRepositories::new("/repos")
            .with_repository("base", "develop", "1")
            .with_repository("mid", "main", "2")
            .with_repository("top", "main", "3");
        let repos = vec![repo("base", &[]), repo("mid", &["base"]), repo("top", &["mid"])];
        let mut resolver = ClosureResolver::new(&git, &repos);
        assert_eq!(resolver.compute_branch("top").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolve_all_queries_each_checkout_once() {
        let git = MemoryRepositories::new("/repos")
            .with_repository("base", "main", "1")
            .with_repository("left", "main", "2")
            .with_repository("right", "main", "3")
            .with_repository("app", "main", "4");
        let repos = vec![
            repo("app", &["left", "right"]),
            repo("left", &["base"]),
            repo("right", &["base"]),
            repo("base", &[]),
        ];
        let infos = ClosureResolver::new(&git, &repos)
            .resolve_all()
            .await
            .unwrap();

        let ids: Vec<&str> = infos.iter().map(RepositoryInfo::id).collect();
        assert_eq!(ids, vec!["app", "left", "right", "base"]);
        assert_eq!(infos.get("app").unwrap().branch.as_deref(), Some("main"));

        let head_calls = git
            .calls()
            .iter()
            .filter(|call| call.starts_with("head_commit"))
            .count();
        assert_eq!(head_calls, 4);
    }

    #[tokio::test]
    async fn test_git_failure_aborts_resolution() {
        let (repos, git) = fixture();
        git.fail_on("svc-a", crate::error::GitOperation::Hash);
        let err = ClosureResolver::new(&git, &repos)
            .resolve_all()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("svc-a"));
    }
}
