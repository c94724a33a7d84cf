//! Git-level operations on the repository checkouts under `repo_src`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::command::{Command, CommandOutput, CommandRunner};
use crate::error::{CommandError, GitError, GitOperation};
use crate::model::Repository;

/// Per-repository git state and mutations.
///
/// Every working tree is authoritative: nothing is cached between calls.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Local checkout directory of a repository.
    fn repository_path(&self, id: &str) -> PathBuf;

    async fn exists(&self, repository: &Repository) -> Result<bool, GitError>;

    async fn clone_repository(&self, repository: &Repository) -> Result<(), GitError>;

    async fn fetch(&self, id: &str) -> Result<(), GitError>;

    /// Switch to `branch`, reusing the local branch when it exists and
    /// creating it from `origin/<branch>` otherwise.
    async fn checkout(&self, id: &str, branch: &str) -> Result<(), GitError>;

    /// Trimmed `git rev-parse HEAD`.
    async fn head_commit(&self, id: &str) -> Result<String, GitError>;

    /// Trimmed `git rev-parse --abbrev-ref HEAD`.
    async fn branch_name(&self, id: &str) -> Result<String, GitError>;

    /// `git reset --hard` followed by `git clean -dxf`.
    async fn reset(&self, id: &str) -> Result<(), GitError>;

    /// `git merge origin/<branch>` into the current branch.
    async fn merge(&self, id: &str, branch: &str) -> Result<(), GitError>;

    /// `git push`, optionally with `--dry-run`. Returns the command output.
    async fn push(&self, id: &str, dry_run: bool) -> Result<String, GitError>;
}

/// [`RepositoryProvider`] that drives the `git` binary.
pub struct GitRepositories {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl GitRepositories {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git<I, S>(
        &self,
        id: &str,
        operation: GitOperation,
        args: I,
    ) -> Result<CommandOutput, GitError>
    where
        I: IntoIterator<Item = S> + Send,
        S: Into<String>,
    {
        let command = Command::new("git")
            .args(args)
            .current_dir(self.repository_path(id));
        self.runner
            .run(&command)
            .await
            .map_err(|source| git_error(id, operation, source))
    }

    async fn has_local_branch(&self, id: &str, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{branch}");
        match self
            .git(
                id,
                GitOperation::BranchLookup,
                ["rev-parse", "--verify", "--quiet", reference.as_str()],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Command {
                source: CommandError::Failed { .. },
                ..
            }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn git_error(id: &str, operation: GitOperation, source: CommandError) -> GitError {
    GitError::Command {
        repository: id.to_string(),
        operation,
        source,
    }
}

#[async_trait]
impl RepositoryProvider for GitRepositories {
    fn repository_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn exists(&self, repository: &Repository) -> Result<bool, GitError> {
        let path = self.repository_path(&repository.id);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(GitError::Inspect {
                repository: repository.id.clone(),
                path,
                source,
            }),
        }
    }

    async fn clone_repository(&self, repository: &Repository) -> Result<(), GitError> {
        let path = self.repository_path(&repository.id);
        let command = Command::new("git")
            .arg("clone")
            .arg(repository.git_src.as_str())
            .arg(path.to_string_lossy());
        self.runner
            .run(&command)
            .await
            .map_err(|source| git_error(&repository.id, GitOperation::Clone, source))?;
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<(), GitError> {
        self.git(id, GitOperation::Fetch, ["fetch"]).await?;
        Ok(())
    }

    async fn checkout(&self, id: &str, branch: &str) -> Result<(), GitError> {
        if branch.is_empty() {
            return Err(GitError::EmptyBranch {
                repository: id.to_string(),
            });
        }
        if self.has_local_branch(id, branch).await? {
            self.git(id, GitOperation::Checkout, ["checkout", branch])
                .await?;
        } else {
            let upstream = format!("origin/{branch}");
            self.git(
                id,
                GitOperation::Checkout,
                ["checkout", "-b", branch, upstream.as_str()],
            )
            .await?;
        }
        Ok(())
    }

    async fn head_commit(&self, id: &str) -> Result<String, GitError> {
        let output = self
            .git(id, GitOperation::Hash, ["rev-parse", "HEAD"])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn branch_name(&self, id: &str) -> Result<String, GitError> {
        let output = self
            .git(
                id,
                GitOperation::BranchName,
                ["rev-parse", "--abbrev-ref", "HEAD"],
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn reset(&self, id: &str) -> Result<(), GitError> {
        self.git(id, GitOperation::Reset, ["reset", "--hard"])
            .await?;
        self.git(id, GitOperation::Clean, ["clean", "-dxf"]).await?;
        Ok(())
    }

    async fn merge(&self, id: &str, branch: &str) -> Result<(), GitError> {
        let upstream = format!("origin/{branch}");
        self.git(id, GitOperation::Merge, ["merge", upstream.as_str()])
            .await?;
        Ok(())
    }

    async fn push(&self, id: &str, dry_run: bool) -> Result<String, GitError> {
        let mut args = vec!["push"];
        if dry_run {
            args.push("--dry-run");
        }
        let output = self.git(id, GitOperation::Push, args).await?;
        let output = output.combined();
        debug!(repository = %id, dry_run, %output, "git push finished");
        Ok(output)
    }
}
