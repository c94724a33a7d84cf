//! Maps a named context onto checkout, reset, merge and push across every
//! repository of the platform.
//!
//! Repositories are processed one at a time in declaration order and the
//! first hard error aborts the operation. Skips are reported as
//! [`ContextOutcome::Skipped`], never as errors.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::error::{ConfigError, PlatformError, Result};
use crate::git::RepositoryProvider;
use crate::model::{Context, Platform, Repository};

/// Why a repository was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The context has no branch entry for the repository.
    NoBranchInContext,
    /// The checkout is already on the requested branch.
    AlreadyOnBranch,
    /// The branch is the same as in the base context.
    SameAsBase,
}

/// Per-repository result of a context operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContextOutcome {
    Applied { repository: String },
    Skipped { repository: String, reason: SkipReason },
}

impl ContextOutcome {
    fn applied(repository: &Repository) -> Self {
        ContextOutcome::Applied {
            repository: repository.id.clone(),
        }
    }

    fn skipped(repository: &Repository, reason: SkipReason) -> Self {
        ContextOutcome::Skipped {
            repository: repository.id.clone(),
            reason,
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            ContextOutcome::Applied { repository } | ContextOutcome::Skipped { repository, .. } => {
                repository
            }
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ContextOutcome::Applied { .. } => None,
            ContextOutcome::Skipped { reason, .. } => Some(*reason),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ContextOutcome::Applied { .. })
    }
}

/// Context operations over all repositories of a [`Platform`].
pub struct ContextManager {
    platform: Arc<Platform>,
    provider: Arc<dyn RepositoryProvider>,
}

impl ContextManager {
    pub fn new(platform: Arc<Platform>, provider: Arc<dyn RepositoryProvider>) -> Self {
        Self { platform, provider }
    }

    /// Put every repository on its branch in `context_id`, cloning and
    /// fetching as needed, then reset all working trees.
    pub async fn checkout(&self, context_id: &str) -> Result<Vec<ContextOutcome>> {
        let context = self.platform.context(context_id)?;
        for repository in &self.platform.repositories {
            if context.branch(&repository.id).is_none() {
                return Err(ConfigError::MissingBranch {
                    context: context_id.to_string(),
                    repository: repository.id.clone(),
                }
                .into());
            }
        }

        let mut outcomes = Vec::with_capacity(self.platform.repositories.len());
        for repository in &self.platform.repositories {
            outcomes.push(self.checkout_repository(context, repository).await?);
        }
        self.reset_context().await?;
        Ok(outcomes)
    }

    async fn checkout_repository(
        &self,
        context: &Context,
        repository: &Repository,
    ) -> Result<ContextOutcome> {
        let branch = context.branch(&repository.id).unwrap_or_default();
        info!(repository = %repository.id, branch = %branch, "checkout");
        let start = Instant::now();

        if !self.provider.exists(repository).await? {
            info!(repository = %repository.id, src = %repository.git_src, "cloning");
            self.provider.clone_repository(repository).await?;
        }
        self.provider.fetch(&repository.id).await?;

        let current = self.provider.branch_name(&repository.id).await?;
        let outcome = if current == branch {
            ContextOutcome::skipped(repository, SkipReason::AlreadyOnBranch)
        } else {
            self.provider.checkout(&repository.id, branch).await?;
            ContextOutcome::applied(repository)
        };
        info!(
            repository = %repository.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "checkout done"
        );
        Ok(outcome)
    }

    /// Discard local changes and untracked files in every repository.
    pub async fn reset_context(&self) -> Result<Vec<ContextOutcome>> {
        let mut outcomes = Vec::with_capacity(self.platform.repositories.len());
        for repository in &self.platform.repositories {
            info!(repository = %repository.id, "reset");
            self.provider.reset(&repository.id).await?;
            outcomes.push(ContextOutcome::applied(repository));
        }
        Ok(outcomes)
    }

    /// Merge the branches of `from_context_id` into the current branches.
    /// A repository whose merge fails is reset before the error is returned.
    pub async fn merge_context(&self, from_context_id: &str) -> Result<Vec<ContextOutcome>> {
        let from = self.platform.context(from_context_id)?;
        let mut outcomes = Vec::with_capacity(self.platform.repositories.len());

        for repository in &self.platform.repositories {
            let current = self.provider.branch_name(&repository.id).await?;
            let branch = match from.branch(&repository.id) {
                None => {
                    info!(repository = %repository.id, "skip merge: no branch in context");
                    outcomes.push(ContextOutcome::skipped(
                        repository,
                        SkipReason::NoBranchInContext,
                    ));
                    continue;
                }
                Some(branch) if branch == current => {
                    info!(
                        repository = %repository.id,
                        branch = %branch,
                        "skip merge: already on branch"
                    );
                    outcomes.push(ContextOutcome::skipped(
                        repository,
                        SkipReason::AlreadyOnBranch,
                    ));
                    continue;
                }
                Some(branch) => branch,
            };

            info!(repository = %repository.id, from = %branch, into = %current, "merge");
            if let Err(merge_err) = self.provider.merge(&repository.id, branch).await {
                error!(repository = %repository.id, error = %merge_err, "merge failed, resetting");
                let mut errors = vec![PlatformError::from(merge_err)];
                if let Err(reset_err) = self.provider.reset(&repository.id).await {
                    errors.push(reset_err.into());
                }
                return Err(PlatformError::join(errors));
            }
            outcomes.push(ContextOutcome::applied(repository));
        }
        Ok(outcomes)
    }

    /// Push every repository whose branch in `context_id` differs from the
    /// base context. Without `force` the push is a dry run.
    pub async fn push_context(&self, context_id: &str, force: bool) -> Result<Vec<ContextOutcome>> {
        let context = self.platform.context(context_id)?;
        let base = self.platform.base_context(context);
        let mut outcomes = Vec::with_capacity(self.platform.repositories.len());

        for repository in &self.platform.repositories {
            let base_branch = base
                .and_then(|base| base.branch(&repository.id))
                .unwrap_or_default();
            let outcome = match context.branch(&repository.id) {
                None => ContextOutcome::skipped(repository, SkipReason::NoBranchInContext),
                Some(branch) if branch == base_branch => {
                    ContextOutcome::skipped(repository, SkipReason::SameAsBase)
                }
                Some(_) => {
                    info!(repository = %repository.id, dry_run = !force, "push");
                    let output = self.provider.push(&repository.id, !force).await?;
                    if !output.is_empty() {
                        info!(repository = %repository.id, "{output}");
                    }
                    ContextOutcome::applied(repository)
                }
            };
            if let Some(reason) = outcome.skip_reason() {
                info!(repository = %repository.id, reason = ?reason, "skip push");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
