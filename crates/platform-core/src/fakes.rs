//! In-memory fakes for the runner and provider traits (testing only)
//!
//! Provides `RecordingRunner` and `MemoryRepositories`, which satisfy the
//! trait contracts without spawning processes or touching git.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::command::{Command, CommandOutput, CommandRunner};
use crate::error::{CommandError, GitError, GitOperation};
use crate::git::RepositoryProvider;
use crate::model::Repository;

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Response {
    Succeed(String),
    Fail(String),
}

/// Command runner that records every command and answers from canned
/// responses. Commands without a matching response succeed with empty
/// output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<Command>>,
    responses: Mutex<Vec<(String, Response)>>,
    blocked: Mutex<Vec<PathBuf>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose command line contains `pattern` with `stdout`.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.into(), Response::Succeed(stdout.into())));
    }

    /// Fail commands whose command line contains `pattern`.
    pub fn fail(&self, pattern: impl Into<String>, output: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.into(), Response::Fail(output.into())));
    }

    /// Commands running in `dir` are recorded but never complete.
    pub fn block_in(&self, dir: impl Into<PathBuf>) {
        self.blocked.lock().unwrap().push(dir.into());
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    /// Recorded commands rendered as `executable arg...`.
    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &Command) -> Result<CommandOutput, CommandError> {
        if command.executable.is_empty() {
            return Err(CommandError::EmptyExecutable);
        }
        self.commands.lock().unwrap().push(command.clone());
        let blocked = command
            .work_dir
            .as_ref()
            .is_some_and(|dir| self.blocked.lock().unwrap().contains(dir));
        if blocked {
            return std::future::pending().await;
        }

        let line = command.to_string();
        let response = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());
        match response {
            Some(Response::Fail(output)) => Err(CommandError::Failed {
                program: command.executable.clone(),
                status: "exit status: 1".to_string(),
                output,
            }),
            Some(Response::Succeed(stdout)) => Ok(CommandOutput::from_stdout(stdout)),
            None => Ok(CommandOutput::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryRepositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RepositoryState {
    cloned: bool,
    branch: String,
    commit: String,
    dirty: bool,
    local_branches: BTreeSet<String>,
}

/// In-memory repository provider. Each repository is a small state record;
/// every provider call is appended to a call log such as
/// `checkout svc-a main`.
#[derive(Debug)]
pub struct MemoryRepositories {
    root: PathBuf,
    repositories: Mutex<HashMap<String, RepositoryState>>,
    failures: Mutex<HashSet<(String, GitOperation)>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryRepositories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            repositories: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Register a cloned repository on `branch` at `commit`.
    pub fn with_repository(self, id: &str, branch: &str, commit: &str) -> Self {
        self.insert(id, branch, commit, true);
        self
    }

    /// Register a repository that only exists upstream; `clone_repository`
    /// materializes it on `branch`.
    pub fn with_remote(self, id: &str, branch: &str, commit: &str) -> Self {
        self.insert(id, branch, commit, false);
        self
    }

    fn insert(&self, id: &str, branch: &str, commit: &str, cloned: bool) {
        let state = RepositoryState {
            cloned,
            branch: branch.to_string(),
            commit: commit.to_string(),
            dirty: false,
            local_branches: BTreeSet::from([branch.to_string()]),
        };
        self.repositories
            .lock()
            .unwrap()
            .insert(id.to_string(), state);
    }

    /// Make every later `operation` on `id` fail.
    pub fn fail_on(&self, id: &str, operation: GitOperation) {
        self.failures
            .lock()
            .unwrap()
            .insert((id.to_string(), operation));
    }

    pub fn set_commit(&self, id: &str, commit: &str) {
        if let Some(state) = self.repositories.lock().unwrap().get_mut(id) {
            state.commit = commit.to_string();
        }
    }

    pub fn set_branch(&self, id: &str, branch: &str) {
        if let Some(state) = self.repositories.lock().unwrap().get_mut(id) {
            state.branch = branch.to_string();
            state.local_branches.insert(branch.to_string());
        }
    }

    /// Simulate local edits in the working tree.
    pub fn make_dirty(&self, id: &str) {
        if let Some(state) = self.repositories.lock().unwrap().get_mut(id) {
            state.dirty = true;
        }
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.repositories
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|state| state.dirty)
    }

    pub fn is_cloned(&self, id: &str) -> bool {
        self.repositories
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|state| state.cloned)
    }

    pub fn branch_of(&self, id: &str) -> Option<String> {
        self.repositories
            .lock()
            .unwrap()
            .get(id)
            .map(|state| state.branch.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that change a working tree or a remote.
    pub fn mutations(&self) -> Vec<String> {
        const MUTATING: [&str; 5] = ["clone", "checkout", "reset", "merge", "push"];
        self.calls()
            .into_iter()
            .filter(|call| {
                call.split_whitespace()
                    .next()
                    .is_some_and(|op| MUTATING.contains(&op))
            })
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, id: &str, operation: GitOperation) -> Result<(), GitError> {
        if self
            .failures
            .lock()
            .unwrap()
            .contains(&(id.to_string(), operation))
        {
            return Err(GitError::Command {
                repository: id.to_string(),
                operation,
                source: CommandError::Failed {
                    program: "git".to_string(),
                    status: "exit status: 1".to_string(),
                    output: format!("injected {operation} failure"),
                },
            });
        }
        Ok(())
    }

    fn with_state<T>(
        &self,
        id: &str,
        operation: GitOperation,
        f: impl FnOnce(&mut RepositoryState) -> T,
    ) -> Result<T, GitError> {
        let mut repositories = self.repositories.lock().unwrap();
        match repositories.get_mut(id) {
            Some(state) if state.cloned => Ok(f(state)),
            _ => Err(GitError::Command {
                repository: id.to_string(),
                operation,
                source: CommandError::Failed {
                    program: "git".to_string(),
                    status: "exit status: 128".to_string(),
                    output: "fatal: not a git repository".to_string(),
                },
            }),
        }
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRepositories {
    fn repository_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    async fn exists(&self, repository: &Repository) -> Result<bool, GitError> {
        self.record(format!("exists {}", repository.id));
        Ok(self.is_cloned(&repository.id))
    }

    async fn clone_repository(&self, repository: &Repository) -> Result<(), GitError> {
        self.record(format!("clone {}", repository.id));
        self.check(&repository.id, GitOperation::Clone)?;
        let mut repositories = self.repositories.lock().unwrap();
        match repositories.get_mut(&repository.id) {
            Some(state) => {
                state.cloned = true;
                Ok(())
            }
            None => Err(GitError::Command {
                repository: repository.id.clone(),
                operation: GitOperation::Clone,
                source: CommandError::Failed {
                    program: "git".to_string(),
                    status: "exit status: 128".to_string(),
                    output: format!("fatal: repository '{}' not found", repository.git_src),
                },
            }),
        }
    }

    async fn fetch(&self, id: &str) -> Result<(), GitError> {
        self.record(format!("fetch {id}"));
        self.check(id, GitOperation::Fetch)?;
        self.with_state(id, GitOperation::Fetch, |_| ())
    }

    async fn checkout(&self, id: &str, branch: &str) -> Result<(), GitError> {
        self.record(format!("checkout {id} {branch}"));
        if branch.is_empty() {
            return Err(GitError::EmptyBranch {
                repository: id.to_string(),
            });
        }
        self.check(id, GitOperation::Checkout)?;
        self.with_state(id, GitOperation::Checkout, |state| {
            state.branch = branch.to_string();
            state.local_branches.insert(branch.to_string());
        })
    }

    async fn head_commit(&self, id: &str) -> Result<String, GitError> {
        self.record(format!("head_commit {id}"));
        self.check(id, GitOperation::Hash)?;
        self.with_state(id, GitOperation::Hash, |state| state.commit.clone())
    }

    async fn branch_name(&self, id: &str) -> Result<String, GitError> {
        self.record(format!("branch_name {id}"));
        self.check(id, GitOperation::BranchName)?;
        self.with_state(id, GitOperation::BranchName, |state| state.branch.clone())
    }

    async fn reset(&self, id: &str) -> Result<(), GitError> {
        self.record(format!("reset {id}"));
        self.check(id, GitOperation::Reset)?;
        self.with_state(id, GitOperation::Reset, |state| state.dirty = false)
    }

    async fn merge(&self, id: &str, branch: &str) -> Result<(), GitError> {
        self.record(format!("merge {id} {branch}"));
        if let Err(err) = self.check(id, GitOperation::Merge) {
            // A failed merge leaves conflict markers behind.
            self.make_dirty(id);
            return Err(err);
        }
        self.with_state(id, GitOperation::Merge, |state| {
            state.commit = format!("{}+{branch}", state.commit);
        })
    }

    async fn push(&self, id: &str, dry_run: bool) -> Result<String, GitError> {
        if dry_run {
            self.record(format!("push {id} --dry-run"));
        } else {
            self.record(format!("push {id}"));
        }
        self.check(id, GitOperation::Push)?;
        self.with_state(id, GitOperation::Push, |state| {
            format!("To origin\n   {}  {} -> {}", state.commit, state.branch, state.branch)
        })
    }
}
