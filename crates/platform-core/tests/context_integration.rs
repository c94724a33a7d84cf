//! End-to-end context operations against real git repositories.

use std::path::Path;
use std::process::Command as StdCommand;
use std::sync::Arc;

use async_trait::async_trait;
use platform_core::{
    ContextOutcome, GitRepositories, ImageBuilder, Orchestrator, PipelineExecutor, PlatformConfig,
    ProcessRunner, RepositoryInfos, RepositoryProvider, Result, SkipReason,
};

struct NoPipelines;

#[async_trait]
impl PipelineExecutor for NoPipelines {
    async fn execute(
        &self,
        _context: &str,
        _pipeline: &str,
        _infos: &RepositoryInfos,
    ) -> Result<()> {
        Ok(())
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare origin with `main` and `feature-x`, where `feature-x` is one
/// commit ahead of `main`.
fn make_origin(root: &Path, name: &str) -> std::path::PathBuf {
    let work = root.join(format!("{name}-work"));
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init"]);
    git(&work, &["config", "user.name", "test-user"]);
    git(&work, &["config", "user.email", "test@example.com"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(work.join("README"), "main\n").unwrap();
    git(&work, &["add", "README"]);
    git(&work, &["commit", "-m", "initial"]);
    git(&work, &["checkout", "-b", "feature-x"]);
    std::fs::write(work.join("FEATURE"), "x\n").unwrap();
    git(&work, &["add", "FEATURE"]);
    git(&work, &["commit", "-m", "feature"]);
    git(&work, &["checkout", "main"]);

    let bare = root.join(format!("{name}.git"));
    git(
        root,
        &["clone", "--bare", work.to_str().unwrap(), bare.to_str().unwrap()],
    );
    bare
}

struct Fixture {
    _root: tempfile::TempDir,
    provider: Arc<GitRepositories>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let svc = make_origin(root.path(), "svc");
    let lib = make_origin(root.path(), "lib");
    let config = format!(
        r#"{{
            "repoSrc": "checkouts",
            "registry": "reg.io",
            "contexts": {{
                "master": {{"branches": {{"svc": "main", "lib": "main"}}}},
                "release": {{"baseContext": "master", "branches": {{"svc": "feature-x"}}}}
            }},
            "repositories": {{
                "svc": {{"gitSrc": "{}", "dependsOn": ["lib"]}},
                "lib": {{"gitSrc": "{}"}}
            }}
        }}"#,
        svc.display(),
        lib.display()
    );
    let path = root.path().join("platform.json");
    std::fs::write(&path, config).unwrap();

    let platform = Arc::new(PlatformConfig::load(&path).unwrap());
    let runner = Arc::new(ProcessRunner::new(true));
    let provider = Arc::new(GitRepositories::new(&platform.repo_src, runner.clone()));
    let builder = Arc::new(ImageBuilder::new(runner, provider.clone()));
    let orchestrator =
        Orchestrator::new(platform, provider.clone(), builder, Arc::new(NoPipelines));
    Fixture {
        _root: root,
        provider,
        orchestrator,
    }
}

#[tokio::test]
async fn checkout_clones_and_switches_every_repository() {
    let f = fixture();

    let outcomes = f.orchestrator.checkout("release").await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_applied());
    assert_eq!(outcomes[1].skip_reason(), Some(SkipReason::AlreadyOnBranch));

    assert_eq!(f.provider.branch_name("svc").await.unwrap(), "feature-x");
    assert_eq!(f.provider.branch_name("lib").await.unwrap(), "main");
    assert!(f.provider.repository_path("svc").join("FEATURE").exists());
}

#[tokio::test]
async fn checkout_discards_local_edits_and_is_repeatable() {
    let f = fixture();
    f.orchestrator.checkout("master").await.unwrap();

    let svc = f.provider.repository_path("svc");
    std::fs::write(svc.join("README"), "local edit\n").unwrap();
    std::fs::write(svc.join("untracked.txt"), "junk").unwrap();

    f.orchestrator.checkout("release").await.unwrap();
    f.orchestrator.checkout("master").await.unwrap();

    assert_eq!(f.provider.branch_name("svc").await.unwrap(), "main");
    assert_eq!(std::fs::read_to_string(svc.join("README")).unwrap(), "main\n");
    assert!(!svc.join("untracked.txt").exists());
    assert!(!svc.join("FEATURE").exists());
}

#[tokio::test]
async fn closure_hash_tracks_dependency_commits() {
    let f = fixture();
    f.orchestrator.checkout("master").await.unwrap();
    let before = f.orchestrator.repository_infos().await.unwrap();
    assert_eq!(before.get("svc").unwrap().branch.as_deref(), Some("main"));

    f.orchestrator.checkout("release").await.unwrap();
    let after = f.orchestrator.repository_infos().await.unwrap();
    assert_ne!(before.get("svc").unwrap().hash, after.get("svc").unwrap().hash);
    assert_eq!(before.get("lib").unwrap().hash, after.get("lib").unwrap().hash);
    assert_eq!(after.get("svc").unwrap().branch, None);
}

#[tokio::test]
async fn merge_context_fast_forwards_and_skips_current_branches() {
    let f = fixture();
    f.orchestrator.checkout("master").await.unwrap();

    let outcomes = f.orchestrator.merge_context("release").await.unwrap();
    assert!(outcomes[0].is_applied());
    assert_eq!(outcomes[1].skip_reason(), Some(SkipReason::AlreadyOnBranch));
    assert!(f.provider.repository_path("svc").join("FEATURE").exists());
    assert_eq!(f.provider.branch_name("svc").await.unwrap(), "main");
}

#[tokio::test]
async fn push_context_dry_run_skips_base_branches() {
    let f = fixture();
    f.orchestrator.checkout("release").await.unwrap();

    let outcomes = f.orchestrator.push_context("release", false).await.unwrap();
    assert_eq!(
        outcomes,
        vec![
            ContextOutcome::Applied {
                repository: "svc".to_string()
            },
            ContextOutcome::Skipped {
                repository: "lib".to_string(),
                reason: SkipReason::SameAsBase
            },
        ]
    );
}
