//! Pipelines rendered and run through a real `bash`.

use std::path::Path;
use std::sync::Arc;

use platform_core::fakes::{MemoryRepositories, RecordingRunner};
use platform_core::{ImageBuilder, Orchestrator, PlatformConfig, PlatformError, ProcessRunner};
use platform_pipeline::ScriptExecutor;

struct Fixture {
    root: tempfile::TempDir,
    orchestrator: Orchestrator,
}

impl Fixture {
    fn output(&self) -> String {
        std::fs::read_to_string(self.root.path().join("out.txt")).unwrap_or_default()
    }

    fn scratch(&self) -> std::path::PathBuf {
        self.root.path().join("scratch")
    }
}

fn fixture(templates: &[(&str, &str)]) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out.txt");

    let mut pipelines = Vec::new();
    for (name, body) in templates {
        let file = format!("{name}.sh.tmpl");
        let body = body.replace("$OUT", &out.display().to_string());
        std::fs::write(root.path().join(&file), body).unwrap();
        pipelines.push(format!(r#""{name}": "{file}""#));
    }

    let config = format!(
        r#"{{
            "repoSrc": "/repos",
            "registry": "reg.io",
            "contexts": {{
                "release": {{"branches": {{"lib": "main", "svc": "main"}}}}
            }},
            "repositories": {{
                "lib": {{"gitSrc": "lib.git"}},
                "svc": {{"gitSrc": "svc.git", "dependsOn": ["lib"], "images": ["svc-api"]}}
            }},
            "pipelines": {{ {} }}
        }}"#,
        pipelines.join(", ")
    );
    let platform = Arc::new(PlatformConfig::from_json(&config, root.path()).unwrap());

    let provider = Arc::new(
        MemoryRepositories::new("/repos")
            .with_repository("lib", "main", "1111")
            .with_repository("svc", "main", "2222"),
    );
    let builder = Arc::new(ImageBuilder::new(
        Arc::new(RecordingRunner::new()),
        provider.clone(),
    ));
    let executor = ScriptExecutor::new(
        &platform,
        Arc::new(ProcessRunner::new(true)),
        provider.clone(),
    )
    .with_scratch_dir(root.path().join("scratch"));
    let orchestrator = Orchestrator::new(platform, provider, builder, Arc::new(executor));

    Fixture { root, orchestrator }
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn pipelines_run_in_order_with_repository_metadata() {
    let f = fixture(&[
        (
            "tag",
            "set -eu\n\
             {{#each repositories}}echo \"{{@key}} {{branch}} {{directory}}\" >> $OUT\n{{/each}}",
        ),
        (
            "deploy",
            "set -eu\n\
             for image in {{ repositories.svc.images }}; do\n\
               echo \"deploy {{ registry }}/$image to {{ context_id }}\" >> $OUT\n\
             done\n",
        ),
    ]);

    f.orchestrator
        .execute_pipelines("release", &["tag".to_string(), "deploy".to_string()])
        .await
        .unwrap();

    assert_eq!(
        f.output(),
        "lib main /repos/lib\n\
         svc main /repos/svc\n\
         deploy reg.io/svc-api to release\n"
    );
    assert!(is_empty_dir(&f.scratch()));
}

#[tokio::test]
async fn failing_pipeline_stops_the_run_and_cleans_up() {
    let f = fixture(&[
        ("first", "echo first >> $OUT\nexit 3\n"),
        ("second", "echo second >> $OUT\n"),
    ]);

    let err = f
        .orchestrator
        .execute_pipelines("release", &["first".to_string(), "second".to_string()])
        .await
        .unwrap_err();

    match err {
        PlatformError::Pipeline { pipeline, source } => {
            assert_eq!(pipeline, "first");
            assert!(source.to_string().contains("exit status: 3"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.output(), "first\n");
    assert!(is_empty_dir(&f.scratch()));
}

#[tokio::test]
async fn hashes_are_closure_hashes() {
    let f = fixture(&[(
        "hashes",
        "echo {{ repositories.lib.hash }} {{ repositories.svc.hash }} >> $OUT\n",
    )]);
    let infos = f.orchestrator.repository_infos().await.unwrap();

    f.orchestrator
        .execute_pipelines("release", &["hashes".to_string()])
        .await
        .unwrap();

    assert_eq!(
        f.output().trim(),
        format!(
            "{} {}",
            infos.get("lib").unwrap().hex_hash(),
            infos.get("svc").unwrap().hex_hash()
        )
    );
}
