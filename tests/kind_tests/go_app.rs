//! The full gomodule scenario

use tokio_util::sync::CancellationToken;

use draft_e2e::config::{DeployType, ScenarioConfig, ScenarioSpec};
use draft_e2e::generator::Generator;
use draft_e2e::scenario::{run_isolated, Step};

use super::helpers::{docker, kind, options};

fn go_app(deploy_type: DeployType) -> ScenarioConfig {
    ScenarioConfig::new(ScenarioSpec {
        language: "gomodule".to_string(),
        port: 8080,
        app_name: "go-app".to_string(),
        namespace: "go-ns".to_string(),
        deploy_type,
        repo: "gambtho/go_echo".to_string(),
        version: "1.22".to_string(),
        image_tag: "latest".to_string(),
    })
    .expect("valid scenario")
}

/// Story: a Go sample goes from source to a ready Deployment
///
/// The generator writes a Dockerfile and manifests for the sample repo, the
/// image is built and pushed to the local registry under the derived name and
/// the Deployment reaches one ready replica behind its Service.
#[tokio::test]
#[ignore = "requires kind and DRAFT_E2E_BIN - run with: cargo test --test kind -- --ignored"]
async fn story_go_app_deploys_and_becomes_ready() {
    let docker = docker().await;
    let config = go_app(DeployType::Manifests);

    let report = run_isolated(
        &config,
        kind(),
        &docker,
        &Generator::from_env(),
        &options("e2e-go"),
        &CancellationToken::new(),
    )
    .await;

    assert!(report.passed(), "{report}");
    assert_eq!(report.image, "localhost:5000/manifests-gomodule-8080:latest");
    assert_eq!(report.readiness.len(), 2);
}

/// Story: a cancelled run stops early and still tears down
#[tokio::test]
#[ignore = "requires kind - run with: cargo test --test kind -- --ignored"]
async fn story_cancelled_run_reports_the_interrupted_step() {
    let docker = docker().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = run_isolated(
        &go_app(DeployType::Manifests),
        kind(),
        &docker,
        &Generator::from_env(),
        &options("e2e-cancel"),
        &cancel,
    )
    .await;

    let failure = report.failure.expect("cancelled run must fail");
    assert_eq!(failure.step, Step::Clone);
    assert!(failure.message.contains("cancelled"), "{}", failure.message);
}
