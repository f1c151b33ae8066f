//! Shared setup for kind tests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use draft_e2e::cluster::{ClusterProvisioner, Environment, KindCli};
use draft_e2e::config::RunOptions;
use draft_e2e::docker::DockerClient;

/// Run options with a test-specific cluster prefix.
///
/// Distinct prefixes keep one test's stale sweep away from another's cluster.
pub fn options(prefix: &str) -> RunOptions {
    RunOptions {
        cluster_prefix: prefix.to_string(),
        readiness_timeout: Duration::from_secs(180),
        ..RunOptions::default()
    }
}

pub fn kind() -> Arc<dyn ClusterProvisioner> {
    Arc::new(KindCli::default())
}

pub async fn docker() -> DockerClient {
    DockerClient::connect()
        .await
        .expect("docker daemon should be reachable")
}

/// Set up a fresh environment under `prefix`
pub async fn environment(prefix: &str) -> Environment {
    let docker = docker().await;
    Environment::setup(kind(), &docker, &options(prefix))
        .await
        .expect("environment setup should succeed")
}

pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}
