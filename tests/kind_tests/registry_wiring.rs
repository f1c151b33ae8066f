//! Stories about the local registry container

use draft_e2e::registry::{ensure_registry, RegistrySpec};
use draft_e2e::REGISTRY_CONTAINER_NAME;

use super::helpers::docker;

/// Story: a second ensure finds the registry from the first
///
/// Repeated runs on the same host share one registry container. The second
/// call must neither create nor restart it.
#[tokio::test]
#[ignore = "requires docker - run with: cargo test --test kind -- --ignored"]
async fn story_registry_is_created_once_and_reused() {
    let docker = docker().await;
    let spec = RegistrySpec::default();

    let first = ensure_registry(&docker, &spec)
        .await
        .expect("first ensure should succeed");
    let second = ensure_registry(&docker, &spec)
        .await
        .expect("second ensure should succeed");

    assert_eq!(first.container_name, REGISTRY_CONTAINER_NAME);
    assert_eq!(first.container_id, second.container_id);
    assert!(!second.created, "registry must not be recreated");
    assert!(!second.started, "running registry must not be restarted");
    assert_eq!(second.host, "localhost:5000");
}
