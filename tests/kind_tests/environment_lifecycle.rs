//! Stories about cluster creation, sweeping and teardown

use draft_e2e::cluster::{provision_cluster, sweep_stale_clusters, ClusterProvisioner, KindCli};
use draft_e2e::registry::{discovery_configmap, DISCOVERY_CONFIGMAP, DISCOVERY_NAMESPACE};
use draft_e2e::{KIND_NETWORK_NAME, NAMESPACE_PREFIX};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::Api;

use super::helpers::{environment, kind, options};

/// Story: a cluster left behind by a crashed run is swept by the next one
///
/// The leftover is created directly through the provisioner and never torn
/// down. A sweep with the same prefix deletes it and leaves nothing behind.
#[tokio::test]
#[ignore = "requires kind - run with: cargo test --test kind -- --ignored"]
async fn story_stale_cluster_is_swept() {
    let prefix = "e2e-sweep";
    let provisioner = KindCli::default();

    let leftover = provision_cluster(&provisioner, &options(prefix))
        .await
        .expect("cluster should be created");
    let name = leftover.name().to_string();
    // simulate a crash: keep the kubeconfig, skip teardown
    std::mem::forget(leftover);

    let report = sweep_stale_clusters(&provisioner, prefix)
        .await
        .expect("sweep should run");
    assert!(report.deleted.contains(&name), "{report:?}");
    assert!(report.failed.is_empty(), "{report:?}");

    let remaining = provisioner.list_clusters().await.expect("list clusters");
    assert!(!remaining.iter().any(|c| c.starts_with(prefix)));
}

/// Story: a fresh environment has its namespace, registry wiring and discovery
///
/// After setup the run namespace exists, the registry sits on the kind network
/// and the discovery config map advertises it. Teardown removes the cluster.
#[tokio::test]
#[ignore = "requires kind - run with: cargo test --test kind -- --ignored"]
async fn story_environment_is_wired_then_torn_down() {
    let env = environment("e2e-env").await;
    let cluster = env.cluster().name().to_string();

    assert!(env.namespace().starts_with(NAMESPACE_PREFIX));
    let namespaces: Api<Namespace> = Api::all(env.client().clone());
    namespaces
        .get(env.namespace())
        .await
        .expect("run namespace should exist");

    assert!(env.registry().is_member_of(KIND_NETWORK_NAME));

    let configmaps: Api<ConfigMap> = Api::namespaced(env.client().clone(), DISCOVERY_NAMESPACE);
    let published = configmaps
        .get(DISCOVERY_CONFIGMAP)
        .await
        .expect("discovery config map should exist");
    assert_eq!(published.data, discovery_configmap("localhost:5000").data);

    env.teardown().await;

    let remaining = kind().list_clusters().await.expect("list clusters");
    assert!(!remaining.contains(&cluster), "cluster should be gone");
}
