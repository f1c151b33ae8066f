//! Registry connector
//!
//! Ensures the single host-local registry container exists, is running and is a
//! member of the cluster network, then wires it into a cluster: every node gets
//! a containerd `hosts.toml` aliasing `localhost:5000` to the registry
//! container, and the cluster gets the `local-registry-hosting` discovery
//! ConfigMap.
//!
//! The registry container is shared by every scenario on the host, so each
//! mutation is preceded by a check of the current state and every "already
//! there" answer from the daemon is success.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::{
    Error, Result, FIELD_MANAGER, KIND_NETWORK_NAME, REGISTRY_CONTAINER_NAME, REGISTRY_HOST_IP,
    REGISTRY_IMAGE, REGISTRY_PORT,
};

/// Name of the discovery ConfigMap
pub const DISCOVERY_CONFIGMAP: &str = "local-registry-hosting";
/// Namespace of the discovery ConfigMap
pub const DISCOVERY_NAMESPACE: &str = "kube-public";
/// Help link recorded in the discovery ConfigMap
pub const DISCOVERY_HELP: &str = "https://kind.sigs.k8s.io/docs/user/local-registry/";

/// What the registry container should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySpec {
    /// Container name, also its hostname on the cluster network
    pub container_name: String,
    /// Registry image
    pub image: String,
    /// Host address the port is bound to
    pub host_ip: String,
    /// Host port
    pub host_port: u16,
    /// Port the registry listens on inside the container
    pub container_port: u16,
}

impl Default for RegistrySpec {
    fn default() -> Self {
        Self {
            container_name: REGISTRY_CONTAINER_NAME.to_string(),
            image: REGISTRY_IMAGE.to_string(),
            host_ip: REGISTRY_HOST_IP.to_string(),
            host_port: REGISTRY_PORT,
            container_port: REGISTRY_PORT,
        }
    }
}

impl RegistrySpec {
    /// `localhost:<port>`, valid on the host and (through aliasing) on nodes
    pub fn host(&self) -> String {
        format!("localhost:{}", self.host_port)
    }

    /// Registry endpoint as reached over the cluster network
    pub fn network_endpoint(&self) -> String {
        format!("http://{}:{}", self.container_name, self.container_port)
    }

    /// containerd registry config directory on each node
    pub fn certs_dir(&self) -> String {
        format!("/etc/containerd/certs.d/{}", self.host())
    }

    /// Contents of the node-side `hosts.toml`
    pub fn hosts_toml(&self) -> String {
        format!("[host.\"{}\"]\n", self.network_endpoint())
    }
}

/// Observed state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    /// Container id
    pub id: String,
    /// Whether it is running
    pub running: bool,
    /// Networks it is attached to
    pub networks: Vec<String>,
}

/// Result of a create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new container was created
    Created,
    /// Another caller created it first
    AlreadyExists,
}

/// Container daemon operations the connector needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect a container by name; `None` if it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>>;

    /// Pull an image if the daemon does not have it
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create the registry container (not started)
    async fn create_registry(&self, spec: &RegistrySpec) -> Result<CreateOutcome>;

    /// Start a container; starting a running container is a no-op
    async fn start(&self, name: &str) -> Result<()>;

    /// Attach a container to a network
    async fn connect_network(&self, network: &str, container: &str) -> Result<()>;

    /// Run a command inside a container and wait for it to exit successfully
    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<()>;

    /// Write a single file into a directory of a container
    async fn upload_file(
        &self,
        container: &str,
        dir: &str,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<()>;
}

/// The running registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryHandle {
    /// Container id
    pub container_id: String,
    /// Container name
    pub container_name: String,
    /// Host-side coordinates (`localhost:5000`)
    pub host: String,
    /// Whether this call created the container
    pub created: bool,
    /// Whether this call started the container
    pub started: bool,
    /// Networks the container is a member of
    pub networks: Vec<String>,
}

impl RegistryHandle {
    /// True when the registry is attached to `network`
    pub fn is_member_of(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }
}

/// Make sure the registry container exists and runs.
#[instrument(skip(runtime, spec), fields(registry = %spec.container_name))]
pub async fn ensure_registry(
    runtime: &dyn ContainerRuntime,
    spec: &RegistrySpec,
) -> Result<RegistryHandle> {
    let mut created = false;
    let state = match runtime.inspect(&spec.container_name).await? {
        Some(state) => state,
        None => {
            runtime.pull_image(&spec.image).await?;
            match runtime.create_registry(spec).await? {
                CreateOutcome::Created => {
                    created = true;
                    info!(image = %spec.image, host = %spec.host(), "created registry container");
                }
                CreateOutcome::AlreadyExists => {
                    info!("registry container created concurrently, reusing it");
                }
            }
            runtime.inspect(&spec.container_name).await?.ok_or_else(|| {
                Error::setup(
                    "inspect registry",
                    format!("{} missing right after create", spec.container_name),
                )
            })?
        }
    };

    let started = !state.running;
    if started {
        runtime.start(&spec.container_name).await?;
        info!(id = %state.id, "started registry container");
    } else {
        info!(id = %state.id, "registry container already running");
    }

    Ok(RegistryHandle {
        container_id: state.id,
        container_name: spec.container_name.clone(),
        host: spec.host(),
        created,
        started,
        networks: state.networks,
    })
}

/// Attach the registry to `network` unless it is already a member.
///
/// The handle is a snapshot and another scenario may join the shared registry
/// in between, so a failed join is re-checked against the live container.
pub async fn join_network(
    runtime: &dyn ContainerRuntime,
    handle: &mut RegistryHandle,
    network: &str,
) -> Result<()> {
    if handle.is_member_of(network) {
        return Ok(());
    }
    if let Err(e) = runtime
        .connect_network(network, &handle.container_name)
        .await
    {
        let joined_elsewhere = runtime
            .inspect(&handle.container_name)
            .await
            .ok()
            .flatten()
            .map(|state| state.networks.iter().any(|n| n == network))
            .unwrap_or(false);
        if !joined_elsewhere {
            return Err(Error::setup(
                "registry network join",
                format!("{}: {}", network, e),
            ));
        }
        info!(network = %network, registry = %handle.container_name, "registry joined network concurrently");
    } else {
        info!(network = %network, registry = %handle.container_name, "registry joined network");
    }
    handle.networks.push(network.to_string());
    Ok(())
}

/// Point containerd on every node at the registry container.
pub async fn alias_on_nodes(
    runtime: &dyn ContainerRuntime,
    spec: &RegistrySpec,
    nodes: &[String],
) -> Result<()> {
    let dir = spec.certs_dir();
    let hosts = spec.hosts_toml();
    for node in nodes {
        runtime
            .exec(node, vec!["mkdir".to_string(), "-p".to_string(), dir.clone()])
            .await
            .map_err(|e| Error::setup("create registry config dir", format!("{}: {}", node, e)))?;
        runtime
            .upload_file(node, &dir, "hosts.toml", hosts.clone().into_bytes())
            .await
            .map_err(|e| Error::setup("write registry hosts.toml", format!("{}: {}", node, e)))?;
        info!(node = %node, dir = %dir, "registry alias written");
    }
    Ok(())
}

/// The discovery ConfigMap documenting the registry's host coordinates
pub fn discovery_configmap(host: &str) -> ConfigMap {
    let data = BTreeMap::from([
        ("localRegistryHosting.v1.host".to_string(), host.to_string()),
        ("localRegistryHosting.v1.help".to_string(), DISCOVERY_HELP.to_string()),
    ]);
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(DISCOVERY_CONFIGMAP.to_string()),
            namespace: Some(DISCOVERY_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Write the discovery ConfigMap (server-side apply, safe to repeat)
pub async fn publish_discovery(client: &Client, host: &str) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), DISCOVERY_NAMESPACE);
    api.patch(
        DISCOVERY_CONFIGMAP,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&discovery_configmap(host)),
    )
    .await
    .map_err(|e| Error::setup("apply local-registry-hosting", e.to_string()))?;
    info!(host = %host, "registry discovery config published");
    Ok(())
}

/// Wire the registry into a freshly created cluster.
#[instrument(skip_all, fields(registry = %spec.container_name))]
pub async fn connect_registry(
    runtime: &dyn ContainerRuntime,
    client: &Client,
    spec: &RegistrySpec,
    nodes: &[String],
) -> Result<RegistryHandle> {
    let mut handle = ensure_registry(runtime, spec).await?;
    alias_on_nodes(runtime, spec, nodes).await?;
    join_network(runtime, &mut handle, KIND_NETWORK_NAME).await?;
    publish_discovery(client, &handle.host).await?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn running(networks: &[&str]) -> ContainerState {
        ContainerState {
            id: "abc123".to_string(),
            running: true,
            networks: networks.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[test]
    fn node_alias_points_at_registry_container() {
        let spec = RegistrySpec::default();
        assert_eq!(spec.certs_dir(), "/etc/containerd/certs.d/localhost:5000");
        assert_eq!(spec.hosts_toml(), "[host.\"http://kind-registry:5000\"]\n");
        assert_eq!(spec.host(), "localhost:5000");
    }

    #[test]
    fn discovery_configmap_uses_well_known_keys() {
        let cm = discovery_configmap("localhost:5000");
        assert_eq!(cm.metadata.name.as_deref(), Some("local-registry-hosting"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("kube-public"));
        let data = cm.data.unwrap();
        assert_eq!(data["localRegistryHosting.v1.host"], "localhost:5000");
        assert_eq!(data["localRegistryHosting.v1.help"], DISCOVERY_HELP);
    }

    #[tokio::test]
    async fn creates_and_starts_missing_registry() {
        let mut runtime = MockContainerRuntime::new();
        let mut seq = Sequence::new();
        runtime
            .expect_inspect()
            .with(eq("kind-registry"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        runtime
            .expect_pull_image()
            .with(eq("registry:2"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        runtime
            .expect_create_registry()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CreateOutcome::Created));
        runtime
            .expect_inspect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(Some(ContainerState {
                    running: false,
                    ..running(&["bridge"])
                }))
            });
        runtime
            .expect_start()
            .with(eq("kind-registry"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let handle = ensure_registry(&runtime, &RegistrySpec::default())
            .await
            .unwrap();
        assert!(handle.created);
        assert!(handle.started);
        assert_eq!(handle.host, "localhost:5000");
    }

    #[tokio::test]
    async fn second_call_against_running_registry_changes_nothing() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_inspect()
            .times(2)
            .returning(|_| Ok(Some(running(&["bridge", "kind"]))));
        runtime.expect_pull_image().never();
        runtime.expect_create_registry().never();
        runtime.expect_start().never();
        runtime.expect_connect_network().never();

        let spec = RegistrySpec::default();
        for _ in 0..2 {
            let mut handle = ensure_registry(&runtime, &spec).await.unwrap();
            join_network(&runtime, &mut handle, KIND_NETWORK_NAME)
                .await
                .unwrap();
            assert!(!handle.created);
            assert!(!handle.started);
            assert_eq!(handle.container_id, "abc123");
        }
    }

    #[tokio::test]
    async fn stopped_registry_is_started() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_| {
            Ok(Some(ContainerState {
                running: false,
                ..running(&[])
            }))
        });
        runtime.expect_start().times(1).returning(|_| Ok(()));

        let handle = ensure_registry(&runtime, &RegistrySpec::default())
            .await
            .unwrap();
        assert!(handle.started);
        assert!(!handle.created);
    }

    #[tokio::test]
    async fn concurrent_create_is_reused() {
        let mut runtime = MockContainerRuntime::new();
        let mut seq = Sequence::new();
        runtime
            .expect_inspect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        runtime.expect_pull_image().returning(|_| Ok(()));
        runtime
            .expect_create_registry()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CreateOutcome::AlreadyExists));
        runtime
            .expect_inspect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(running(&["bridge"]))));
        runtime.expect_start().never();

        let handle = ensure_registry(&runtime, &RegistrySpec::default())
            .await
            .unwrap();
        assert!(!handle.created);
        assert!(!handle.started);
    }

    #[tokio::test]
    async fn create_failure_is_fatal() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_inspect().returning(|_| Ok(None));
        runtime.expect_pull_image().returning(|_| Ok(()));
        runtime
            .expect_create_registry()
            .returning(|_| Err(Error::setup("create registry", "port is already allocated")));

        let err = ensure_registry(&runtime, &RegistrySpec::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));
    }

    #[tokio::test]
    async fn joins_network_only_when_missing() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_connect_network()
            .with(eq("kind"), eq("kind-registry"))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut handle = RegistryHandle {
            container_id: "abc123".to_string(),
            container_name: "kind-registry".to_string(),
            host: "localhost:5000".to_string(),
            created: false,
            started: false,
            networks: vec!["bridge".to_string()],
        };
        join_network(&runtime, &mut handle, "kind").await.unwrap();
        assert!(handle.is_member_of("kind"));
        join_network(&runtime, &mut handle, "kind").await.unwrap();
    }

    fn snapshot(networks: &[&str]) -> RegistryHandle {
        RegistryHandle {
            container_id: "abc123".to_string(),
            container_name: "kind-registry".to_string(),
            host: "localhost:5000".to_string(),
            created: false,
            started: false,
            networks: networks.iter().map(|n| n.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn join_raced_by_another_scenario_succeeds() {
        let mut runtime = MockContainerRuntime::new();
        let mut seq = Sequence::new();
        // both scenarios saw the registry on bridge only
        runtime
            .expect_connect_network()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        runtime
            .expect_connect_network()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(Error::setup(
                    "connect network",
                    "endpoint with name kind-registry already exists in network kind",
                ))
            });
        runtime
            .expect_inspect()
            .with(eq("kind-registry"))
            .times(1)
            .returning(|_| Ok(Some(running(&["bridge", "kind"]))));

        let mut first = snapshot(&["bridge"]);
        let mut second = snapshot(&["bridge"]);
        join_network(&runtime, &mut first, "kind").await.unwrap();
        join_network(&runtime, &mut second, "kind").await.unwrap();
        assert!(first.is_member_of("kind"));
        assert!(second.is_member_of("kind"));
    }

    #[tokio::test]
    async fn network_join_failure_names_the_step() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_connect_network()
            .returning(|_, _| Err(Error::setup("docker", "network kind not found")));
        runtime
            .expect_inspect()
            .returning(|_| Ok(Some(running(&["bridge"]))));

        let mut handle = RegistryHandle {
            container_id: "abc123".to_string(),
            container_name: "kind-registry".to_string(),
            host: "localhost:5000".to_string(),
            created: false,
            started: false,
            networks: vec![],
        };
        let err = join_network(&runtime, &mut handle, "kind").await.unwrap_err();
        assert!(matches!(err, Error::Setup { ref context, .. } if context == "registry network join"));
    }

    #[tokio::test]
    async fn writes_hosts_toml_on_every_node() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_exec()
            .withf(|_, cmd| {
                cmd == &["mkdir", "-p", "/etc/containerd/certs.d/localhost:5000"]
            })
            .times(2)
            .returning(|_, _| Ok(()));
        runtime
            .expect_upload_file()
            .withf(|node, dir, name, contents| {
                node.starts_with("draft-e2e-")
                    && dir == "/etc/containerd/certs.d/localhost:5000"
                    && name == "hosts.toml"
                    && contents == b"[host.\"http://kind-registry:5000\"]\n"
            })
            .times(2)
            .returning(|_, _, _, _| Ok(()));

        let nodes = vec![
            "draft-e2e-abc-control-plane".to_string(),
            "draft-e2e-abc-worker".to_string(),
        ];
        alias_on_nodes(&runtime, &RegistrySpec::default(), &nodes)
            .await
            .unwrap();
    }
}
