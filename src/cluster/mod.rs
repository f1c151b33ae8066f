//! Cluster lifecycle
//!
//! Owns everything a scenario runs inside: a freshly named kind cluster, an
//! isolated namespace and the registry wiring. Setup sweeps clusters left
//! behind by crashed earlier runs before creating a new one.
//!
//! An [`Environment`] is released exactly once: [`Environment::teardown`]
//! consumes it, and [`with_environment`] runs a scenario body and then tears
//! down no matter how the body ended, including by panic.

mod kind;

pub use kind::{KindCli, DEFAULT_KIND_CONFIG, DEFAULT_NODE_IMAGE};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tempfile::TempDir;
use tracing::{error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::RunOptions;
use crate::kube_utils::{create_client, delete_namespace, ensure_namespace};
use crate::registry::{connect_registry, ContainerRuntime, RegistryHandle, RegistrySpec};
use crate::{Error, Result, NAMESPACE_PREFIX};

/// Length of generated cluster and namespace names
pub const NAME_LENGTH: usize = 16;

/// Cluster provisioning backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Names of all existing clusters
    async fn list_clusters(&self) -> Result<Vec<String>>;

    /// Write a cluster's kubeconfig to `kubeconfig`
    async fn export_kubeconfig(&self, name: &str, kubeconfig: &Path) -> Result<()>;

    /// Create a cluster from `config` (kind config YAML), writing its kubeconfig
    async fn create_cluster(
        &self,
        name: &str,
        config: &str,
        node_image: &str,
        kubeconfig: &Path,
    ) -> Result<()>;

    /// Destroy a cluster
    async fn delete_cluster(&self, name: &str, kubeconfig: &Path) -> Result<()>;

    /// Container names of a cluster's nodes
    async fn list_nodes(&self, name: &str) -> Result<Vec<String>>;
}

/// `prefix-xxxx` padded with random lowercase alphanumerics to `len` characters.
///
/// A prefix that leaves no room is returned unchanged.
pub fn random_name(prefix: &str, len: usize) -> String {
    if prefix.len() + 1 >= len {
        return prefix.to_string();
    }
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(len - prefix.len() - 1)
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// Outcome of a stale-cluster sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Clusters destroyed
    pub deleted: Vec<String>,
    /// Clusters that could not be destroyed, with the reason
    pub failed: Vec<(String, String)>,
}

/// Destroy every cluster whose name starts with `prefix`.
///
/// Each cluster's kubeconfig is exported to a scratch file first and handed to
/// the delete call. Failures are logged and reported, never fatal.
///
/// Liveness is not checked: a run still using a cluster under `prefix` loses
/// it. Runs that may overlap on one host need distinct prefixes.
#[instrument(skip(provisioner))]
pub async fn sweep_stale_clusters(
    provisioner: &dyn ClusterProvisioner,
    prefix: &str,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let scratch = tempfile::tempdir()?;

    for name in provisioner.list_clusters().await? {
        if !name.starts_with(prefix) {
            continue;
        }
        info!(cluster = %name, "cleaning up stale cluster");
        let kubeconfig = scratch.path().join(format!("{}.kubeconfig", name));
        if let Err(e) = provisioner.export_kubeconfig(&name, &kubeconfig).await {
            warn!(cluster = %name, error = %e, "kubeconfig export failed, deleting anyway");
        }
        match provisioner.delete_cluster(&name, &kubeconfig).await {
            Ok(()) => report.deleted.push(name),
            Err(e) => {
                warn!(cluster = %name, error = %e, "stale cluster delete failed");
                report.failed.push((name, e.to_string()));
            }
        }
    }
    Ok(report)
}

/// A provisioned cluster and its kubeconfig.
#[derive(Debug)]
pub struct ClusterHandle {
    name: String,
    kubeconfig: PathBuf,
    nodes: Vec<String>,
    // keeps the kubeconfig alive
    _dir: TempDir,
}

impl ClusterHandle {
    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the cluster's kubeconfig
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Node container names
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }
}

/// Sweep stale clusters, then create a freshly named one.
pub async fn provision_cluster(
    provisioner: &dyn ClusterProvisioner,
    options: &RunOptions,
) -> Result<ClusterHandle> {
    let swept = sweep_stale_clusters(provisioner, &options.cluster_prefix).await?;
    if !swept.deleted.is_empty() {
        info!(count = swept.deleted.len(), "stale clusters removed");
    }

    let config = match &options.kind_config {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            Error::setup("read kind config", format!("{}: {}", path.display(), e))
        })?,
        None => DEFAULT_KIND_CONFIG.to_string(),
    };

    let name = random_name(&options.cluster_prefix, NAME_LENGTH);
    let dir = tempfile::tempdir()?;
    let kubeconfig = dir.path().join("kubeconfig");

    info!(cluster = %name, node_image = %options.node_image, "creating cluster");
    if let Err(e) = provisioner
        .create_cluster(&name, &config, &options.node_image, &kubeconfig)
        .await
    {
        // a failed create can leave node containers behind
        if let Err(cleanup) = provisioner.delete_cluster(&name, &kubeconfig).await {
            warn!(cluster = %name, error = %cleanup, "cleanup after failed create failed");
        }
        return Err(e);
    }

    let handle = ClusterHandle {
        name,
        kubeconfig,
        nodes: Vec::new(),
        _dir: dir,
    };
    match provisioner.list_nodes(&handle.name).await {
        Ok(nodes) => Ok(ClusterHandle { nodes, ..handle }),
        Err(e) => {
            destroy_cluster(provisioner, handle).await;
            Err(e)
        }
    }
}

/// Delete a cluster, logging instead of failing
pub async fn destroy_cluster(provisioner: &dyn ClusterProvisioner, handle: ClusterHandle) {
    match provisioner
        .delete_cluster(&handle.name, &handle.kubeconfig)
        .await
    {
        Ok(()) => info!(cluster = %handle.name, "cluster deleted"),
        Err(e) => error!(cluster = %handle.name, error = %e, "cluster delete failed"),
    }
}

/// Everything one scenario runs against.
pub struct Environment {
    provisioner: Arc<dyn ClusterProvisioner>,
    cluster: ClusterHandle,
    namespace: String,
    client: Client,
    registry: RegistryHandle,
    keep_cluster: bool,
}

impl Environment {
    /// Provision a cluster, an isolated namespace and the registry wiring.
    ///
    /// If anything after cluster creation fails the cluster is destroyed before
    /// the error is returned.
    #[instrument(skip_all)]
    pub async fn setup(
        provisioner: Arc<dyn ClusterProvisioner>,
        runtime: &dyn ContainerRuntime,
        options: &RunOptions,
    ) -> Result<Self> {
        let cluster = provision_cluster(provisioner.as_ref(), options).await?;
        let namespace = random_name(NAMESPACE_PREFIX, NAME_LENGTH);

        let wired = async {
            let client = create_client(cluster.kubeconfig()).await?;
            ensure_namespace(&client, &namespace).await?;
            let registry =
                connect_registry(runtime, &client, &RegistrySpec::default(), cluster.nodes())
                    .await?;
            Ok::<_, Error>((client, registry))
        }
        .await;

        match wired {
            Ok((client, registry)) => {
                info!(
                    cluster = %cluster.name(),
                    namespace = %namespace,
                    registry = %registry.host,
                    "environment ready"
                );
                Ok(Self {
                    provisioner,
                    cluster,
                    namespace,
                    client,
                    registry,
                    keep_cluster: options.keep_cluster,
                })
            }
            Err(e) => {
                error!(cluster = %cluster.name(), error = %e, "environment setup failed");
                destroy_cluster(provisioner.as_ref(), cluster).await;
                Err(e)
            }
        }
    }

    /// The cluster
    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// The run's isolated namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Client for the cluster
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The registry
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Delete the namespace, then the cluster. Failures are logged only.
    pub async fn teardown(self) {
        if self.keep_cluster {
            warn!(
                cluster = %self.cluster.name(),
                kubeconfig = %self.cluster.kubeconfig().display(),
                "keeping cluster"
            );
            // the kubeconfig has to outlive the process to be useful
            let _ = self.cluster._dir.keep();
            return;
        }
        if let Err(e) = delete_namespace(&self.client, &self.namespace).await {
            warn!(namespace = %self.namespace, error = %e, "namespace delete failed");
        }
        destroy_cluster(self.provisioner.as_ref(), self.cluster).await;
    }
}

/// A resource released exactly once after use
#[async_trait]
pub trait Release: Send + Sync + Sized {
    /// Release the resource; must not fail
    async fn release(self);
}

#[async_trait]
impl Release for Environment {
    async fn release(self) {
        self.teardown().await
    }
}

/// Run `body` against `resource`, then release it however `body` ended.
///
/// A panic in `body` is caught, the resource released and the panic resumed.
pub async fn scoped<R, T, F>(resource: R, body: F) -> Result<T>
where
    R: Release,
    F: for<'a> FnOnce(&'a R) -> BoxFuture<'a, Result<T>>,
{
    let outcome = AssertUnwindSafe(body(&resource)).catch_unwind().await;
    resource.release().await;
    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Set up an [`Environment`], run `body` in it and always tear it down
pub async fn with_environment<T, S, F>(setup: S, body: F) -> Result<T>
where
    S: Future<Output = Result<Environment>>,
    F: for<'a> FnOnce(&'a Environment) -> BoxFuture<'a, Result<T>>,
{
    let env = setup.await?;
    scoped(env, body).await
}
