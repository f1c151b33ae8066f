//! Manifest applier
//!
//! Walks a directory of generated manifests, decodes every `.yaml`/`.yml` file
//! exactly once and applies the resulting documents. A failure in one file never
//! stops the others: every decode and apply error is collected with its path and
//! the walk fails as a whole only at the end.
//!
//! Two write strategies exist:
//!
//! - [`ApplyStrategy::ServerSide`]: the generic document is sent as an apply
//!   patch and the server resolves the target from the document itself. Any
//!   kind the cluster knows works.
//! - [`ApplyStrategy::Typed`]: the document is decoded into a [`TypedObject`]
//!   and created, or merge-patched when it already exists. Only the kinds in
//!   that enum are accepted.

mod document;
mod typed;

pub use document::{is_cluster_scoped, Gvk, ManifestDocument};
pub use typed::TypedObject;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{self, Scope};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

#[cfg(test)]
use mockall::automock;

use crate::config::{ApplyStrategy, ImageRef};
use crate::error::{ApplyFailures, ManifestFailure};
use crate::kube_utils::{create_namespace, ensure_namespace, parse_api_version};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

/// Kustomize entry points are build inputs, not objects
const KUSTOMIZATION_FILES: &[&str] = &["kustomization.yaml", "kustomization.yml"];

/// Apply order of a kind: dependencies (namespaces, config, services) first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "ClusterRole" | "Role" => 2,
        "ClusterRoleBinding" | "RoleBinding" => 3,
        "ConfigMap" | "Secret" => 4,
        "PersistentVolume" | "PersistentVolumeClaim" => 5,
        "Service" => 6,
        "Deployment" | "StatefulSet" | "DaemonSet" | "Job" | "CronJob" | "Pod" => 7,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 8,
        _ => 9,
    }
}

/// Manifest files under `dir`, recursively, in a stable order.
///
/// Non-YAML files and kustomization files are skipped.
pub fn discover_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::validation(format!(
            "manifest directory {} does not exist",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::setup("walk manifest directory", e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let is_kustomization = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| KUSTOMIZATION_FILES.contains(&n))
            .unwrap_or(false);
        if is_yaml && !is_kustomization {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Decoded contents of a manifest directory.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    /// Documents that decoded, in walk order
    pub documents: Vec<ManifestDocument>,
    /// Files that failed to read or decode, in walk order
    pub failures: Vec<ManifestFailure>,
}

impl ManifestSet {
    /// Read and decode every manifest under `dir`.
    ///
    /// Namespaced documents without a namespace are placed in `default_namespace`.
    pub fn load(dir: &Path, default_namespace: &str) -> Result<Self> {
        let mut set = Self::default();
        for path in discover_manifests(dir)? {
            let decoded = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| ManifestDocument::decode(&path, &content));
            match decoded {
                Ok(mut doc) => {
                    doc.default_namespace(default_namespace);
                    set.documents.push(doc);
                }
                Err(message) => {
                    warn!(path = %path.display(), error = %message, "manifest failed to decode");
                    set.failures.push(ManifestFailure { path, message });
                }
            }
        }
        info!(
            dir = %dir.display(),
            documents = set.documents.len(),
            failures = set.failures.len(),
            "manifests loaded"
        );
        Ok(set)
    }

    /// Fail if any document declares an image other than `expected`
    pub fn verify_images(&self, expected: &ImageRef) -> Result<()> {
        let expected = expected.to_string();
        for doc in &self.documents {
            if let Some(found) = doc.images().into_iter().find(|i| *i != expected) {
                return Err(Error::ImageMismatch {
                    expected,
                    found,
                    path: doc.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Namespaces the documents live in
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.documents
            .iter()
            .filter_map(|d| d.namespace().map(str::to_string))
            .collect()
    }
}

/// Writes objects to the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectApplier: Send + Sync {
    /// Make sure a namespace exists
    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    /// Create or update the object a document describes
    async fn apply(&self, doc: &ManifestDocument) -> Result<()>;
}

/// [`ObjectApplier`] backed by the cluster API
pub struct KubeApplier {
    client: Client,
    strategy: ApplyStrategy,
}

impl KubeApplier {
    /// Create an applier using `strategy`
    pub fn new(client: Client, strategy: ApplyStrategy) -> Self {
        Self { client, strategy }
    }

    async fn apply_server_side(&self, doc: &ManifestDocument) -> Result<()> {
        let (group, version) = parse_api_version(&doc.gvk.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &doc.gvk.kind);
        let (ar, caps) = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "api discovery",
            || discovery::pinned_kind(&self.client, &gvk),
        )
        .await?;

        let api: Api<DynamicObject> = match (caps.scope, doc.namespace()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        api.patch(
            &doc.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&doc.object),
        )
        .await?;
        Ok(())
    }

    async fn apply_typed(&self, doc: &ManifestDocument) -> Result<()> {
        let object = TypedObject::from_document(doc)?;
        let namespace = doc
            .namespace()
            .ok_or_else(|| Error::validation(format!("{} has no namespace", doc.gvk)))?;
        object.apply(&self.client, namespace).await
    }
}

#[async_trait]
impl ObjectApplier for KubeApplier {
    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        match self.strategy {
            ApplyStrategy::ServerSide => ensure_namespace(&self.client, name).await,
            ApplyStrategy::Typed => create_namespace(&self.client, name).await,
        }
    }

    async fn apply(&self, doc: &ManifestDocument) -> Result<()> {
        match self.strategy {
            ApplyStrategy::ServerSide => self.apply_server_side(doc).await,
            ApplyStrategy::Typed => self.apply_typed(doc).await,
        }
    }
}

/// Files that applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Applied files, in apply order
    pub applied: Vec<PathBuf>,
}

/// Apply every document of `set`, collecting failures.
///
/// Decode failures already in the set are reported alongside apply failures.
/// Referenced namespaces are ensured first and documents go out in
/// [`kind_priority`] order.
pub async fn apply_all(
    applier: &dyn ObjectApplier,
    set: &ManifestSet,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    let mut failures = set.failures.clone();
    let mut applied = Vec::new();

    let mut broken_namespaces = BTreeSet::new();
    for ns in set.namespaces() {
        if let Err(e) = applier.ensure_namespace(&ns).await {
            warn!(namespace = %ns, error = %e, "namespace could not be ensured");
            broken_namespaces.insert((ns, e.to_string()));
        }
    }

    let mut ordered: Vec<&ManifestDocument> = set.documents.iter().collect();
    ordered.sort_by_key(|d| kind_priority(&d.gvk.kind));

    for doc in ordered {
        if cancel.is_cancelled() {
            return Err(Error::cancelled("manifest apply"));
        }
        if let Some((ns, message)) = broken_namespaces
            .iter()
            .find(|(ns, _)| Some(ns.as_str()) == doc.namespace())
        {
            failures.push(ManifestFailure {
                path: doc.path.clone(),
                message: format!("namespace {}: {}", ns, message),
            });
            continue;
        }

        match applier.apply(doc).await {
            Ok(()) => {
                info!(
                    path = %doc.path.display(),
                    kind = %doc.gvk.kind,
                    name = %doc.name,
                    namespace = doc.namespace().unwrap_or("-"),
                    "applied manifest"
                );
                applied.push(doc.path.clone());
            }
            Err(e) => {
                warn!(path = %doc.path.display(), error = %e, "manifest failed to apply");
                failures.push(ManifestFailure {
                    path: doc.path.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(ApplyReport { applied })
    } else {
        Err(Error::Apply(ApplyFailures { failures, applied }))
    }
}

/// Load and apply every manifest under `dir`.
#[instrument(skip(applier, cancel), fields(dir = %dir.display()))]
pub async fn apply_dir(
    applier: &dyn ObjectApplier,
    dir: &Path,
    default_namespace: &str,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    let set = ManifestSet::load(dir, default_namespace)?;
    apply_all(applier, &set, cancel).await
}
