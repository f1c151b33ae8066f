//! A single on-disk manifest, decoded once.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Kinds that live outside any namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "IngressClass",
    "PriorityClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// True for kinds that are not namespaced
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Group/version/kind of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvk {
    /// apiVersion as written (`apps/v1`, `v1`)
    pub api_version: String,
    /// Kind
    pub kind: String,
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version, self.kind)
    }
}

/// One manifest file holding exactly one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDocument {
    /// Source file
    pub path: PathBuf,
    /// Type of the object
    pub gvk: Gvk,
    /// `metadata.name`
    pub name: String,
    /// The object as a generic value
    pub object: serde_json::Value,
}

impl ManifestDocument {
    /// Decode `content` read from `path`.
    ///
    /// The error is a plain message; callers attach the path.
    pub fn decode(path: &Path, content: &str) -> Result<Self, String> {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_json::Value::deserialize(document)
                .map_err(|e| format!("invalid YAML: {}", e))?;
            if !value.is_null() {
                documents.push(value);
            }
        }

        let object = match documents.len() {
            0 => return Err("no document found".to_string()),
            1 => documents.remove(0),
            n => return Err(format!("expected exactly one document, found {}", n)),
        };
        if !object.is_object() {
            return Err("document is not a mapping".to_string());
        }

        let field = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| format!("missing {}", pointer.trim_start_matches('/').replace('/', ".")))
        };
        let gvk = Gvk {
            api_version: field("/apiVersion")?,
            kind: field("/kind")?,
        };
        let name = field("/metadata/name")?;

        Ok(Self {
            path: path.to_path_buf(),
            gvk,
            name,
            object,
        })
    }

    /// `metadata.namespace`, if set
    pub fn namespace(&self) -> Option<&str> {
        self.object
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Whether the object lives in a namespace
    pub fn is_namespaced(&self) -> bool {
        !is_cluster_scoped(&self.gvk.kind)
    }

    /// Place a namespaced object without an explicit namespace into `namespace`
    pub fn default_namespace(&mut self, namespace: &str) {
        if !self.is_namespaced() || self.namespace().is_some() {
            return;
        }
        if let Some(metadata) = self
            .object
            .get_mut("metadata")
            .and_then(|m| m.as_object_mut())
        {
            metadata.insert(
                "namespace".to_string(),
                serde_json::Value::String(namespace.to_string()),
            );
        }
    }

    /// Every container image the object declares, in document order
    pub fn images(&self) -> Vec<String> {
        let mut images = Vec::new();
        collect_images(&self.object, &mut images);
        images
    }
}

fn collect_images(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                if key == "containers" || key == "initContainers" {
                    if let Some(containers) = child.as_array() {
                        out.extend(
                            containers
                                .iter()
                                .filter_map(|c| c.get("image").and_then(|i| i.as_str()))
                                .map(str::to_string),
                        );
                    }
                } else {
                    collect_images(child, out);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_images(item, out);
            }
        }
        _ => {}
    }
}
