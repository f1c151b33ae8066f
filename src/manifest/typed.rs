//! Typed fallback apply path
//!
//! For backends without server-side apply, documents are decoded into one of a
//! closed set of concrete types and written with create, falling back to a merge
//! patch when the object already exists. Any other kind is rejected.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::document::ManifestDocument;
use crate::kube_utils::is_conflict;
use crate::{Error, Result};

/// A document decoded into one of the supported concrete kinds.
#[derive(Debug, Clone)]
pub enum TypedObject {
    /// `apps/v1` Deployment
    Deployment(Box<Deployment>),
    /// `v1` Service
    Service(Box<Service>),
    /// `networking.k8s.io/v1` Ingress
    Ingress(Box<Ingress>),
    /// `v1` ConfigMap
    ConfigMap(Box<ConfigMap>),
}

impl TypedObject {
    /// Decode `doc` into its concrete kind; unsupported kinds are an error
    pub fn from_document(doc: &ManifestDocument) -> Result<Self> {
        let object = doc.object.clone();
        let decoded = match (doc.gvk.api_version.as_str(), doc.gvk.kind.as_str()) {
            ("apps/v1", "Deployment") => serde_json::from_value(object).map(|o| Self::Deployment(Box::new(o))),
            ("v1", "Service") => serde_json::from_value(object).map(|o| Self::Service(Box::new(o))),
            ("networking.k8s.io/v1", "Ingress") => serde_json::from_value(object).map(|o| Self::Ingress(Box::new(o))),
            ("v1", "ConfigMap") => serde_json::from_value(object).map(|o| Self::ConfigMap(Box::new(o))),
            _ => {
                return Err(Error::validation(format!(
                    "unsupported kind for typed apply: {}",
                    doc.gvk
                )))
            }
        };
        decoded.map_err(|e| Error::validation(format!("decoding {}: {}", doc.gvk, e)))
    }

    /// Create the object in `namespace`, or merge-patch it if it exists
    pub async fn apply(&self, client: &Client, namespace: &str) -> Result<()> {
        match self {
            Self::Deployment(o) => create_or_patch(Api::namespaced(client.clone(), namespace), o.as_ref()).await,
            Self::Service(o) => create_or_patch(Api::namespaced(client.clone(), namespace), o.as_ref()).await,
            Self::Ingress(o) => create_or_patch(Api::namespaced(client.clone(), namespace), o.as_ref()).await,
            Self::ConfigMap(o) => create_or_patch(Api::namespaced(client.clone(), namespace), o.as_ref()).await,
        }
    }
}

async fn create_or_patch<K>(api: Api<K>, object: &K) -> Result<()>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation("object has no metadata.name"))?;

    match api.create(&PostParams::default(), object).await {
        Ok(_) => {
            debug!(name = %name, "created");
            Ok(())
        }
        Err(e) if is_conflict(&e) => {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(object))
                .await?;
            debug!(name = %name, "patched existing object");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn doc(content: &str) -> ManifestDocument {
        ManifestDocument::decode(Path::new("manifests/obj.yaml"), content).unwrap()
    }

    #[test]
    fn decodes_supported_kinds() {
        let deployment = doc(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: go-app\nspec:\n  selector:\n    matchLabels:\n      app: go-app\n  template:\n    metadata:\n      labels:\n        app: go-app\n    spec:\n      containers:\n        - name: go-app\n          image: localhost:5000/manifests-gomodule-8080:latest\n",
        );
        match TypedObject::from_document(&deployment).unwrap() {
            TypedObject::Deployment(d) => {
                assert_eq!(d.metadata.name.as_deref(), Some("go-app"));
            }
            other => panic!("expected deployment, got {other:?}"),
        }

        let service = doc(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: go-app\nspec:\n  ports:\n    - port: 8080\n",
        );
        assert!(matches!(
            TypedObject::from_document(&service).unwrap(),
            TypedObject::Service(_)
        ));

        let ingress = doc("apiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: go-app\n");
        assert!(matches!(
            TypedObject::from_document(&ingress).unwrap(),
            TypedObject::Ingress(_)
        ));
    }

    #[test]
    fn unknown_kind_is_a_hard_error() {
        let hpa = doc("apiVersion: autoscaling/v2\nkind: HorizontalPodAutoscaler\nmetadata:\n  name: go-app\n");
        let err = TypedObject::from_document(&hpa).unwrap_err();
        assert!(err
            .to_string()
            .contains("unsupported kind for typed apply: autoscaling/v2, Kind=HorizontalPodAutoscaler"));
    }

    #[test]
    fn wrong_shape_fails_to_decode() {
        let bad = doc("apiVersion: v1\nkind: Service\nmetadata:\n  name: go-app\nspec:\n  ports: 8080\n");
        assert!(TypedObject::from_document(&bad).is_err());
    }
}
