//! Kubernetes client and namespace helpers shared by the applier, the waiter and
//! the cluster lifecycle.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, info};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result, FIELD_MANAGER};

/// Connect timeout for every cluster client
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout for every cluster client
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client from a kubeconfig file and wait until the API server answers.
pub async fn create_client(kubeconfig: &Path) -> Result<Client> {
    let raw = Kubeconfig::read_from(kubeconfig).map_err(|e| {
        Error::setup(
            "read kubeconfig",
            format!("{}: {}", kubeconfig.display(), e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::setup("load kubeconfig", e.to_string()))?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);

    let client = Client::try_from(config)?;

    let version = retry_with_backoff(&RetryConfig::fresh_cluster(), "apiserver version", || {
        let client = client.clone();
        async move { client.apiserver_version().await }
    })
    .await?;
    debug!(version = %version.git_version, "connected to API server");

    Ok(client)
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Create the namespace if missing (server-side apply, idempotent)
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&namespace(name)),
    )
    .await?;
    debug!(namespace = %name, "namespace ensured");
    Ok(())
}

/// Create the namespace with a plain create; an existing one is left as is
pub async fn create_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.create(&PostParams::default(), &namespace(name)).await {
        Ok(_) => {
            debug!(namespace = %name, "namespace created");
            Ok(())
        }
        Err(e) if is_conflict(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a namespace; an already-gone namespace is not an error
pub async fn delete_namespace(client: &Client, name: &str) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(namespace = %name, "namespace deleted");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True for a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True for a 409 from the API server
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Split an apiVersion into group and version (`"v1"` has the empty core group)
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Lowercase plural for a kind, used when discovery has not seen it
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(|c: char| "aeiou".contains(c)) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

/// ApiResource for an apiVersion/kind without consulting discovery
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// True if `status.conditions` holds `type_ == status`
pub fn has_condition(status: &serde_json::Value, type_: &str, expected: &str) -> bool {
    status
        .get("conditions")
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(type_)
                    && c.get("status").and_then(|s| s.as_str()) == Some(expected)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn splits_grouped_and_core_api_versions() {
        assert_eq!(parse_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(parse_api_version("networking.k8s.io/v1"), ("networking.k8s.io", "v1"));
        assert_eq!(parse_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn pluralizes_common_kinds() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn api_resource_for_core_kind() {
        let ar = api_resource("v1", "Service");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "services");
    }

    #[test]
    fn condition_lookup_matches_type_and_status() {
        let status = json!({
            "conditions": [
                {"type": "Failed", "status": "False"},
                {"type": "Complete", "status": "True"}
            ]
        });
        assert!(has_condition(&status, "Complete", "True"));
        assert!(!has_condition(&status, "Failed", "True"));
        assert!(!has_condition(&json!({}), "Complete", "True"));
    }
}
