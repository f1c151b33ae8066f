//! Readiness waiter
//!
//! Polls a named resource on a fixed cadence until a [`Condition`] holds or an
//! absolute deadline passes. A missing resource counts as "not yet"; any other
//! fetch failure ends the wait immediately with [`ReadinessError::Fetch`], which
//! callers can tell apart from [`ReadinessError::TimedOut`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::Client;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::kube_utils::{api_resource, has_condition, is_not_found};
use crate::Error;

/// A namespaced object addressed by apiVersion, kind and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// apiVersion, e.g. `apps/v1`
    pub api_version: String,
    /// Kind, e.g. `Deployment`
    pub kind: String,
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

impl ResourceRef {
    /// Reference an arbitrary namespaced object
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// A `batch/v1` Job
    pub fn job(namespace: &str, name: &str) -> Self {
        Self::new("batch/v1", "Job", namespace, name)
    }

    /// An `apps/v1` Deployment
    pub fn deployment(namespace: &str, name: &str) -> Self {
        Self::new("apps/v1", "Deployment", namespace, name)
    }

    /// A core `v1` Service
    pub fn service(namespace: &str, name: &str) -> Self {
        Self::new("v1", "Service", namespace, name)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Observed `status` of a resource at one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceStatus {
    /// The object's raw `status` stanza (`null` when absent)
    pub status: serde_json::Value,
}

impl ResourceStatus {
    /// Wrap a raw status stanza
    pub fn new(status: serde_json::Value) -> Self {
        Self { status }
    }

    /// `status.readyReplicas`, treating absence as zero
    pub fn ready_replicas(&self) -> i64 {
        self.status
            .get("readyReplicas")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// Whether a condition of `type_` has status `True`
    pub fn condition_true(&self, type_: &str) -> bool {
        has_condition(&self.status, type_, "True")
    }
}

/// Predicate over an observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The object exists
    Exists,
    /// A Job reports `Complete=True`
    JobComplete,
    /// A Deployment reports at least `min_ready` ready replicas
    DeploymentReady {
        /// Replica threshold
        min_ready: i64,
    },
}

impl Condition {
    /// Evaluate against one poll result (`None` = resource not found)
    pub fn is_satisfied(&self, observed: Option<&ResourceStatus>) -> bool {
        let Some(status) = observed else {
            return false;
        };
        match self {
            Condition::Exists => true,
            Condition::JobComplete => status.condition_true("Complete"),
            Condition::DeploymentReady { min_ready } => status.ready_replicas() >= *min_ready,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Exists => f.write_str("exists"),
            Condition::JobComplete => f.write_str("job complete"),
            Condition::DeploymentReady { min_ready } => {
                write!(f, ">= {} ready replica(s)", min_ready)
            }
        }
    }
}

/// Terminal failure of a wait.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadinessError {
    /// The deadline passed before the condition held
    #[error("timed out after {elapsed:?} waiting for {resource} to satisfy '{condition}' ({polls} polls, last observed: {last_observed})")]
    TimedOut {
        /// Resource being waited on
        resource: String,
        /// Condition that never held
        condition: String,
        /// Time spent waiting
        elapsed: Duration,
        /// Polls issued
        polls: u32,
        /// Summary of the last observed status
        last_observed: String,
    },

    /// Fetching the resource's status failed with something other than not-found
    #[error("fetching status of {resource} failed: {message}")]
    Fetch {
        /// Resource being waited on
        resource: String,
        /// Raw backend message
        message: String,
    },

    /// The run was cancelled mid-wait
    #[error("wait for {resource} cancelled")]
    Cancelled {
        /// Resource being waited on
        resource: String,
    },
}

/// Successful wait summary.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Polls issued, at least one
    pub polls: u32,
    /// Time from start to the satisfying poll
    pub elapsed: Duration,
    /// The status that satisfied the condition
    pub status: ResourceStatus,
}

/// Source of resource status snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current status of `resource`, or `None` if it does not exist yet
    async fn fetch(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, Error>;
}

/// [`StatusSource`] backed by the cluster API
pub struct KubeStatusSource {
    client: Client,
}

impl KubeStatusSource {
    /// Create a source reading through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSource for KubeStatusSource {
    async fn fetch(&self, resource: &ResourceRef) -> Result<Option<ResourceStatus>, Error> {
        let ar = api_resource(&resource.api_version, &resource.kind);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &resource.namespace, &ar);
        match api.get(&resource.name).await {
            Ok(obj) => Ok(Some(ResourceStatus::new(
                obj.data.get("status").cloned().unwrap_or(serde_json::Value::Null),
            ))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Poll `resource` until `condition` holds or `timeout` passes.
///
/// At least one poll is issued. No poll starts after the deadline, sleeps are
/// capped to the time remaining and a hung fetch is cut off one poll interval
/// past the deadline, so a timed-out wait returns no later than
/// `timeout + poll_interval`.
#[instrument(skip(source, cancel), fields(resource = %resource, condition = %condition))]
pub async fn wait_for(
    source: &dyn StatusSource,
    resource: &ResourceRef,
    condition: Condition,
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, ReadinessError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut polls = 0u32;
    let mut last_observed = "nothing".to_string();

    let timed_out = |polls: u32, last_observed: String| ReadinessError::TimedOut {
        resource: resource.to_string(),
        condition: condition.to_string(),
        elapsed: start.elapsed(),
        polls,
        last_observed,
    };

    loop {
        if polls > 0 && Instant::now() >= deadline {
            warn!(polls, "readiness deadline passed");
            return Err(timed_out(polls, last_observed));
        }
        polls += 1;

        let fetched = tokio::select! {
            result = tokio::time::timeout_at(deadline + poll_interval, source.fetch(resource)) => result,
            _ = cancel.cancelled() => {
                return Err(ReadinessError::Cancelled { resource: resource.to_string() });
            }
        };

        let observed = match fetched {
            Ok(Ok(observed)) => observed,
            Ok(Err(e)) => {
                return Err(ReadinessError::Fetch {
                    resource: resource.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => return Err(timed_out(polls, last_observed)),
        };

        if condition.is_satisfied(observed.as_ref()) {
            let elapsed = start.elapsed();
            info!(polls, elapsed_ms = elapsed.as_millis() as u64, "condition satisfied");
            return Ok(WaitOutcome {
                polls,
                elapsed,
                status: observed.unwrap_or_default(),
            });
        }

        last_observed = match &observed {
            Some(status) => status.status.to_string(),
            None => "not found".to_string(),
        };
        debug!(polls, observed = %last_observed, "condition not yet satisfied");

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(polls, last_observed));
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
            _ = cancel.cancelled() => {
                return Err(ReadinessError::Cancelled { resource: resource.to_string() });
            }
        }
    }
}
