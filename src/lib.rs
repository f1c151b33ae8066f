//! draft-e2e - ephemeral kind environments for end-to-end generator tests
//!
//! One scenario provisions a throwaway kind cluster wired to a host-local image
//! registry, runs the generator against a sample repository, builds and pushes
//! the generated Dockerfile's image, applies the generated manifests and waits
//! for the workload to become healthy. The cluster is torn down afterwards no
//! matter how the scenario ended.
//!
//! # Modules
//!
//! - [`cluster`] - cluster lifecycle: stale sweep, setup, guaranteed teardown
//! - [`registry`] - idempotent local registry wired into the cluster network
//! - [`image`] - image build and push with in-band error detection
//! - [`manifest`] - manifest discovery, decoding and create-or-patch apply
//! - [`readiness`] - bounded polling for resource conditions
//! - [`generator`] - the generator subprocess
//! - [`scenario`] - end-to-end sequencing and reporting
//! - [`docker`] - bollard-backed container daemon access
//! - [`kube_utils`] - kube client and namespace helpers
//! - [`config`] - scenario configuration and the derived image reference
//! - [`error`] - error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod docker;
pub mod error;
pub mod generator;
pub mod image;
pub mod kube_utils;
pub mod manifest;
pub mod readiness;
pub mod registry;
pub mod retry;
pub mod scenario;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix for generated cluster names; stale clusters carrying it are swept
pub const CLUSTER_PREFIX: &str = "draft-e2e";

/// Prefix for generated per-run namespace names
pub const NAMESPACE_PREFIX: &str = "draft-e2e-ns";

/// Name of the local registry container (one per host)
pub const REGISTRY_CONTAINER_NAME: &str = "kind-registry";

/// Image the local registry container runs
pub const REGISTRY_IMAGE: &str = "registry:2";

/// Registry port, both on the host and inside the container
pub const REGISTRY_PORT: u16 = 5000;

/// Host address the registry port is bound to
pub const REGISTRY_HOST_IP: &str = "127.0.0.1";

/// Registry coordinates as seen from the host and, via node aliasing, from pods
pub const DEFAULT_REGISTRY_HOST: &str = "localhost:5000";

/// Docker network kind attaches cluster nodes to
pub const KIND_NETWORK_NAME: &str = "kind";

/// Environment variable naming the generator binary
pub const GENERATOR_BIN_ENV: &str = "DRAFT_E2E_BIN";

/// Generator path used when [`GENERATOR_BIN_ENV`] is unset (local development)
pub const DEFAULT_GENERATOR_PATH: &str = "/workspaces/draft/draft";

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "draft-e2e";
