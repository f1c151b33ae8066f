//! Scenario configuration
//!
//! A [`ScenarioConfig`] is built once per scenario and never mutated. The image
//! reference is derived here and only here; the generator variables, the
//! build tag, the push target and the manifest check all read it from the
//! config instead of formatting their own.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_REGISTRY_HOST};

/// Default image tag for published scenario images
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Default language runtime version passed to the generator
pub const DEFAULT_RUNTIME_VERSION: &str = "1.22";
/// Default readiness deadline for the scenario workload
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);
/// Default cadence for readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fully-qualified image reference: `registry/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: String,
}

impl ImageRef {
    /// Build a reference from its parts
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// `registry/repository` without the tag (what a push addresses)
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag component
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The registry host component
    pub fn registry(&self) -> &str {
        &self.registry
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Which kind of deployment artifacts the generator is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeployType {
    /// Plain manifests under `manifests/`
    Manifests,
    /// Kustomize base under `base/`
    Kustomize,
}

impl DeployType {
    /// Value of the generator's `--deploy-type` flag
    pub fn as_arg(&self) -> &'static str {
        match self {
            DeployType::Manifests => "manifests",
            DeployType::Kustomize => "kustomize",
        }
    }

    /// Directory (relative to the working directory) holding the generated objects
    pub fn manifest_dir(&self) -> &'static Path {
        match self {
            DeployType::Manifests => Path::new("manifests"),
            DeployType::Kustomize => Path::new("base"),
        }
    }
}

impl fmt::Display for DeployType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// How manifest documents are written to the cluster.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStrategy {
    /// Server-side apply of the raw document; works for any kind
    #[default]
    ServerSide,
    /// Decode into a known typed object and create-or-patch it
    Typed,
}

/// Declarative description of a scenario, as written in a scenario file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    /// Generator language tag (e.g., "gomodule")
    pub language: String,
    /// Container port the application listens on
    pub port: u16,
    /// Application name; also the Deployment and Service name
    pub app_name: String,
    /// Namespace the generated manifests target
    pub namespace: String,
    /// Deploy artifact type
    #[serde(default = "default_deploy_type")]
    pub deploy_type: DeployType,
    /// Sample repository as `owner/name` on GitHub
    pub repo: String,
    /// Language runtime version passed to the generator
    #[serde(default = "default_runtime_version")]
    pub version: String,
    /// Image tag to publish
    #[serde(default = "default_image_tag")]
    pub image_tag: String,
}

fn default_deploy_type() -> DeployType {
    DeployType::Manifests
}

fn default_runtime_version() -> String {
    DEFAULT_RUNTIME_VERSION.to_string()
}

fn default_image_tag() -> String {
    DEFAULT_IMAGE_TAG.to_string()
}

/// Immutable record describing one scenario run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    name: String,
    spec: ScenarioSpec,
    image: ImageRef,
}

impl ScenarioConfig {
    /// Validate a spec and derive the image reference against the local registry
    pub fn new(spec: ScenarioSpec) -> Result<Self> {
        Self::with_registry(spec, DEFAULT_REGISTRY_HOST)
    }

    /// Validate a spec and derive the image reference against `registry`
    pub fn with_registry(spec: ScenarioSpec, registry: &str) -> Result<Self> {
        validate_dns_label("appName", &spec.app_name)?;
        validate_dns_label("namespace", &spec.namespace)?;
        if spec.language.trim().is_empty() {
            return Err(Error::validation("language must not be empty"));
        }
        if spec.port == 0 {
            return Err(Error::validation("port must be non-zero"));
        }
        if !spec.repo.contains('/') {
            return Err(Error::validation(format!(
                "repo '{}' must be of the form owner/name",
                spec.repo
            )));
        }

        let repository = format!("{}-{}-{}", spec.deploy_type, spec.language, spec.port);
        let image = ImageRef::new(registry, repository, spec.image_tag.clone());
        let name = format!("{}/{}/{}", spec.deploy_type, spec.language, spec.app_name);

        Ok(Self { name, spec, image })
    }

    /// Human-readable scenario name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The single image reference used for build, push and manifests
    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    /// Generator language tag
    pub fn language(&self) -> &str {
        &self.spec.language
    }

    /// Application port
    pub fn port(&self) -> u16 {
        self.spec.port
    }

    /// Application name
    pub fn app_name(&self) -> &str {
        &self.spec.app_name
    }

    /// Target namespace of the generated manifests
    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    /// Deploy artifact type
    pub fn deploy_type(&self) -> DeployType {
        self.spec.deploy_type
    }

    /// Sample repository (`owner/name`)
    pub fn repo(&self) -> &str {
        &self.spec.repo
    }

    /// Clone URL of the sample repository
    pub fn repo_url(&self) -> String {
        format!("https://github.com/{}", self.spec.repo)
    }

    /// Template variables for the generator, in flag order
    pub fn generator_variables(&self) -> Vec<(&'static str, String)> {
        let port = self.spec.port.to_string();
        vec![
            ("PORT", port.clone()),
            ("SERVICEPORT", port),
            ("VERSION", self.spec.version.clone()),
            ("NAMESPACE", self.spec.namespace.clone()),
            ("APPNAME", self.spec.app_name.clone()),
            ("IMAGENAME", self.image.name()),
            ("IMAGETAG", self.image.tag().to_string()),
        ]
    }
}

/// Knobs that apply to every scenario in a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Prefix for generated cluster names; also the stale-sweep selector
    pub cluster_prefix: String,
    /// kind cluster config file; `None` uses the built-in config
    pub kind_config: Option<PathBuf>,
    /// kind node image
    pub node_image: String,
    /// Apply strategy for manifests
    pub apply_strategy: ApplyStrategy,
    /// Readiness deadline for the scenario workload
    pub readiness_timeout: Duration,
    /// Cadence for readiness polls
    pub poll_interval: Duration,
    /// Leave the cluster running after the scenario (debugging)
    pub keep_cluster: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cluster_prefix: crate::CLUSTER_PREFIX.to_string(),
            kind_config: None,
            node_image: crate::cluster::DEFAULT_NODE_IMAGE.to_string(),
            apply_strategy: ApplyStrategy::default(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            keep_cluster: false,
        }
    }
}

/// Scenario file: a list of scenarios run one after another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    /// Scenarios in run order
    pub scenarios: Vec<ScenarioSpec>,
}

impl ScenarioFile {
    /// Read and validate a scenario file
    pub fn load(path: &Path) -> Result<Vec<ScenarioConfig>> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate scenario file content
    pub fn parse(content: &str) -> Result<Vec<ScenarioConfig>> {
        let file: ScenarioFile = serde_yaml::from_str(content)?;
        if file.scenarios.is_empty() {
            return Err(Error::validation("scenario file lists no scenarios"));
        }
        file.scenarios.into_iter().map(ScenarioConfig::new).collect()
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, <= 63 chars
fn validate_dns_label(field: &str, value: &str) -> Result<()> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = !value.starts_with('-') && !value.ends_with('-');
    if value.is_empty() || value.len() > 63 || !valid_chars || !valid_ends {
        return Err(Error::validation(format!(
            "{} '{}' is not a valid DNS-1123 label",
            field, value
        )));
    }
    Ok(())
}

/// The go sample app used across unit tests
#[cfg(test)]
pub(crate) fn go_spec() -> ScenarioSpec {
    ScenarioSpec {
        language: "gomodule".to_string(),
        port: 8080,
        app_name: "go-app".to_string(),
        namespace: "go-ns".to_string(),
        deploy_type: DeployType::Manifests,
        repo: "gambtho/go_echo".to_string(),
        version: DEFAULT_RUNTIME_VERSION.to_string(),
        image_tag: DEFAULT_IMAGE_TAG.to_string(),
    }
}
