//! Error types for the e2e orchestrator
//!
//! Variants follow the lifecycle of a scenario: setup, publish, apply,
//! readiness. Each carries the identity of the external call that failed and
//! the raw message from the backend so a failed run can be debugged from its
//! logs alone.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::readiness::ReadinessError;

/// Stage of the build/push pipeline that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    /// Packaging the build context directory
    Archive,
    /// The build request was rejected before any progress was streamed
    BuildStart,
    /// The build stream reported an in-band error record
    Build,
    /// The push request was rejected before any progress was streamed
    PushStart,
    /// The push stream reported an in-band error record
    Push,
}

impl fmt::Display for PublishStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishStage::Archive => "archiving build context",
            PublishStage::BuildStart => "starting image build",
            PublishStage::Build => "building image",
            PublishStage::PushStart => "starting image push",
            PublishStage::Push => "pushing image",
        };
        f.write_str(s)
    }
}

/// A single manifest file that failed to decode or apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFailure {
    /// The offending file
    pub path: PathBuf,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for ManifestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Aggregate of every manifest failure from one walk of a manifest directory.
///
/// Files that did apply are kept alongside so the report shows the full picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyFailures {
    /// Files that failed, in walk order
    pub failures: Vec<ManifestFailure>,
    /// Files that applied successfully
    pub applied: Vec<PathBuf>,
}

impl fmt::Display for ApplyFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} manifest(s) failed ({} applied)",
            self.failures.len(),
            self.applied.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

/// Main error type for scenario runs
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Container daemon error outside of a publish stage
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error in a scenario file
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Cluster or registry provisioning failed
    #[error("setup error [{context}]: {message}")]
    Setup {
        /// External call that failed (e.g., "kind create cluster", "registry network join")
        context: String,
        /// Raw backend message
        message: String,
    },

    /// The generator subprocess exited unsuccessfully
    #[error("generator failed ({status}): stderr: {stderr}")]
    Generator {
        /// Exit status description
        status: String,
        /// Captured stdout
        stdout: String,
        /// Captured stderr
        stderr: String,
    },

    /// Image build or push failed
    #[error("{stage} for {image}: {message}")]
    Publish {
        /// First point of failure
        stage: PublishStage,
        /// Image reference being published
        image: String,
        /// Raw backend message
        message: String,
    },

    /// A manifest declares an image other than the scenario's image reference
    #[error("image mismatch in {path}: expected {expected}, found {found}")]
    ImageMismatch {
        /// The scenario's derived image reference
        expected: String,
        /// The image declared in the manifest
        found: String,
        /// Manifest file declaring it
        path: PathBuf,
    },

    /// One or more manifests failed to decode or apply
    #[error("apply error: {0}")]
    Apply(ApplyFailures),

    /// Readiness wait failed
    #[error("readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// The run was cancelled
    #[error("cancelled during {step}")]
    Cancelled {
        /// Step that observed the cancellation
        step: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a setup error for the given external call
    pub fn setup(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Setup {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a publish error for the given stage
    pub fn publish(stage: PublishStage, image: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            stage,
            image: image.into(),
            message: message.into(),
        }
    }

    /// Create a generator error from the process outcome
    pub fn generator(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Self {
        Self::Generator {
            status: status.to_string(),
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }

    /// Create a cancellation error for the given step
    pub fn cancelled(step: impl Into<String>) -> Self {
        Self::Cancelled { step: step.into() }
    }

    /// The publish stage, if this is a publish error
    pub fn publish_stage(&self) -> Option<PublishStage> {
        match self {
            Self::Publish { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_error_names_stage_and_image() {
        let err = Error::publish(
            PublishStage::Build,
            "localhost:5000/app:latest",
            "COPY failed",
        );
        assert_eq!(
            err.to_string(),
            "building image for localhost:5000/app:latest: COPY failed"
        );
        assert_eq!(err.publish_stage(), Some(PublishStage::Build));
    }

    #[test]
    fn apply_failures_list_every_file() {
        let failures = ApplyFailures {
            failures: vec![ManifestFailure {
                path: PathBuf::from("manifests/broken.yaml"),
                message: "missing kind".to_string(),
            }],
            applied: vec![
                PathBuf::from("manifests/deployment.yaml"),
                PathBuf::from("manifests/service.yaml"),
            ],
        };
        let msg = Error::Apply(failures).to_string();
        assert!(msg.contains("1 manifest(s) failed (2 applied)"));
        assert!(msg.contains("manifests/broken.yaml: missing kind"));
    }

    #[test]
    fn setup_error_carries_context() {
        let err = Error::setup("kind create cluster", "exit status 1");
        assert_eq!(
            err.to_string(),
            "setup error [kind create cluster]: exit status 1"
        );
        assert_eq!(err.publish_stage(), None);
    }
}
