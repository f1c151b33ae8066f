//! The generator subprocess
//!
//! The generator is the CLI under test. It is run inside the sample
//! repository's working directory and is expected to leave a `Dockerfile` and
//! a directory of manifests behind. Everything it prints is captured so a
//! failure report can include it verbatim.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::ScenarioConfig;
use crate::{Error, Result, DEFAULT_GENERATOR_PATH, GENERATOR_BIN_ENV};

/// Build descriptor the generator writes and the publisher builds from
pub const BUILD_DESCRIPTOR: &str = "Dockerfile";

/// Captured output of a successful generator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

/// Handle on the generator binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    bin: PathBuf,
}

impl Generator {
    /// Use an explicit binary path
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Resolve the binary from [`GENERATOR_BIN_ENV`], falling back to
    /// [`DEFAULT_GENERATOR_PATH`] for local development.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(GENERATOR_BIN_ENV).ok())
    }

    fn from_env_value(value: Option<String>) -> Self {
        match value.filter(|v| !v.trim().is_empty()) {
            Some(path) => Self::new(path),
            None => {
                warn!(
                    env = GENERATOR_BIN_ENV,
                    default = DEFAULT_GENERATOR_PATH,
                    "generator path not set, using default"
                );
                Self::new(DEFAULT_GENERATOR_PATH)
            }
        }
    }

    /// Path of the binary
    pub fn bin(&self) -> &Path {
        &self.bin
    }

    /// Arguments for a `create` run of `config`.
    ///
    /// `--skip-file-detection` makes the generator overwrite files the sample
    /// repository already ships (an existing Dockerfile, for instance).
    pub fn create_args(config: &ScenarioConfig) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            "create".to_string(),
            "-l".to_string(),
            config.language().to_string(),
            "--deploy-type".to_string(),
            config.deploy_type().as_arg().to_string(),
            "--skip-file-detection".to_string(),
        ];
        for (key, value) in config.generator_variables() {
            args.push("--variable".to_string());
            args.push(format!("{}={}", key, value));
        }
        args
    }

    /// Run `create` for `config` inside `workdir`.
    #[instrument(skip(self, config, cancel), fields(bin = %self.bin.display(), scenario = %config.name()))]
    pub async fn create(
        &self,
        config: &ScenarioConfig,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<GeneratorOutput> {
        self.run(&Self::create_args(config), workdir, cancel).await
    }

    /// Run the generator with arbitrary arguments inside `workdir`.
    ///
    /// A non-zero exit is an error carrying both captured streams.
    pub async fn run(
        &self,
        args: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<GeneratorOutput> {
        info!(args = ?args, workdir = %workdir.display(), "running generator");

        let child = Command::new(&self.bin)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::setup(
                    "spawn generator",
                    format!("{}: {}", self.bin.display(), e),
                )
            })?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled("generator")),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(Error::generator(output.status, &output.stdout, &output.stderr));
        }

        let result = GeneratorOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        info!(stdout_bytes = result.stdout.len(), "generator finished");
        Ok(result)
    }
}

/// Clone `repo_url` into `dir`.
pub async fn clone_repo(repo_url: &str, dir: &Path, cancel: &CancellationToken) -> Result<()> {
    info!(repo = %repo_url, dir = %dir.display(), "cloning sample repository");

    let child = Command::new("git")
        .args(["clone", "--depth", "1", repo_url, "."])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::cancelled("git clone")),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(Error::setup(
            "git clone",
            format!(
                "{}: {}",
                repo_url,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}
