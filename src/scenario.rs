//! Scenario driver
//!
//! Sequences one end-to-end scenario: generate, check the generated manifests
//! against the scenario's image reference, publish the image, apply the
//! manifests and wait for the workload. Each step short-circuits the rest on
//! failure. The outcome is a [`ScenarioReport`] carrying everything needed to
//! debug the run from its output alone.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::cluster::{with_environment, ClusterProvisioner, Environment};
use crate::config::{RunOptions, ScenarioConfig};
use crate::docker::DockerClient;
use crate::generator::{clone_repo, Generator, GeneratorOutput};
use crate::image::{build_and_push, ImageBackend, PublishReport};
use crate::manifest::{apply_all, KubeApplier, ManifestSet, ObjectApplier};
use crate::readiness::{wait_for, Condition, KubeStatusSource, ResourceRef, StatusSource};
use crate::Error;

/// Steps of a scenario, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Cluster, namespace and registry provisioning
    Setup,
    /// Sample repository clone
    Clone,
    /// Generator run
    Generate,
    /// Manifest discovery and decoding
    LoadManifests,
    /// Manifest image references checked against the scenario image
    VerifyImage,
    /// Image build and push
    Publish,
    /// Manifest apply
    Apply,
    /// Workload readiness
    Readiness,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Setup => "setup",
            Step::Clone => "clone",
            Step::Generate => "generate",
            Step::LoadManifests => "load manifests",
            Step::VerifyImage => "verify image",
            Step::Publish => "publish",
            Step::Apply => "apply",
            Step::Readiness => "readiness",
        };
        f.write_str(s)
    }
}

/// Failure of a scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Step that failed
    pub step: Step,
    /// Error text
    pub message: String,
}

/// Diagnostic record of one scenario run.
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Cluster the scenario ran in
    pub cluster: Option<String>,
    /// Generator output
    pub generator: Option<GeneratorOutput>,
    /// Publish summary
    pub published: Option<PublishReport>,
    /// Manifest files applied
    pub applied: Vec<PathBuf>,
    /// One line per readiness check
    pub readiness: Vec<String>,
    /// First failure, if any
    pub failure: Option<StepFailure>,
    /// Wall time
    pub duration: Duration,
}

impl ScenarioReport {
    fn new(config: &ScenarioConfig) -> Self {
        Self {
            name: config.name().to_string(),
            image: config.image().to_string(),
            ..Default::default()
        }
    }

    /// Whether every step succeeded
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    fn fail(&mut self, step: Step, err: &Error) {
        error!(scenario = %self.name, step = %step, error = %err, "scenario step failed");
        self.failure = Some(StepFailure {
            step,
            message: err.to_string(),
        });
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "PASS" } else { "FAIL" };
        writeln!(f, "{} {} ({:.1}s)", verdict, self.name, self.duration.as_secs_f64())?;
        writeln!(f, "  image: {}", self.image)?;
        if let Some(cluster) = &self.cluster {
            writeln!(f, "  cluster: {}", cluster)?;
        }
        for path in &self.applied {
            writeln!(f, "  applied: {}", path.display())?;
        }
        for line in &self.readiness {
            writeln!(f, "  readiness: {}", line)?;
        }
        if let Some(failure) = &self.failure {
            writeln!(f, "  failed at {}: {}", failure.step, failure.message)?;
            if let Some(output) = &self.generator {
                if !output.stdout.trim().is_empty() {
                    writeln!(f, "  generator stdout:\n{}", output.stdout.trim_end())?;
                }
                if !output.stderr.trim().is_empty() {
                    writeln!(f, "  generator stderr:\n{}", output.stderr.trim_end())?;
                }
            }
        }
        Ok(())
    }
}

/// The seams a scenario talks through.
pub struct Backends<'a> {
    /// Generator under test
    pub generator: &'a Generator,
    /// Image build/push backend
    pub images: &'a dyn ImageBackend,
    /// Cluster object writer
    pub applier: &'a dyn ObjectApplier,
    /// Cluster status reader
    pub status: &'a dyn StatusSource,
}

/// Run every step after the clone inside `workdir`, recording into `report`.
pub async fn run_steps(
    config: &ScenarioConfig,
    workdir: &Path,
    backends: &Backends<'_>,
    options: &RunOptions,
    report: &mut ScenarioReport,
    cancel: &CancellationToken,
) -> std::result::Result<(), (Step, Error)> {
    let output = match backends.generator.create(config, workdir, cancel).await {
        Ok(output) => output,
        Err(e) => {
            if let Error::Generator { stdout, stderr, .. } = &e {
                report.generator = Some(GeneratorOutput {
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                });
            }
            return Err((Step::Generate, e));
        }
    };
    report.generator = Some(output);

    let manifest_dir = workdir.join(config.deploy_type().manifest_dir());
    let manifests = ManifestSet::load(&manifest_dir, config.namespace())
        .map_err(|e| (Step::LoadManifests, e))?;
    manifests
        .verify_images(config.image())
        .map_err(|e| (Step::VerifyImage, e))?;

    let published = build_and_push(backends.images, config.image(), workdir, cancel)
        .await
        .map_err(|e| (Step::Publish, e))?;
    report.published = Some(published);

    match apply_all(backends.applier, &manifests, cancel).await {
        Ok(applied) => report.applied = applied.applied,
        Err(Error::Apply(failures)) => {
            report.applied = failures.applied.clone();
            return Err((Step::Apply, Error::Apply(failures)));
        }
        Err(e) => return Err((Step::Apply, e)),
    }

    let checks = [
        (
            ResourceRef::deployment(config.namespace(), config.app_name()),
            Condition::DeploymentReady { min_ready: 1 },
        ),
        (
            ResourceRef::service(config.namespace(), config.app_name()),
            Condition::Exists,
        ),
    ];
    for (resource, condition) in checks {
        let outcome = wait_for(
            backends.status,
            &resource,
            condition,
            options.readiness_timeout,
            options.poll_interval,
            cancel,
        )
        .await
        .map_err(|e| (Step::Readiness, Error::from(e)))?;
        report.readiness.push(format!(
            "{} {} after {} poll(s)",
            resource, condition, outcome.polls
        ));
    }
    Ok(())
}

/// Clone the sample repository and run the scenario in `env`.
#[instrument(skip_all, fields(scenario = %config.name(), image = %config.image()))]
pub async fn run_scenario(
    env: &Environment,
    config: &ScenarioConfig,
    generator: &Generator,
    images: &dyn ImageBackend,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> ScenarioReport {
    let started = Instant::now();
    let mut report = ScenarioReport::new(config);
    report.cluster = Some(env.cluster().name().to_string());

    let result: std::result::Result<(), (Step, Error)> = async {
        let workdir = tempfile::tempdir().map_err(|e| (Step::Clone, Error::from(e)))?;
        clone_repo(&config.repo_url(), workdir.path(), cancel)
            .await
            .map_err(|e| (Step::Clone, e))?;

        let applier = KubeApplier::new(env.client().clone(), options.apply_strategy);
        let status = KubeStatusSource::new(env.client().clone());
        let backends = Backends {
            generator,
            images,
            applier: &applier,
            status: &status,
        };
        run_steps(config, workdir.path(), &backends, options, &mut report, cancel).await
    }
    .await;

    if let Err((step, e)) = result {
        report.fail(step, &e);
    } else {
        info!("scenario passed");
    }
    report.duration = started.elapsed();
    report
}

/// Provision an environment, run one scenario in it and tear it down.
pub async fn run_isolated(
    config: &ScenarioConfig,
    provisioner: Arc<dyn ClusterProvisioner>,
    docker: &DockerClient,
    generator: &Generator,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> ScenarioReport {
    let started = Instant::now();
    let setup = Environment::setup(provisioner, docker, options);

    // the body only borrows the environment, everything else moves in
    let (scenario, generator, images, run_options, token) = (
        config.clone(),
        generator.clone(),
        docker.clone(),
        options.clone(),
        cancel.clone(),
    );
    let result = with_environment(setup, move |env| {
        async move {
            Ok(run_scenario(env, &scenario, &generator, &images, &run_options, &token).await)
        }
        .boxed()
    })
    .await;

    match result {
        Ok(report) => report,
        Err(e) => {
            let mut report = ScenarioReport::new(config);
            report.fail(Step::Setup, &e);
            report.duration = started.elapsed();
            report
        }
    }
}

/// Reports of a suite run.
#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    /// Reports in run order
    pub reports: Vec<ScenarioReport>,
}

impl SuiteSummary {
    /// True if every scenario passed
    pub fn all_passed(&self) -> bool {
        self.reports.iter().all(ScenarioReport::passed)
    }

    /// Number of passing scenarios
    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.passed()).count()
    }
}

impl fmt::Display for SuiteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<6} {:<40} {:>9}  FAILED STEP", "RESULT", "SCENARIO", "DURATION")?;
        for report in &self.reports {
            writeln!(
                f,
                "{:<6} {:<40} {:>8.1}s  {}",
                if report.passed() { "PASS" } else { "FAIL" },
                report.name,
                report.duration.as_secs_f64(),
                report
                    .failure
                    .as_ref()
                    .map(|f| f.step.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )?;
        }
        write!(f, "{}/{} scenarios passed", self.passed(), self.reports.len())
    }
}
