//! Container daemon access through bollard
//!
//! [`DockerClient`] implements both container seams: [`ContainerRuntime`] for
//! the registry connector and [`ImageBackend`] for the image publisher.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions};
use bollard::models::{
    BuildInfo, CreateImageInfo, EndpointSettings, HostConfig, PortBinding, PushImageInfo,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info};

use crate::config::ImageRef;
use crate::image::{ErrorDetail, ImageBackend, ProgressLine, ProgressStream};
use crate::registry::{ContainerRuntime, ContainerState, CreateOutcome, RegistrySpec};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Handle on the local container daemon
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect with the local defaults (socket or `DOCKER_HOST`) and ping
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::setup("connect docker", e.to_string()))?;
        retry_with_backoff(&RetryConfig::default(), "docker ping", || {
            let docker = docker.clone();
            async move { docker.ping().await }
        })
        .await
        .map_err(|e| Error::setup("ping docker", e.to_string()))?;
        debug!("connected to container daemon");
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// A connect refused because the endpoint is already on the network.
///
/// Older daemons answer 403, newer ones 409.
fn already_connected(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 403 | 409,
            message,
        } => message.contains("already exists"),
        _ => false,
    }
}

fn build_line(info: BuildInfo) -> ProgressLine {
    ProgressLine {
        error: info.error,
        error_detail: info.error_detail.map(|d| ErrorDetail { message: d.message }),
        stream: info.stream,
        status: info.status,
    }
}

fn push_line(info: PushImageInfo) -> ProgressLine {
    ProgressLine {
        error: info.error,
        status: info.status,
        ..Default::default()
    }
}

fn pull_line(info: CreateImageInfo) -> ProgressLine {
    ProgressLine {
        error: info.error,
        status: info.status,
        ..Default::default()
    }
}

/// Map one stream item; daemon-reported stream errors become in-band records
fn progress_item<T>(
    item: std::result::Result<T, BollardError>,
    convert: fn(T) -> ProgressLine,
) -> Result<ProgressLine> {
    match item {
        Ok(record) => Ok(convert(record)),
        Err(BollardError::DockerStreamError { error }) => Ok(ProgressLine::error(error)),
        Err(e) => Err(Error::Docker(e)),
    }
}

/// In-memory tar holding a single file
fn single_file_tar(file_name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, contents)?;
    builder.into_inner()
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerState>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => {
                let running = resp
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                let networks = resp
                    .network_settings
                    .and_then(|n| n.networks)
                    .map(|n| n.into_keys().collect())
                    .unwrap_or_default();
                Ok(Some(ContainerState {
                    id: resp.id.unwrap_or_default(),
                    running,
                    networks,
                }))
            }
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(Error::setup("inspect container", format!("{}: {}", name, e))),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image = %image, "pulling image");
        let records = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        futures::pin_mut!(records);
        while let Some(item) = records.next().await {
            let line = progress_item(item, pull_line)
                .map_err(|e| Error::setup("pull image", format!("{}: {}", image, e)))?;
            if let Some(message) = line.error_message() {
                return Err(Error::setup("pull image", format!("{}: {}", image, message)));
            }
        }
        Ok(())
    }

    async fn create_registry(&self, spec: &RegistrySpec) -> Result<CreateOutcome> {
        let port = format!("{}/tcp", spec.container_port);
        let config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(HashMap::from([(port.clone(), HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(
                    port,
                    Some(vec![PortBinding {
                        host_ip: Some(spec.host_ip.clone()),
                        host_port: Some(spec.host_port.to_string()),
                    }]),
                )])),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ALWAYS),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.container_name.clone(),
            ..Default::default()
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(resp) => {
                debug!(id = %resp.id, "registry container created");
                Ok(CreateOutcome::Created)
            }
            Err(e) if status_code(&e) == Some(409) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(Error::setup(
                "create registry container",
                format!("{}: {}", spec.container_name, e),
            )),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(Error::setup("start container", format!("{}: {}", name, e))),
        }
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        match self
            .docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings::default(),
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_connected(&e) => {
                debug!(network = %network, container = %container, "already connected");
                Ok(())
            }
            Err(e) => Err(Error::Docker(e)),
        }
    }

    async fn exec(&self, container: &str, cmd: Vec<String>) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(cmd.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut captured = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                captured.push_str(&chunk?.to_string());
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        match inspected.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(Error::setup(
                "container exec",
                format!("{} in {} exited {}: {}", cmd.join(" "), container, code, captured.trim()),
            )),
        }
    }

    async fn upload_file(
        &self,
        container: &str,
        dir: &str,
        file_name: &str,
        contents: Vec<u8>,
    ) -> Result<()> {
        let archive = single_file_tar(file_name, &contents)?;
        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await?;
        Ok(())
    }
}

impl ImageBackend for DockerClient {
    fn build(&self, context: Bytes, descriptor: &str, image: &ImageRef) -> ProgressStream {
        let options = BuildImageOptions {
            dockerfile: descriptor.to_string(),
            t: image.to_string(),
            rm: true,
            ..Default::default()
        };
        let docker = self.docker.clone();
        Box::pin(async_stream::stream! {
            let records = docker.build_image(options, None, Some(context));
            futures::pin_mut!(records);
            while let Some(item) = records.next().await {
                yield progress_item(item, build_line);
            }
        })
    }

    fn push(&self, image: &ImageRef) -> ProgressStream {
        // no credentials: the local registry is anonymous
        let options = PushImageOptions {
            tag: image.tag().to_string(),
        };
        let name = image.name();
        let docker = self.docker.clone();
        Box::pin(async_stream::stream! {
            let records = docker.push_image(&name, Some(options), None);
            futures::pin_mut!(records);
            while let Some(item) = records.next().await {
                yield progress_item(item, push_line);
            }
        })
    }
}
