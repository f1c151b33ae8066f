//! [`ClusterProvisioner`] backed by the `kind` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::ClusterProvisioner;
use crate::{Error, Result};

/// Node image clusters are created with unless overridden
pub const DEFAULT_NODE_IMAGE: &str =
    "kindest/node:v1.28.7@sha256:9bc6c451a289cf96ad0bbaf33d416901de6fd632415b076ab05f5fa7e4f65c58";

/// Cluster config used when none is supplied.
///
/// containerd reads per-registry `hosts.toml` files from `config_path`, which
/// is how nodes resolve `localhost:5000` to the registry container.
pub const DEFAULT_KIND_CONFIG: &str = r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
containerdConfigPatches:
- |-
  [plugins."io.containerd.grpc.v1.cri".registry]
    config_path = "/etc/containerd/certs.d"
"#;

/// Wait passed to `kind create cluster` for the control plane
const CREATE_WAIT: &str = "120s";

/// The `kind` binary
#[derive(Debug, Clone)]
pub struct KindCli {
    bin: PathBuf,
}

impl Default for KindCli {
    fn default() -> Self {
        Self::new("kind")
    }
}

impl KindCli {
    /// Use a specific `kind` binary
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let context = format!("kind {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" "));
        debug!(args = ?args, "running kind");

        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::setup(context.clone(), format!("{}: {}", self.bin.display(), e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::setup(
                context,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Non-empty trimmed lines of CLI output
fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::validation(format!("non UTF-8 path: {}", path.display())))
}

#[async_trait]
impl ClusterProvisioner for KindCli {
    async fn list_clusters(&self) -> Result<Vec<String>> {
        // "No kind clusters found." goes to stderr, stdout stays empty
        Ok(lines(&self.run(&["get", "clusters"], None).await?))
    }

    async fn export_kubeconfig(&self, name: &str, kubeconfig: &Path) -> Result<()> {
        self.run(
            &["export", "kubeconfig", "--name", name, "--kubeconfig", path_arg(kubeconfig)?],
            None,
        )
        .await?;
        Ok(())
    }

    async fn create_cluster(
        &self,
        name: &str,
        config: &str,
        node_image: &str,
        kubeconfig: &Path,
    ) -> Result<()> {
        self.run(
            &[
                "create",
                "cluster",
                "--name",
                name,
                "--config",
                "-",
                "--image",
                node_image,
                "--kubeconfig",
                path_arg(kubeconfig)?,
                "--wait",
                CREATE_WAIT,
            ],
            Some(config),
        )
        .await?;
        Ok(())
    }

    async fn delete_cluster(&self, name: &str, kubeconfig: &Path) -> Result<()> {
        self.run(
            &["delete", "cluster", "--name", name, "--kubeconfig", path_arg(kubeconfig)?],
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_nodes(&self, name: &str) -> Result<Vec<String>> {
        Ok(lines(&self.run(&["get", "nodes", "--name", name], None).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_containerd_config_path() {
        assert!(DEFAULT_KIND_CONFIG.contains("config_path = \"/etc/containerd/certs.d\""));
        assert!(DEFAULT_NODE_IMAGE.starts_with("kindest/node:v1.28.7"));
    }

    #[test]
    fn output_lines_skip_blanks() {
        assert_eq!(
            lines("draft-e2e-abc123\n\n  other \n"),
            vec!["draft-e2e-abc123", "other"]
        );
        assert!(lines("").is_empty());
    }

    /// Fake kind that records its arguments and stdin, then prints `stdout`
    #[cfg(unix)]
    fn fake_kind(dir: &Path, stdout: &str, exit: i32) -> KindCli {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("kind");
        let script = format!(
            "#!/bin/sh\necho \"$@\" > {args}\nif [ \"$4\" = \"-\" ] || [ \"$6\" = \"-\" ]; then cat > {stdin}; fi\nprintf '{stdout}'\necho 'kind says no' >&2\nexit {exit}\n",
            args = dir.join("args").display(),
            stdin = dir.join("stdin").display(),
        );
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        KindCli::new(bin)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lists_clusters_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let kind = fake_kind(dir.path(), "draft-e2e-aaaaaa\\nkind\\n", 0);
        assert_eq!(
            kind.list_clusters().await.unwrap(),
            vec!["draft-e2e-aaaaaa", "kind"]
        );
        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert_eq!(args.trim(), "get clusters");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn create_pipes_config_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let kind = fake_kind(dir.path(), "", 0);
        let kubeconfig = dir.path().join("kubeconfig");
        kind.create_cluster("draft-e2e-bbbbbb", DEFAULT_KIND_CONFIG, DEFAULT_NODE_IMAGE, &kubeconfig)
            .await
            .unwrap();

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("create cluster --name draft-e2e-bbbbbb --config -"));
        assert!(args.contains(&format!("--kubeconfig {}", kubeconfig.display())));
        let stdin = std::fs::read_to_string(dir.path().join("stdin")).unwrap();
        assert_eq!(stdin, DEFAULT_KIND_CONFIG);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_carries_command_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let kind = fake_kind(dir.path(), "", 1);
        let err = kind
            .delete_cluster("draft-e2e-cccccc", &dir.path().join("kubeconfig"))
            .await
            .unwrap_err();
        match err {
            Error::Setup { context, message } => {
                assert_eq!(context, "kind delete cluster");
                assert!(message.contains("kind says no"));
            }
            other => panic!("expected setup error, got {other:?}"),
        }
    }
}
