use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Output;
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::error::{ExecError, Result};

/// Container ids are shown and addressed by their first 12 characters.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub external: u16,
    pub internal: u16,
}

/// Everything `docker run` needs to start a detached container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSpec {
    pub image: String,
    /// Container name, so a start that never reported its id can still be removed.
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
    /// Allocate a tty, keeps shells and `tail` style keep-alives running.
    pub tty: bool,
}

impl RunSpec {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if self.tty {
            args.push("-t".into());
        }
        if let Some(name) = &self.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        for p in &self.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", p.external, p.internal));
        }
        for (k, v) in &self.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(ep) = &self.entrypoint {
            args.push("--entrypoint".into());
            args.push(ep.clone());
        }
        args.push(self.image.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts a detached container and returns its id.
    async fn start(&self, spec: &RunSpec) -> Result<String>;
    /// Runs `command` in a running container and returns its stdout.
    async fn exec(&self, container: &str, command: &[String]) -> Result<String>;
    /// Stops a container. Stopping one that is already gone is not an error.
    async fn stop(&self, container: &str) -> Result<()>;
    async fn kill(&self, container: &str) -> Result<()>;
    /// Force-removes a container by full id or name; a missing one is not an error.
    async fn remove(&self, container: &str) -> Result<()>;
    async fn is_running(&self, container: &str) -> Result<bool>;
}

/// [`ContainerRuntime`] backed by the docker command line.
#[derive(Clone, Debug)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(crate::config::DOCKER_BINARY)
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> std::io::Result<Output> {
        if which::which(&self.binary).is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found in PATH", self.binary),
            ));
        }
        debug!(binary = %self.binary, ?args, "running container runtime");
        // a deadline dropping this future must not leave the client running
        TokioCommand::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }

    /// Runs a stop-like subcommand, tolerating containers that are already down.
    async fn halt(&self, verb: &[&str], id: &str) -> Result<()> {
        let mut args: Vec<String> = verb.iter().map(|v| v.to_string()).collect();
        args.push(id.to_string());
        let verb = verb.join(" ");
        let out = self
            .docker(&args)
            .await
            .map_err(|e| ExecError::Invocation(format!("docker {} {}: {}", verb, id, e)))?;
        if out.status.success() {
            info!(container = id, "{} container", verb);
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if is_gone(&stderr) {
            debug!(container = id, "container already stopped: {}", stderr.trim());
            return Ok(());
        }
        Err(ExecError::Invocation(format!(
            "docker {} {} failed: {}",
            verb,
            id,
            stderr.trim()
        )))
    }
}

fn is_gone(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("is not running")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &RunSpec) -> Result<String> {
        let out = self
            .docker(&spec.to_args())
            .await
            .map_err(|e| ExecError::ContainerStart(e.to_string()))?;
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !out.status.success() || id.is_empty() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            // docker may have created the container before failing to bind its ports
            if !id.is_empty() {
                let rm = ["rm".to_string(), "-f".to_string(), id.clone()];
                if let Err(e) = self.docker(&rm).await {
                    warn!(container = short_id(&id), "failed to remove half-started container: {}", e);
                }
            }
            return Err(ExecError::ContainerStart(if stderr.is_empty() {
                format!("docker run exited with {}", out.status)
            } else {
                stderr
            }));
        }
        info!(container = short_id(&id), image = %spec.image, "started container");
        Ok(id)
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<String> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());
        let out = self
            .docker(&args)
            .await
            .map_err(|e| ExecError::Invocation(e.to_string()))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(ExecError::Invocation(if stderr.is_empty() {
                format!("command exited with {}", out.status)
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.halt(&["stop"], short_id(container)).await
    }

    async fn kill(&self, container: &str) -> Result<()> {
        self.halt(&["kill"], short_id(container)).await
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.halt(&["rm", "-f"], container).await
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            container.to_string(),
        ];
        let out = self
            .docker(&args)
            .await
            .map_err(|e| ExecError::Invocation(e.to_string()))?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_run_args_with_ports_env_and_entrypoint() {
        let spec = RunSpec {
            image: "acme/svc:1".into(),
            env: [("TOKEN".to_string(), "a b".to_string())].into(),
            ports: vec![
                PortMapping { external: 4444, internal: 5000 },
                PortMapping { external: 4445, internal: 6000 },
            ],
            entrypoint: Some("node".into()),
            args: vec!["app.js".into()],
            tty: false,
            name: Some("omg-test".into()),
        };
        assert_eq!(
            spec.to_args(),
            vec![
                "run", "-d", "--name", "omg-test", "-p", "4444:5000", "-p", "4445:6000", "-e", "TOKEN=a b",
                "--entrypoint", "node", "acme/svc:1", "app.js"
            ]
        );
    }

    #[test]
    fn test_keep_alive_run_args() {
        let spec = RunSpec {
            image: "alpine".into(),
            args: vec!["tail".into(), "-f".into(), "/dev/null".into()],
            tty: true,
            ..Default::default()
        };
        assert_eq!(spec.to_args(), vec!["run", "-d", "-t", "alpine", "tail", "-f", "/dev/null"]);
    }

    #[test]
    fn test_gone_containers_are_recognised() {
        assert!(is_gone("Error response from daemon: No such container: 0123"));
        assert!(is_gone("Error response from daemon: Container 0123 is not running"));
        assert!(!is_gone("permission denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stopping_twice_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let calls = dir.path().join("calls");
        let body = format!(
            "echo \"$@\" >> {}\necho 'Error response from daemon: No such container: 0123456789ab' >&2\nexit 1\n",
            calls.display()
        );
        let docker = DockerCli::new(crate::testing::stub_binary(&dir, &body).to_string_lossy());

        let id = "0123456789abcdef0123456789abcdef";
        docker.stop(id).await.unwrap();
        docker.stop(id).await.unwrap();
        docker.remove(id).await.unwrap();

        let seen = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(seen.lines().collect::<Vec<_>>(), vec![
            "stop 0123456789ab",
            "stop 0123456789ab",
            "rm -f 0123456789abcdef0123456789abcdef",
        ]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_surfaces_other_daemon_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let docker = DockerCli::new(
            crate::testing::stub_binary(&dir, "echo 'permission denied' >&2\nexit 1\n").to_string_lossy(),
        );
        let err = docker.stop("abc").await.unwrap_err();
        assert_eq!(err.to_string(), "docker stop abc failed: permission denied");
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start_as_container_start() {
        let docker = DockerCli::new("definitely-not-a-container-runtime");
        let err = docker.start(&RunSpec::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::ContainerStart(ref m) if m.contains("not found in PATH")));
    }
}
