use std::path::Path;
use std::process::{Command, Stdio};

use agent_gateway_error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Missing,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Missing => "missing",
        }
    }
}

/// Lifecycle control for the Agent's execution container.
///
/// Shells out to the container runtime; every call runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct SandboxControl {
    container: String,
    image: String,
}

impl SandboxControl {
    pub fn new(container: String, image: String) -> Self {
        Self { container, image }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub async fn state(&self) -> Result<ContainerState, GatewayError> {
        let container = self.container.clone();
        tokio::task::spawn_blocking(move || query_state(&container))
            .await
            .map_err(join_err)?
    }

    /// Idempotent: no-op when running, starts when stopped, creates when
    /// missing.
    pub async fn ensure_running(&self) -> Result<(), GatewayError> {
        let control = self.clone();
        tokio::task::spawn_blocking(move || {
            match query_state(&control.container)? {
                ContainerState::Running => Ok(()),
                ContainerState::Stopped => {
                    run_docker(&["start", &control.container])?;
                    Ok(())
                }
                ContainerState::Missing => {
                    run_docker(&[
                        "run",
                        "-d",
                        "--name",
                        &control.container,
                        &control.image,
                        "sleep",
                        "infinity",
                    ])?;
                    Ok(())
                }
            }
        })
        .await
        .map_err(join_err)?
    }

    /// Seconds since the container started, when running.
    pub async fn uptime_seconds(&self) -> Option<u64> {
        let container = self.container.clone();
        let started = tokio::task::spawn_blocking(move || {
            let output = Command::new("docker")
                .args(["inspect", "-f", "{{.State.StartedAt}}", &container])
                .stderr(Stdio::null())
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            String::from_utf8(output.stdout)
                .ok()
                .map(|s| s.trim().to_string())
        })
        .await
        .ok()??;
        let started = time::OffsetDateTime::parse(
            &started,
            &time::format_description::well_known::Rfc3339,
        )
        .ok()?;
        let age = time::OffsetDateTime::now_utc() - started;
        (age.whole_seconds() >= 0).then(|| age.whole_seconds() as u64)
    }
}

fn query_state(container: &str) -> Result<ContainerState, GatewayError> {
    let output = Command::new("docker")
        .args(["inspect", "-f", "{{.State.Running}}", container])
        .stderr(Stdio::null())
        .output()
        .map_err(|err| GatewayError::Sandbox {
            message: format!("container runtime unavailable: {err}"),
        })?;
    if !output.status.success() {
        return Ok(ContainerState::Missing);
    }
    match String::from_utf8_lossy(&output.stdout).trim() {
        "true" => Ok(ContainerState::Running),
        _ => Ok(ContainerState::Stopped),
    }
}

fn run_docker(args: &[&str]) -> Result<(), GatewayError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .map_err(|err| GatewayError::Sandbox {
            message: format!("container runtime unavailable: {err}"),
        })?;
    if !output.status.success() {
        return Err(GatewayError::Sandbox {
            message: format!(
                "docker {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

fn join_err(err: tokio::task::JoinError) -> GatewayError {
    GatewayError::Internal {
        message: format!("blocking task failed: {err}"),
    }
}

/// Writes the default wrapper script when the operator has not supplied one.
/// The wrapper execs the Agent CLI inside the sandbox, piping stdio.
pub fn install_default_wrapper(path: &Path, container: &str) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let script = format!(
        "#!/bin/sh\nexec docker exec -i {container} claude \\\n    --print --verbose \\\n    --input-format stream-json \\\n    --output-format stream-json \\\n    --permission-prompt-tool stdio \"$@\"\n"
    );
    std::fs::write(path, script)?;
    set_executable(path)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
