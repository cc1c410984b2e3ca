use async_trait::async_trait;
use serde_json::Value;
use shell_escape::escape;
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Escape a string for safe use in shell commands
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(s))
}

/// Errors from the container runtime, normalised so callers can map them
/// onto tunnel lifecycle decisions without parsing podman's stderr.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime binary is missing or cannot be spoken to at all
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// The target container does not exist
    #[error("container not found: {0}")]
    NotFound(String),
    /// Anything else; callers retry on their next tick
    #[error("transient runtime failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    pub source: String,
    pub destination: String,
}

/// Container record normalised from `podman ps`/`podman inspect` output.
#[derive(Debug, Clone, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub created_at: String,
    pub ports: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Only populated from `inspect`; `ps` output carries no mount sources.
    pub mounts: Vec<Mount>,
}

impl ContainerRecord {
    /// Normalise one entry of `podman ps --format json`.
    pub fn from_ps_json(v: &Value) -> Self {
        let labels = v["Labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, val)| val.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let ports = v["Ports"]
            .as_array()
            .map(|ports| {
                ports
                    .iter()
                    .filter_map(|p| {
                        let host = p["host_port"].as_u64()?;
                        let container = p["container_port"].as_u64()?;
                        Some(format!("{host}->{container}"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: v["Id"].as_str().unwrap_or_default().to_string(),
            name: v["Names"][0].as_str().unwrap_or_default().to_string(),
            image: v["Image"].as_str().unwrap_or_default().to_string(),
            status: v["State"].as_str().unwrap_or_default().to_string(),
            created_at: v["CreatedAt"].as_str().unwrap_or_default().to_string(),
            ports,
            labels,
            mounts: Vec::new(),
        }
    }

    /// Normalise one entry of `podman inspect --format json`.
    pub fn from_inspect_json(v: &Value) -> Self {
        let labels = v["Config"]["Labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, val)| val.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let mounts = v["Mounts"]
            .as_array()
            .map(|mounts| {
                mounts
                    .iter()
                    .filter_map(|m| {
                        Some(Mount {
                            source: m["Source"].as_str()?.to_string(),
                            destination: m["Destination"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let ports = v["NetworkSettings"]["Ports"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(container_port, bindings)| {
                        let host = bindings.as_array()?.first()?["HostPort"].as_str()?;
                        Some(format!("{host}->{container_port}"))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            id: v["Id"].as_str().unwrap_or_default().to_string(),
            name: v["Name"]
                .as_str()
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: v["Config"]["Image"].as_str().unwrap_or_default().to_string(),
            status: v["State"]["Status"].as_str().unwrap_or_default().to_string(),
            created_at: v["Created"].as_str().unwrap_or_default().to_string(),
            ports,
            labels,
            mounts,
        }
    }
}

/// Capability set the tunnel supervisor needs from a container runtime.
/// Tests substitute an in-memory fake.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run a shell script inside the container and return combined output.
    async fn exec(&self, container: &str, script: &str) -> Result<String, RuntimeError>;

    /// Run a shell script inside the container, detached, as `user`, with
    /// extra environment variables. Returns once the exec is dispatched.
    async fn exec_detached(
        &self,
        container: &str,
        user: &str,
        env: &[(String, String)],
        script: &str,
    ) -> Result<(), RuntimeError>;

    async fn inspect(&self, container: &str) -> Result<ContainerRecord, RuntimeError>;

    /// List all containers (running or not) carrying the given label key.
    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Read a file from inside the container.
    async fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError>;
}

/// Runtime adapter backed by the `podman` CLI.
pub struct PodmanRuntime {
    binary: String,
    call_deadline: Duration,
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>, call_deadline: Duration) -> Self {
        Self {
            binary: binary.into(),
            call_deadline,
        }
    }

    /// Run one podman invocation under the per-call deadline and classify
    /// the outcome into the error taxonomy.
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = tokio::time::timeout(
            self.call_deadline,
            Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| {
            RuntimeError::Transient(format!(
                "{} {} exceeded {}s deadline",
                self.binary,
                args.first().unwrap_or(&""),
                self.call_deadline.as_secs()
            ))
        })?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::Unavailable(format!("{} not found on PATH", self.binary))
            } else {
                RuntimeError::Transient(e.to_string())
            }
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let detail = if stderr.is_empty() { stdout } else { stderr };
        Err(classify_failure(&detail, output.status.code()))
    }
}

fn classify_failure(detail: &str, code: Option<i32>) -> RuntimeError {
    let lower = detail.to_lowercase();
    if lower.contains("no such container") || lower.contains("no container with name or id") {
        RuntimeError::NotFound(detail.to_string())
    } else if detail.is_empty() {
        RuntimeError::Transient(format!("exit status {}", code.unwrap_or(-1)))
    } else {
        RuntimeError::Transient(detail.to_string())
    }
}

#[async_trait]
impl Runtime for PodmanRuntime {
    async fn exec(&self, container: &str, script: &str) -> Result<String, RuntimeError> {
        self.run(&["exec", container, "/bin/sh", "-c", script]).await
    }

    async fn exec_detached(
        &self,
        container: &str,
        user: &str,
        env: &[(String, String)],
        script: &str,
    ) -> Result<(), RuntimeError> {
        let mut args: Vec<String> = vec!["exec".into(), "-d".into()];
        if !user.is_empty() {
            args.push("--user".into());
            args.push(user.into());
        }
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(container.into());
        args.push("/bin/sh".into());
        args.push("-c".into());
        args.push(script.into());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&arg_refs).await.map(|_| ())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerRecord, RuntimeError> {
        let out = self
            .run(&["inspect", "--format", "json", container])
            .await?;
        let parsed: Value = serde_json::from_str(&out)
            .map_err(|e| RuntimeError::Transient(format!("unparseable inspect output: {e}")))?;
        parsed
            .as_array()
            .and_then(|a| a.first())
            .map(ContainerRecord::from_inspect_json)
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let filter = format!("label={label_filter}");
        let out = self
            .run(&["ps", "-a", "--filter", &filter, "--format", "json"])
            .await?;
        let parsed: Value = serde_json::from_str(out.trim())
            .map_err(|e| RuntimeError::Transient(format!("unparseable ps output: {e}")))?;
        Ok(parsed
            .as_array()
            .map(|a| a.iter().map(ContainerRecord::from_ps_json).collect())
            .unwrap_or_default())
    }

    async fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError> {
        let script = format!("cat {} 2>/dev/null || true", shell_quote(path));
        self.exec(container, &script).await
    }
}
