use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Container label pairing a container with its tunnel session.
pub const SESSION_LABEL: &str = "tunnel_session";
/// Optional labels used only for tunnel URL composition.
pub const WORKSPACE_HOME_LABEL: &str = "workspace_home";
pub const WORKSPACE_DIR_LABEL: &str = "workspace_dir";

const FILE_PREFIX: &str = "code-tunnel";
const MAX_TUNNEL_NAME: usize = 128;

/// One invocation of the in-container tunnel process. Immutable once
/// created; recreating the container yields a new session with new files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub container_id: String,
    /// Non-root user the tunnel runs as
    pub exec_user: String,
    /// Home directory of `exec_user`, absolute
    pub exec_home: String,
    pub tunnel_name: String,
}

impl Session {
    pub fn pid_path(&self) -> String {
        pid_path(&self.session_id)
    }

    pub fn log_path(&self) -> String {
        log_path(&self.session_id)
    }

    /// Directory the CLI writes its state (and OAuth token) into,
    /// bind-mounted by the container creator.
    pub fn data_dir(&self) -> String {
        format!("{}/.vscode", self.exec_home)
    }
}

pub fn pid_path(session_id: &str) -> String {
    format!("/tmp/{FILE_PREFIX}-{session_id}.pid")
}

pub fn log_path(session_id: &str) -> String {
    format!("/tmp/{FILE_PREFIX}-{session_id}.log")
}

/// Generate a session id of the form `<unix-seconds>-<8 hex>`.
pub fn generate_session_id() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", secs, &hex[..8])
}

/// Build a tunnel name from a workspace name: disallowed characters become
/// `-`, the result is trimmed and truncated to 128 chars, and an empty
/// result falls back to `workspace`.
pub fn sanitize_tunnel_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed: String = replaced.trim_matches('-').chars().take(MAX_TUNNEL_NAME).collect();
    if trimmed.is_empty() {
        "workspace".to_string()
    } else {
        trimmed
    }
}
