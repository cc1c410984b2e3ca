use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::runtime::{shell_quote, Runtime, RuntimeError};
use crate::session;

/// Full auth-prompt sentence the CLI writes while waiting for OAuth.
static AUTH_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^To grant access to the server, please log into https://github\.com/login/device and use code ([A-Za-z0-9-]+)$",
    )
    .unwrap()
});

/// Bare device code, e.g. `ABCD-EFGH` or `abcd-efgh-ijkl`.
static DEVICE_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([A-Z0-9]{4}(?:-[A-Z0-9]{4})+)\b").unwrap());

/// Point-in-time evidence about one tunnel, fused from the PID file, the
/// bind-mounted token directory and the session log tail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Health {
    pub process_alive: bool,
    pub token_present: bool,
    pub auth_required: bool,
    pub device_code: String,
}

/// Probe one container's tunnel. Runtime failures bubble up so the caller
/// can decide between terminal and retry-next-tick handling.
pub async fn probe(
    runtime: &dyn Runtime,
    container_id: &str,
    session_id: &str,
    host_token_dir: &str,
    token_walk_depth: usize,
) -> Result<Health, RuntimeError> {
    let pid_path = session::pid_path(session_id);
    // The PID file holds the exact pid the start wrapper recorded, so a
    // single kill -0 answers liveness without pgrep heuristics.
    let script = format!(
        "kill -0 \"$(cat {} 2>/dev/null)\" 2>/dev/null && echo alive || echo dead",
        shell_quote(&pid_path)
    );
    let out = runtime.exec(container_id, &script).await?;
    let process_alive = out.trim() == "alive";

    let token_present = token_present(Path::new(host_token_dir), token_walk_depth);

    let log = runtime
        .read_file(container_id, &session::log_path(session_id))
        .await?;
    let (auth_required, device_code) = parse_auth_evidence(&log);

    Ok(Health {
        process_alive,
        token_present,
        auth_required,
        device_code,
    })
}

/// Host-side token check: the two paths the CLI is known to use first,
/// then a bounded walk for anything named token.json.
pub fn token_present(dir: &Path, walk_depth: usize) -> bool {
    if dir.as_os_str().is_empty() {
        return false;
    }
    for known in ["cli/token.json", "cli/github/token.json"] {
        if file_exists(&dir.join(known)) {
            return true;
        }
    }
    walk_for_token(dir, walk_depth)
}

fn file_exists(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file(),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            // A denied open is not evidence of absence; surface it.
            tracing::warn!(path = %path.display(), "Token path exists check denied (EACCES)");
            false
        }
        Err(_) => false,
    }
}

fn walk_for_token(dir: &Path, remaining: usize) -> bool {
    if remaining == 0 {
        return false;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!(path = %dir.display(), "Token dir walk denied (EACCES)");
            return false;
        }
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.eq_ignore_ascii_case("token.json"))
        {
            return true;
        }
        if file_type.is_dir() && walk_for_token(&path, remaining - 1) {
            return true;
        }
    }
    false
}

/// Inspect only the latest non-empty log line: an auth prompt the user
/// already answered must not re-trigger `blocked`.
pub fn parse_auth_evidence(log: &str) -> (bool, String) {
    let Some(line) = log.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return (false, String::new());
    };
    if let Some(caps) = AUTH_PROMPT_RE.captures(line) {
        return (true, caps[1].to_uppercase());
    }
    if let Some(caps) = DEVICE_CODE_RE.captures(line) {
        return (true, caps[1].to_uppercase());
    }
    (false, String::new())
}
