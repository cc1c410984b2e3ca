use crate::runtime::{shell_quote, Runtime, RuntimeError};
use crate::session::{self, Session};
use crate::state::TunnelState;

/// Install/start output inside the container lands here as well, so a
/// shell into the container can see what bootstrap did.
const BOOTSTRAP_LOG: &str = "/tmp/code-tunnel-bootstrap.log";

/// User-visible failure messages are trimmed and capped.
const MAX_MESSAGE: usize = 240;

/// Idempotent installer: a working `code tunnel` short-circuits, anything
/// else pulls prerequisites and the architecture-matched CLI archive.
const INSTALL_SCRIPT: &str = r#"set -e
if command -v code >/dev/null 2>&1 && code tunnel --help >/dev/null 2>&1; then
    echo "code CLI present: $(code --version 2>/dev/null | head -n 1)"
    exit 0
fi
if command -v apt-get >/dev/null 2>&1; then
    export DEBIAN_FRONTEND=noninteractive
    apt-get update -qq >/dev/null
    apt-get install -y -qq ca-certificates curl tar >/dev/null
elif command -v apk >/dev/null 2>&1; then
    apk add --no-cache ca-certificates curl tar >/dev/null
elif command -v dnf >/dev/null 2>&1; then
    dnf install -y -q ca-certificates curl tar >/dev/null
fi
arch="$(uname -m)"
case "$arch" in
    x86_64) target="cli-alpine-x64" ;;
    aarch64) target="cli-linux-arm64" ;;
    armv7*|armhf) target="cli-linux-armhf" ;;
    *) echo "unsupported architecture: $arch" >&2; exit 1 ;;
esac
curl -fsSL "https://update.code.visualstudio.com/latest/$target/stable" -o /tmp/code-cli.tar.gz
tar -xzf /tmp/code-cli.tar.gz -C /usr/local/bin code
rm -f /tmp/code-cli.tar.gz
echo "code CLI installed: $(code --version 2>/dev/null | head -n 1)"
"#;

/// Start wrapper: `echo $! > PID` records the exact tunnel pid for the
/// health prober, `wait` keeps the detached shell as its parent.
fn start_script(session: &Session) -> String {
    format!(
        "code tunnel --accept-server-license-terms --name {name} >>{log} 2>&1 &\necho $! >{pid}\nwait",
        name = shell_quote(&session.tunnel_name),
        log = shell_quote(&session.log_path()),
        pid = shell_quote(&session.pid_path()),
    )
}

/// Install the editor CLI in the container and launch the tunnel process.
/// Never panics; failures come back as a `failed` state with a
/// user-readable message. The session is returned as soon as it exists so
/// callers can correlate later failures with its log/PID files.
pub async fn bootstrap(
    runtime: &dyn Runtime,
    container_id: &str,
    workspace_name: &str,
) -> (Option<Session>, TunnelState) {
    let passwd = match runtime.read_file(container_id, "/etc/passwd").await {
        Ok(contents) => contents,
        Err(e) => {
            return (
                None,
                TunnelState::failed(failure_message("Failed to read /etc/passwd: ", &e.to_string())),
            );
        }
    };
    let Some((exec_user, exec_home)) = pick_exec_user(&passwd) else {
        return (None, TunnelState::failed("no non-root user"));
    };

    let session = Session {
        session_id: session::generate_session_id(),
        container_id: container_id.to_string(),
        exec_user,
        exec_home,
        tunnel_name: session::sanitize_tunnel_name(workspace_name),
    };
    tracing::info!(
        container_id = %container_id,
        session_id = %session.session_id,
        exec_user = %session.exec_user,
        tunnel_name = %session.tunnel_name,
        "Bootstrapping tunnel"
    );

    let prepare = format!(
        ": >{log}; : >{pid}; chown {user} {log} {pid}",
        log = shell_quote(&session.log_path()),
        pid = shell_quote(&session.pid_path()),
        user = shell_quote(&session.exec_user),
    );
    if let Err(e) = runtime.exec(container_id, &prepare).await {
        return (
            Some(session),
            TunnelState::failed(failure_message("Failed to prepare tunnel files: ", &e.to_string())),
        );
    }

    let install_output = match runtime.exec(container_id, INSTALL_SCRIPT).await {
        Ok(output) => output,
        Err(RuntimeError::Transient(detail)) => {
            return (
                Some(session),
                TunnelState::failed(failure_message("Failed to install VS Code CLI: ", &detail)),
            );
        }
        Err(e) => {
            return (
                Some(session),
                TunnelState::failed(failure_message("Failed to install VS Code CLI: ", &e.to_string())),
            );
        }
    };
    append_bootstrap_log(runtime, container_id, &install_output).await;

    let env = [
        ("HOME".to_string(), session.exec_home.clone()),
        ("VSCODE_CLI_DATA_DIR".to_string(), session.data_dir()),
    ];
    if let Err(e) = runtime
        .exec_detached(container_id, &session.exec_user, &env, &start_script(&session))
        .await
    {
        return (
            Some(session),
            TunnelState::failed(failure_message("Failed to start tunnel: ", &e.to_string())),
        );
    }

    let state = TunnelState::starting().with_debug(debug_lines(&install_output));
    (Some(session), state)
}

/// Prefer the first regular user (`UID >= 1000`, home under `/home/`);
/// fall back to the first non-root entry with a home directory.
fn pick_exec_user(passwd: &str) -> Option<(String, String)> {
    let mut fallback: Option<(String, String)> = None;
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        let name = fields[0];
        let Ok(uid) = fields[2].parse::<u32>() else { continue };
        let home = fields[5];
        if uid == 0 || name.is_empty() || !home.starts_with('/') {
            continue;
        }
        if uid >= 1000 && home.starts_with("/home/") {
            return Some((name.to_string(), home.to_string()));
        }
        if fallback.is_none() {
            fallback = Some((name.to_string(), home.to_string()));
        }
    }
    fallback
}

async fn append_bootstrap_log(runtime: &dyn Runtime, container_id: &str, output: &str) {
    let script = format!(
        "printf '%s\\n' {} >>{}",
        shell_quote(output.trim()),
        shell_quote(BOOTSTRAP_LOG)
    );
    if let Err(e) = runtime.exec(container_id, &script).await {
        tracing::debug!(container_id = %container_id, error = %e, "Could not append bootstrap log");
    }
}

fn failure_message(prefix: &str, detail: &str) -> String {
    let msg = format!("{prefix}{}", detail.trim());
    if msg.chars().count() > MAX_MESSAGE {
        msg.chars().take(MAX_MESSAGE).collect()
    } else {
        msg
    }
}

/// First few non-empty output lines, kept as diagnostics on the state.
fn debug_lines(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
        daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
        dev:x:1000:1000:Dev:/home/dev:/bin/bash\n\
        extra:x:1001:1001::/home/extra:/bin/sh\n";

    #[test]
    fn test_picks_first_regular_user() {
        let (user, home) = pick_exec_user(PASSWD).unwrap();
        assert_eq!(user, "dev");
        assert_eq!(home, "/home/dev");
    }

    #[test]
    fn test_falls_back_to_first_non_root() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
            daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n";
        let (user, home) = pick_exec_user(passwd).unwrap();
        assert_eq!(user, "daemon");
        assert_eq!(home, "/usr/sbin");
    }

    #[test]
    fn test_root_only_passwd_yields_none() {
        assert!(pick_exec_user("root:x:0:0:root:/root:/bin/bash\n").is_none());
        assert!(pick_exec_user("").is_none());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let passwd = "garbage\nalso:bad\ndev:x:1000:1000:Dev:/home/dev:/bin/bash\n";
        let (user, _) = pick_exec_user(passwd).unwrap();
        assert_eq!(user, "dev");
    }

    #[test]
    fn test_failure_message_trims_and_caps() {
        let msg = failure_message("Failed to install VS Code CLI: ", "  boom  \n");
        assert_eq!(msg, "Failed to install VS Code CLI: boom");

        let long = "x".repeat(500);
        let msg = failure_message("Failed to install VS Code CLI: ", &long);
        assert_eq!(msg.chars().count(), 240);
        assert!(msg.starts_with("Failed to install VS Code CLI: "));
    }

    #[test]
    fn test_start_script_quotes_paths_and_name() {
        let session = Session {
            session_id: "1751364000-ab12cd34".into(),
            container_id: "c1".into(),
            exec_user: "dev".into(),
            exec_home: "/home/dev".into(),
            tunnel_name: "my-ws".into(),
        };
        let script = start_script(&session);
        assert!(script.contains("--accept-server-license-terms"));
        assert!(script.contains("--name my-ws"));
        assert!(script.contains(">>/tmp/code-tunnel-1751364000-ab12cd34.log"));
        assert!(script.contains("echo $! >/tmp/code-tunnel-1751364000-ab12cd34.pid"));
        assert!(script.ends_with("wait"));
    }

    #[test]
    fn test_install_script_short_circuits_before_download() {
        let help_check = INSTALL_SCRIPT.find("code tunnel --help").unwrap();
        let download = INSTALL_SCRIPT.find("curl -fsSL").unwrap();
        assert!(help_check < download);
    }

    #[test]
    fn test_debug_lines_compact() {
        let out = "\n\ncode CLI present: 1.92.0\nextra\nmore\nignored\n";
        assert_eq!(debug_lines(out), "code CLI present: 1.92.0 | extra | more");
        assert_eq!(debug_lines(""), "");
    }
}
