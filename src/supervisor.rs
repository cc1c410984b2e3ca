use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bootstrap;
use crate::config::TunnelConfig;
use crate::health;
use crate::monitor::{self, MonitorParams};
use crate::notify::{Notifier, Subscription};
use crate::runtime::{ContainerRecord, Runtime, RuntimeError};
use crate::session::{
    sanitize_tunnel_name, SESSION_LABEL, WORKSPACE_DIR_LABEL, WORKSPACE_HOME_LABEL,
};
use crate::state::{
    Store, TunnelState, TunnelStatus, MSG_PROCESS_NOT_RUNNING, MSG_RUNTIME_UNAVAILABLE,
};

/// Container record overlaid with tunnel state for list responses.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceView {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub created_at: String,
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel_status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tunnel_url: String,
}

struct MonitorHandle {
    session_id: String,
    cancel: CancellationToken,
}

/// Owns the monitor registry and the state store; everything external
/// parties do to tunnels goes through here.
pub struct Supervisor {
    runtime: Arc<dyn Runtime>,
    config: TunnelConfig,
    store: Arc<Store>,
    monitors: DashMap<String, MonitorHandle>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn Runtime>, config: TunnelConfig) -> Self {
        let store = Arc::new(Store::new(Notifier::new(config.notifier_queue)));
        Self {
            runtime,
            config,
            store,
            monitors: DashMap::new(),
        }
    }

    /// The deletion path clears entries directly after stopping the monitor.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Install and launch the tunnel for a freshly created container, then
    /// hand it to a monitor. Always returns a state; the session id is
    /// empty only when bootstrap failed before a session existed.
    pub async fn bootstrap(
        &self,
        container_id: &str,
        workspace_name: &str,
        host_token_dir: &str,
    ) -> (String, TunnelState) {
        counter!("tunnel_bootstraps_total").increment(1);
        let (session, state) = bootstrap::bootstrap(self.runtime.as_ref(), container_id, workspace_name).await;
        self.store.set(container_id, state.clone());

        let session_id = session.map(|s| s.session_id).unwrap_or_default();
        if state.status == TunnelStatus::Starting && !session_id.is_empty() {
            self.start_monitor(container_id, &session_id, host_token_dir, state.clone());
        } else if state.status == TunnelStatus::Failed {
            counter!("tunnel_bootstrap_failures_total").increment(1);
            tracing::warn!(
                container_id = %container_id,
                message = %state.message,
                "Tunnel bootstrap failed"
            );
        }
        (session_id, state)
    }

    /// Spawn a monitor worker, replacing (and cancelling) any previous
    /// monitor for the container so at most one stays live per id.
    pub fn start_monitor(
        &self,
        container_id: &str,
        session_id: &str,
        host_token_dir: &str,
        initial: TunnelState,
    ) {
        let cancel = CancellationToken::new();
        let params = MonitorParams {
            container_id: container_id.to_string(),
            session_id: session_id.to_string(),
            host_token_dir: host_token_dir.to_string(),
        };
        tokio::spawn(monitor::run(
            self.runtime.clone(),
            self.store.clone(),
            self.config.clone(),
            params,
            cancel.clone(),
            initial,
        ));
        let handle = MonitorHandle {
            session_id: session_id.to_string(),
            cancel,
        };
        if let Some(previous) = self.monitors.insert(container_id.to_string(), handle) {
            tracing::info!(
                container_id = %container_id,
                old_session = %previous.session_id,
                new_session = %session_id,
                "Replacing tunnel monitor"
            );
            previous.cancel.cancel();
        }
    }

    /// Stop and forget the monitor for a container. Safe to call when no
    /// monitor exists; callers on the deletion path do not care.
    pub fn stop_monitor(&self, container_id: &str) {
        if let Some((_, handle)) = self.monitors.remove(container_id) {
            handle.cancel.cancel();
            tracing::info!(container_id = %container_id, "Tunnel monitor removed");
        }
    }

    pub fn get_state(&self, container_id: &str) -> Option<TunnelState> {
        self.store.get(container_id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe()
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn monitored_session(&self, container_id: &str) -> Option<String> {
        self.monitors.get(container_id).map(|h| h.session_id.clone())
    }

    /// Re-derive tunnel state for every container carrying a session
    /// label: prune entries whose container is gone, re-attach monitors to
    /// live tunnel processes, record terminal state for dead ones.
    /// Returns how many monitors were attached.
    pub async fn reconcile(&self) -> usize {
        let records = match self.runtime.list(SESSION_LABEL).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Reconcile could not list containers");
                return 0;
            }
        };
        let known: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.store.prune(&known);

        let mut attached = 0;
        for record in records {
            let Some(session_id) = record.labels.get(SESSION_LABEL).cloned() else {
                continue;
            };
            if self.monitors.contains_key(&record.id) {
                continue;
            }
            let host_token_dir = self.discover_token_dir(&record.id).await;
            match health::probe(
                self.runtime.as_ref(),
                &record.id,
                &session_id,
                &host_token_dir,
                self.config.token_walk_depth,
            )
            .await
            {
                Ok(probed) if probed.process_alive => {
                    let initial = monitor::derive_state(&probed);
                    self.store.set(&record.id, initial.clone());
                    self.start_monitor(&record.id, &session_id, &host_token_dir, initial);
                    attached += 1;
                }
                Ok(_) => {
                    self.store.set(&record.id, TunnelState::failed(MSG_PROCESS_NOT_RUNNING));
                }
                Err(RuntimeError::NotFound(_)) => {
                    // vanished between list and probe
                    self.store.clear(&record.id);
                }
                Err(RuntimeError::Unavailable(_)) => {
                    self.store.set(&record.id, TunnelState::failed(MSG_RUNTIME_UNAVAILABLE));
                }
                Err(e) => {
                    tracing::warn!(
                        container_id = %record.id,
                        error = %e,
                        "Reconcile probe failed, will retry on next pass"
                    );
                }
            }
        }
        tracing::info!(attached, "Reconcile pass complete");
        attached
    }

    /// The CLI data dir is the bind mount Bootstrap points
    /// VSCODE_CLI_DATA_DIR at; its host source is where tokens appear.
    async fn discover_token_dir(&self, container_id: &str) -> String {
        match self.runtime.inspect(container_id).await {
            Ok(record) => record
                .mounts
                .iter()
                .find(|m| m.destination.ends_with("/.vscode"))
                .map(|m| m.source.clone())
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!(container_id = %container_id, error = %e, "No token dir recovered");
                String::new()
            }
        }
    }

    /// List labelled containers and overlay their tunnel state.
    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceView>, RuntimeError> {
        let records = self.runtime.list(SESSION_LABEL).await?;
        Ok(self.enrich_list(&records))
    }

    /// Overlay container records with tunnel status, device code, message
    /// and (for ready tunnels only) the vscode.dev URL.
    pub fn enrich_list(&self, records: &[ContainerRecord]) -> Vec<WorkspaceView> {
        records
            .iter()
            .map(|record| {
                let state = self.store.get(&record.id);
                let tunnel_url = match &state {
                    Some(s) if s.status == TunnelStatus::Ready => tunnel_url(record),
                    _ => String::new(),
                };
                let (tunnel_status, tunnel_code, tunnel_message) = match state {
                    Some(s) => (s.status.as_str().to_string(), s.code, s.message),
                    None => (String::new(), String::new(), String::new()),
                };
                WorkspaceView {
                    id: record.id.clone(),
                    name: record.name.clone(),
                    image: record.image.clone(),
                    status: record.status.clone(),
                    created_at: record.created_at.clone(),
                    ports: record.ports.clone(),
                    tunnel_status,
                    tunnel_code,
                    tunnel_message,
                    tunnel_url,
                }
            })
            .collect()
    }

    /// Cancel every monitor; workers observe the token at their next loop
    /// head, within one poll interval.
    pub fn shutdown(&self) {
        for entry in self.monitors.iter() {
            entry.value().cancel.cancel();
        }
        self.monitors.clear();
        tracing::info!("Tunnel supervisor shut down");
    }
}

fn tunnel_url(record: &ContainerRecord) -> String {
    let name = sanitize_tunnel_name(&record.name);
    let mut url = format!("https://vscode.dev/tunnel/{name}");
    if let (Some(home), Some(dir)) = (
        record.labels.get(WORKSPACE_HOME_LABEL),
        record.labels.get(WORKSPACE_DIR_LABEL),
    ) {
        let path = format!("{}/{}", home.trim_end_matches('/'), dir);
        url.push_str(&escape_path(&path));
    }
    url
}

/// Percent-encode a workspace path for URL use, keeping `/` separators.
fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord {
            id: "0123456789abcdef".into(),
            name: name.into(),
            image: "workspace:latest".into(),
            status: "running".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_tunnel_url_without_path_labels() {
        assert_eq!(tunnel_url(&record("my-ws")), "https://vscode.dev/tunnel/my-ws");
    }

    #[test]
    fn test_tunnel_url_sanitizes_name() {
        assert_eq!(
            tunnel_url(&record("my ws!")),
            "https://vscode.dev/tunnel/my-ws"
        );
    }

    #[test]
    fn test_tunnel_url_appends_escaped_workspace_path() {
        let mut r = record("ws");
        r.labels.insert(WORKSPACE_HOME_LABEL.into(), "/home/dev/".into());
        r.labels.insert(WORKSPACE_DIR_LABEL.into(), "my project".into());
        assert_eq!(
            tunnel_url(&r),
            "https://vscode.dev/tunnel/ws/home/dev/my%20project"
        );
    }

    #[test]
    fn test_tunnel_url_requires_both_labels() {
        let mut r = record("ws");
        r.labels.insert(WORKSPACE_HOME_LABEL.into(), "/home/dev".into());
        assert_eq!(tunnel_url(&r), "https://vscode.dev/tunnel/ws");
    }

    #[test]
    fn test_escape_path_keeps_unreserved() {
        assert_eq!(escape_path("/home/dev/a-b_c.d~e"), "/home/dev/a-b_c.d~e");
        assert_eq!(escape_path("/home/dev/ä"), "/home/dev/%C3%A4");
    }
}
