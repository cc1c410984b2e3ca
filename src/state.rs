use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::notify::{Notifier, Snapshot, Subscription};

pub const MSG_AUTH_REQUIRED: &str = "Authentication required";
pub const MSG_PROCESS_NOT_RUNNING: &str = "Tunnel process not running.";
pub const MSG_CONTAINER_NOT_FOUND: &str = "Container not found";
pub const MSG_RUNTIME_UNAVAILABLE: &str = "Runtime unavailable";
pub const MSG_BOOTSTRAP_TIMED_OUT: &str = "Tunnel bootstrap timed out.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Starting,
    Blocked,
    Ready,
    Failed,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Starting => "starting",
            TunnelStatus::Blocked => "blocked",
            TunnelStatus::Ready => "ready",
            TunnelStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible state of one tunnel. Compared by value; the store
/// only notifies when a write actually changes the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelState {
    pub status: TunnelStatus,
    /// Device code for out-of-band OAuth; only set while `blocked`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Diagnostic breadcrumbs (CLI version, first install/start output)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub debug: String,
}

impl TunnelState {
    pub fn starting() -> Self {
        Self {
            status: TunnelStatus::Starting,
            code: String::new(),
            message: String::new(),
            debug: String::new(),
        }
    }

    pub fn ready() -> Self {
        Self {
            status: TunnelStatus::Ready,
            code: String::new(),
            message: String::new(),
            debug: String::new(),
        }
    }

    pub fn blocked(code: &str) -> Self {
        Self {
            status: TunnelStatus::Blocked,
            code: code.to_string(),
            message: MSG_AUTH_REQUIRED.to_string(),
            debug: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TunnelStatus::Failed,
            code: String::new(),
            message: message.into(),
            debug: String::new(),
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = debug.into();
        self
    }
}

/// Concurrency-safe map of `container_id -> TunnelState`. Writes are
/// linearised by the internal mutex and the change snapshot is published
/// before the lock is released, so subscribers observe a monotone
/// per-container sequence.
pub struct Store {
    inner: Mutex<HashMap<String, TunnelState>>,
    notifier: Notifier,
}

/// Stored keys are always the full ids the runtime reports; lookups and
/// clears tolerate the short-id/long-id confusion podman invites.
fn id_matches(key: &str, id: &str) -> bool {
    key == id || key.starts_with(id) || id.starts_with(key)
}

impl Store {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Write a state. Returns true iff the value differs from what was
    /// stored before; only then is a snapshot pushed to subscribers.
    pub fn set(&self, container_id: &str, state: TunnelState) -> bool {
        let mut map = self.inner.lock().expect("store lock poisoned");
        if map.get(container_id) == Some(&state) {
            return false;
        }
        map.insert(container_id.to_string(), state);
        self.notifier.publish(map.clone());
        true
    }

    pub fn get(&self, container_id: &str) -> Option<TunnelState> {
        let map = self.inner.lock().expect("store lock poisoned");
        if let Some(state) = map.get(container_id) {
            return Some(state.clone());
        }
        map.iter()
            .find(|(key, _)| id_matches(key, container_id))
            .map(|(_, state)| state.clone())
    }

    /// Remove every entry matching by id-or-prefix.
    pub fn clear(&self, container_id: &str) {
        let mut map = self.inner.lock().expect("store lock poisoned");
        let before = map.len();
        map.retain(|key, _| !id_matches(key, container_id));
        if map.len() != before {
            self.notifier.publish(map.clone());
        }
    }

    /// Drop entries whose container is no longer known to the runtime.
    pub fn prune(&self, known_ids: &[String]) {
        let mut map = self.inner.lock().expect("store lock poisoned");
        let before = map.len();
        map.retain(|key, _| known_ids.iter().any(|id| id_matches(key, id)));
        if map.len() != before {
            self.notifier.publish(map.clone());
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().expect("store lock poisoned").clone()
    }

    /// Subscribe to changes; the current snapshot is taken under the same
    /// lock that orders writes, so nothing is missed in between.
    pub fn subscribe(&self) -> Subscription {
        let map = self.inner.lock().expect("store lock poisoned");
        self.notifier.subscribe(map.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new(Notifier::new(64))
    }

    #[test]
    fn test_set_reports_change_by_value() {
        let store = store();
        assert!(store.set("c1", TunnelState::starting()));
        assert!(!store.set("c1", TunnelState::starting()));
        assert!(store.set("c1", TunnelState::ready()));
    }

    #[test]
    fn test_notifications_match_changed_writes() {
        let store = store();
        let mut sub = store.subscribe();
        assert!(sub.try_recv().is_some(), "initial snapshot");

        assert!(store.set("c1", TunnelState::starting()));
        assert!(!store.set("c1", TunnelState::starting()));
        assert!(store.set("c1", TunnelState::ready()));

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 2, "one notification per changed write");
    }

    #[test]
    fn test_get_tolerates_prefixes_both_ways() {
        let store = store();
        let full = "0123456789abcdef0123456789abcdef";
        store.set(full, TunnelState::ready());
        assert!(store.get(full).is_some());
        assert!(store.get("0123456789ab").is_some(), "short query, long key");
        let longer = format!("{full}00");
        assert!(store.get(&longer).is_some(), "long query, stored prefix");
        assert!(store.get("ffff").is_none());
    }

    #[test]
    fn test_clear_removes_prefix_matches() {
        let store = store();
        store.set("0123456789abcdef", TunnelState::ready());
        store.set("fedcba9876543210", TunnelState::starting());
        store.clear("0123456789ab");
        assert!(store.get("0123456789abcdef").is_none());
        assert!(store.get("fedcba9876543210").is_some());
    }

    #[test]
    fn test_prune_keeps_only_known() {
        let store = store();
        store.set("aaaa", TunnelState::ready());
        store.set("bbbb", TunnelState::failed("gone"));
        store.prune(&["aaaa".to_string()]);
        assert!(store.get("aaaa").is_some());
        assert!(store.get("bbbb").is_none());
    }

    #[test]
    fn test_state_equality_is_by_value() {
        assert_eq!(TunnelState::blocked("ABCD-EFGH"), TunnelState::blocked("ABCD-EFGH"));
        assert_ne!(TunnelState::blocked("ABCD-EFGH"), TunnelState::blocked("WXYZ-1234"));
        assert_ne!(TunnelState::starting(), TunnelState::ready());
    }

    #[test]
    fn test_wire_format_omits_empty_fields() {
        let json = serde_json::to_string(&TunnelState::ready()).unwrap();
        assert_eq!(json, r#"{"status":"ready"}"#);

        let json = serde_json::to_string(&TunnelState::blocked("ABCD-EFGH")).unwrap();
        assert!(json.contains(r#""status":"blocked""#));
        assert!(json.contains(r#""code":"ABCD-EFGH""#));
        assert!(json.contains(r#""message":"Authentication required""#));
    }
}
