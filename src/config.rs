use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,

    /// Seconds between tunnel health checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds a tunnel may stall without progress before it is failed
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,
    /// Per-subscriber bounded buffer for state push
    #[serde(default = "default_notifier_queue")]
    pub notifier_queue: usize,
    /// Seconds allowed for a single runtime exec/inspect call
    #[serde(default = "default_runtime_call_deadline_secs")]
    pub runtime_call_deadline_secs: u64,
    /// Max directory depth when searching a token dir for token.json
    #[serde(default = "default_token_walk_depth")]
    pub token_walk_depth: usize,
}

fn default_listen_addr() -> String { "0.0.0.0:8000".into() }
fn default_container_runtime() -> String { "podman".into() }
fn default_poll_interval_secs() -> u64 { 3 }
fn default_progress_timeout_secs() -> u64 { 120 }
fn default_notifier_queue() -> usize { 16 }
fn default_runtime_call_deadline_secs() -> u64 { 10 }
fn default_token_walk_depth() -> usize { 4 }

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("TM"))
            .build()
            .expect("Failed to build config")
            .try_deserialize()
            .expect("Failed to deserialize config")
    })
}

/// Timing and sizing knobs for the tunnel supervisor. Deployments derive
/// this from [`Settings`]; tests construct it directly.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub poll_interval: Duration,
    pub progress_timeout: Duration,
    pub notifier_queue: usize,
    pub runtime_call_deadline: Duration,
    pub token_walk_depth: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
            progress_timeout: Duration::from_secs(default_progress_timeout_secs()),
            notifier_queue: default_notifier_queue(),
            runtime_call_deadline: Duration::from_secs(default_runtime_call_deadline_secs()),
            token_walk_depth: default_token_walk_depth(),
        }
    }
}

impl TunnelConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_secs(s.poll_interval_secs),
            progress_timeout: Duration::from_secs(s.progress_timeout_secs),
            notifier_queue: s.notifier_queue,
            runtime_call_deadline: Duration::from_secs(s.runtime_call_deadline_secs),
            token_walk_depth: s.token_walk_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunnel_config() {
        let c = TunnelConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(3));
        assert_eq!(c.progress_timeout, Duration::from_secs(120));
        assert_eq!(c.notifier_queue, 16);
        assert_eq!(c.runtime_call_deadline, Duration::from_secs(10));
        assert_eq!(c.token_walk_depth, 4);
    }
}
