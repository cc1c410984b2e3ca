use metrics::{counter, gauge};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::health::{self, Health};
use crate::runtime::{Runtime, RuntimeError};
use crate::state::{
    Store, TunnelState, TunnelStatus, MSG_BOOTSTRAP_TIMED_OUT, MSG_CONTAINER_NOT_FOUND,
    MSG_PROCESS_NOT_RUNNING, MSG_RUNTIME_UNAVAILABLE,
};

/// Everything a monitor worker needs to keep probing one container.
#[derive(Debug, Clone)]
pub struct MonitorParams {
    pub container_id: String,
    pub session_id: String,
    pub host_token_dir: String,
}

/// Map probed health onto a tunnel state. `blocked` is not terminal; the
/// caller keeps polling until the token shows up or the process dies.
pub fn derive_state(health: &Health) -> TunnelState {
    if !health.process_alive {
        TunnelState::failed(MSG_PROCESS_NOT_RUNNING)
    } else if health.token_present {
        TunnelState::ready()
    } else if health.auth_required {
        TunnelState::blocked(&health.device_code)
    } else {
        TunnelState::starting()
    }
}

/// Long-lived worker: one per monitored container. Exits on cancellation,
/// on a terminal `failed` write, or when progress stalls for longer than
/// the configured timeout.
pub async fn run(
    runtime: Arc<dyn Runtime>,
    store: Arc<Store>,
    config: TunnelConfig,
    params: MonitorParams,
    cancel: CancellationToken,
    initial: TunnelState,
) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first interval tick fires immediately; skip it so the tunnel
    // gets one poll interval to come up before the first probe
    ticker.tick().await;

    let mut current = initial;
    let mut health = Health::default();
    let mut last_progress = Instant::now();

    gauge!("active_tunnel_monitors").increment(1.0);
    tracing::info!(
        container_id = %params.container_id,
        session_id = %params.session_id,
        "Tunnel monitor started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(container_id = %params.container_id, "Tunnel monitor stopped");
                break;
            }
            _ = ticker.tick() => {}
        }

        let probed = match health::probe(
            runtime.as_ref(),
            &params.container_id,
            &params.session_id,
            &params.host_token_dir,
            config.token_walk_depth,
        )
        .await
        {
            Ok(probed) => Some(probed),
            Err(RuntimeError::NotFound(_)) => {
                write_state(&store, &cancel, &params, TunnelState::failed(MSG_CONTAINER_NOT_FOUND));
                break;
            }
            Err(RuntimeError::Unavailable(_)) => {
                write_state(&store, &cancel, &params, TunnelState::failed(MSG_RUNTIME_UNAVAILABLE));
                break;
            }
            Err(RuntimeError::Transient(detail)) => {
                // keep last tick's evidence; time, not retries, resolves this
                tracing::debug!(
                    container_id = %params.container_id,
                    detail = %detail,
                    "Transient runtime failure, keeping previous health"
                );
                None
            }
        };

        if let Some(probed) = probed {
            let next = derive_state(&probed).with_debug(current.debug.clone());
            if next != current || probed != health {
                last_progress = Instant::now();
            }
            if next != current {
                write_state(&store, &cancel, &params, next.clone());
                current = next;
            }
            health = probed;
        }

        if current.status == TunnelStatus::Failed {
            break;
        }
        // The stall clock only applies while bootstrapping: `ready` is a
        // steady state and `blocked` waits on a human completing OAuth.
        if current.status == TunnelStatus::Starting
            && last_progress.elapsed() > config.progress_timeout
        {
            tracing::warn!(
                container_id = %params.container_id,
                session_id = %params.session_id,
                timeout_secs = config.progress_timeout.as_secs(),
                "Tunnel made no progress, giving up"
            );
            write_state(&store, &cancel, &params, TunnelState::failed(MSG_BOOTSTRAP_TIMED_OUT));
            break;
        }
    }

    gauge!("active_tunnel_monitors").decrement(1.0);
}

/// A cancelled monitor must not write: StopMonitor's contract is that no
/// store writes for the container happen after it returns.
fn write_state(store: &Store, cancel: &CancellationToken, params: &MonitorParams, state: TunnelState) {
    if cancel.is_cancelled() {
        return;
    }
    let status = state.status;
    if store.set(&params.container_id, state) {
        counter!("tunnel_transitions_total", "status" => status.as_str()).increment(1);
        tracing::info!(
            container_id = %params.container_id,
            session_id = %params.session_id,
            status = %status,
            "Tunnel state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MSG_AUTH_REQUIRED;

    fn health(alive: bool, token: bool, auth: bool, code: &str) -> Health {
        Health {
            process_alive: alive,
            token_present: token,
            auth_required: auth,
            device_code: code.to_string(),
        }
    }

    #[test]
    fn test_dead_process_fails() {
        let state = derive_state(&health(false, false, false, ""));
        assert_eq!(state.status, TunnelStatus::Failed);
        assert_eq!(state.message, MSG_PROCESS_NOT_RUNNING);
    }

    #[test]
    fn test_dead_process_outranks_token() {
        let state = derive_state(&health(false, true, false, ""));
        assert_eq!(state.status, TunnelStatus::Failed);
    }

    #[test]
    fn test_token_means_ready_with_empty_code() {
        let state = derive_state(&health(true, true, false, ""));
        assert_eq!(state.status, TunnelStatus::Ready);
        assert_eq!(state.code, "");
    }

    #[test]
    fn test_token_outranks_stale_auth_evidence() {
        let state = derive_state(&health(true, true, true, "ABCD-EFGH"));
        assert_eq!(state.status, TunnelStatus::Ready);
        assert_eq!(state.code, "");
    }

    #[test]
    fn test_auth_prompt_blocks_with_code() {
        let state = derive_state(&health(true, false, true, "ABCD-EFGH"));
        assert_eq!(state.status, TunnelStatus::Blocked);
        assert_eq!(state.code, "ABCD-EFGH");
        assert_eq!(state.message, MSG_AUTH_REQUIRED);
    }

    #[test]
    fn test_alive_without_evidence_is_starting() {
        let state = derive_state(&health(true, false, false, ""));
        assert_eq!(state.status, TunnelStatus::Starting);
        assert_eq!(state.code, "");
    }
}
