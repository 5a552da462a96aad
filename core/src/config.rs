// Rendezvous configuration: timeouts and quotas

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for matchmaking, negotiation and relay quotas.
///
/// Durations are stored as milliseconds so the struct round-trips through
/// the CLI's JSON config file unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// How long a session may stay in Negotiating before it fails
    pub negotiation_timeout_ms: u64,
    /// How long `join_queue` waits for a partner
    pub queue_wait_timeout_ms: u64,
    /// Peers silent for longer than this are deregistered by the sweep
    pub peer_liveness_timeout_ms: u64,
    /// How long terminal sessions stay queryable before disposal
    pub session_retention_ms: u64,
    /// Interval of the maintenance sweep
    pub sweep_interval_ms: u64,
    /// Maximum unacknowledged signal messages held per recipient
    pub max_pending_signals: usize,
    /// Maximum chat message size in bytes
    pub max_chat_text_len: usize,
    /// Put peers back in the queue when their session ends
    pub requeue_after_session: bool,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 30_000,
            queue_wait_timeout_ms: 60_000,
            peer_liveness_timeout_ms: 90_000,
            session_retention_ms: 5 * 60_000,
            sweep_interval_ms: 5_000,
            max_pending_signals: 256,
            max_chat_text_len: 4096,
            requeue_after_session: true,
        }
    }
}

impl RendezvousConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_wait_timeout_ms)
    }

    pub fn peer_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_liveness_timeout_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_millis(self.session_retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject settings that would make sessions or sweeps degenerate.
    pub fn validate(&self) -> Result<(), String> {
        let timers = [
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("queue_wait_timeout_ms", self.queue_wait_timeout_ms),
            ("peer_liveness_timeout_ms", self.peer_liveness_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        if self.max_pending_signals == 0 {
            return Err("max_pending_signals must be greater than zero".to_string());
        }
        if self.max_chat_text_len == 0 {
            return Err("max_chat_text_len must be greater than zero".to_string());
        }
        Ok(())
    }
}
