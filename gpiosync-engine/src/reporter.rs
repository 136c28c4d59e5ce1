//! Periodic liveness heartbeat bound to one link.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use gpiosync_core::topics::HEARTBEAT;
use gpiosync_core::types::{LinkId, QoS};

use crate::link::ChannelLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReporterState {
    Idle,
    Running,
}

#[derive(Debug, Default)]
struct Gate {
    open: bool,
    sent: u64,
}

struct Active {
    link: LinkId,
    gate: Arc<Mutex<Gate>>,
    handle: JoinHandle<()>,
}

/// Publishes [`HEARTBEAT`] on its bound link every `interval` while running.
///
/// The task only publishes while holding the gate lock with the gate open.
/// [`stop`](Self::stop) closes the gate under that same lock, so once it
/// returns no further heartbeat can be issued, whether or not the task has
/// been scheduled since.
pub struct LivenessReporter {
    interval: Duration,
    active: Option<Active>,
    total_sent: u64,
}

impl LivenessReporter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: None,
            total_sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> ReporterState {
        if self.active.is_some() {
            ReporterState::Running
        } else {
            ReporterState::Idle
        }
    }

    /// The link the running task publishes on, if any.
    pub fn bound_link(&self) -> Option<LinkId> {
        self.active.as_ref().map(|a| a.link)
    }

    /// Heartbeats issued since construction, including the current run.
    pub fn heartbeats_sent(&self) -> u64 {
        let current = self
            .active
            .as_ref()
            .map(|a| a.gate.lock().unwrap_or_else(|e| e.into_inner()).sent)
            .unwrap_or(0);
        self.total_sent + current
    }

    /// Start publishing on `link`. Returns `false` (and does nothing) when
    /// already running. Must be called from within a tokio runtime.
    pub fn start(&mut self, link: Arc<dyn ChannelLink>, topic: String) -> bool {
        if self.active.is_some() {
            return false;
        }

        let gate = Arc::new(Mutex::new(Gate {
            open: true,
            sent: 0,
        }));
        let link_id = link.id();
        let interval = self.interval;
        let task_gate = Arc::clone(&gate);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let open = {
                    let mut gate = task_gate.lock().unwrap_or_else(|e| e.into_inner());
                    if gate.open && link.state().is_connected() {
                        match link.publish(&topic, HEARTBEAT.as_bytes(), QoS::AtMostOnce, false) {
                            Ok(_) => {
                                gate.sent += 1;
                                tracing::trace!(link = %link_id, "heartbeat sent");
                            }
                            Err(err) => {
                                tracing::warn!(link = %link_id, error = %err, "heartbeat publish failed");
                            }
                        }
                    }
                    gate.open
                };
                if !open {
                    break;
                }
            }
        });

        tracing::info!(link = %link_id, interval_ms = interval.as_millis() as u64, "liveness reporter started");
        self.active = Some(Active {
            link: link_id,
            gate,
            handle,
        });
        true
    }

    /// Stop the task. Returns `false` when already idle.
    pub fn stop(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        {
            let mut gate = active.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.open = false;
            self.total_sent += gate.sent;
        }
        active.handle.abort();
        tracing::info!(link = %active.link, "liveness reporter stopped");
        true
    }
}

impl Drop for LivenessReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LivenessReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessReporter")
            .field("interval", &self.interval)
            .field("state", &self.state())
            .field("bound_link", &self.bound_link())
            .finish()
    }
}
