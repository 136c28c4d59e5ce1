//! The engine task: the single consumer of link events and control requests.
//!
//! Both transports and the control socket feed one bounded queue, so every
//! command for a given pin is applied strictly in arrival order.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use gpiosync_core::{Action, LinkEvent, PinId};
use gpiosync_engine::{log_rejection, Applied, EngineStatus, SyncEngine};

use crate::error::DaemonError;
use crate::mqtt::MqttLink;

pub const ENGINE_QUEUE_CAPACITY: usize = 64;

pub enum EngineInput {
    Link(LinkEvent),
    Status {
        respond_to: oneshot::Sender<EngineStatus>,
    },
    Apply {
        pin: PinId,
        action: Action,
        respond_to: oneshot::Sender<Result<Applied, String>>,
    },
}

/// Run until shutdown, then stop the reporter, announce `offline` and close
/// the MQTT links.
pub async fn engine_task(
    mut engine: SyncEngine,
    mut inputs: mpsc::Receiver<EngineInput>,
    closers: Vec<Arc<MqttLink>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            input = inputs.recv() => {
                let Some(input) = input else { break };
                match input {
                    EngineInput::Link(event) => {
                        engine.handle_event(event);
                    }
                    EngineInput::Status { respond_to } => {
                        let _ = respond_to.send(engine.status());
                    }
                    EngineInput::Apply { pin, action, respond_to } => {
                        let outcome = engine.apply_action(pin, action).map_err(|err| {
                            log_rejection(&err);
                            err.to_string()
                        });
                        let _ = respond_to.send(outcome);
                    }
                }
            }
        }
    }

    let announced = engine.shutdown();
    tracing::info!(offline_announced = announced, "engine stopped");
    for link in closers {
        link.disconnect();
    }
    Ok(())
}

pub async fn request_status(inputs: &mpsc::Sender<EngineInput>) -> Result<EngineStatus, DaemonError> {
    let (tx, rx) = oneshot::channel();
    inputs
        .send(EngineInput::Status { respond_to: tx })
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine queue"))?;
    rx.await
        .map_err(|_| DaemonError::ChannelClosed("engine status response"))
}

pub async fn request_apply(
    inputs: &mpsc::Sender<EngineInput>,
    pin: PinId,
    action: Action,
) -> Result<Applied, DaemonError> {
    let (tx, rx) = oneshot::channel();
    inputs
        .send(EngineInput::Apply {
            pin,
            action,
            respond_to: tx,
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine queue"))?;
    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("engine apply response"))?;
    outcome.map_err(DaemonError::Protocol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gpiosync_core::{ConnectionState, Level, LinkId, TopicScheme};
    use gpiosync_engine::{EngineParts, FileStore, MemoryLink, SimulatedPins};
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        inputs: mpsc::Sender<EngineInput>,
        shutdown: broadcast::Sender<()>,
        cloud: Arc<MemoryLink>,
        task: tokio::task::JoinHandle<Result<(), DaemonError>>,
    }

    fn spawn_engine() -> Harness {
        let tmp = TempDir::new().expect("tempdir");
        let cloud = Arc::new(MemoryLink::new(LinkId::Cloud));
        let mut engine = SyncEngine::new(EngineParts {
            topics: TopicScheme::new("esp32_02"),
            pins: vec![PinId(2)],
            controller: Arc::new(SimulatedPins::new([PinId(2), PinId(4)].into_iter().collect())),
            store: Arc::new(FileStore::open(tmp.path(), "storage").expect("store")),
            cloud: cloud.clone(),
            local: Arc::new(MemoryLink::new(LinkId::Local)),
            heartbeat_interval: Duration::from_secs(5),
        });
        engine.boot().expect("boot");

        let (inputs, rx) = mpsc::channel(ENGINE_QUEUE_CAPACITY);
        let (shutdown, _) = broadcast::channel(4);
        let task = tokio::spawn(engine_task(engine, rx, Vec::new(), shutdown.subscribe()));
        Harness {
            _tmp: tmp,
            inputs,
            shutdown,
            cloud,
            task,
        }
    }

    #[tokio::test]
    async fn commands_from_queue_are_applied_in_order() {
        let h = spawn_engine();
        h.cloud.set_state(ConnectionState::Connected);
        h.inputs
            .send(EngineInput::Link(LinkEvent::Connected(LinkId::Cloud)))
            .await
            .expect("send");
        for payload in ["ON", "TOGGLE", "TOGGLE"] {
            h.inputs
                .send(EngineInput::Link(LinkEvent::Message {
                    link: LinkId::Cloud,
                    topic: "esp32_02/gpio/4/set".to_string(),
                    payload: payload.as_bytes().to_vec(),
                }))
                .await
                .expect("send");
        }

        let status = request_status(&h.inputs).await.expect("status");
        let pin4 = status.pins.iter().find(|p| p.pin == PinId(4)).expect("pin 4");
        assert_eq!(pin4.level, Level::On);
        let states: Vec<String> = h
            .cloud
            .published_on("esp32_02/gpio/4/state")
            .into_iter()
            .map(|p| p.payload)
            .collect();
        assert_eq!(states, vec!["ON", "OFF", "ON"]);
    }

    #[tokio::test]
    async fn apply_reports_rejection_reason() {
        let h = spawn_engine();
        let err = request_apply(&h.inputs, PinId(9), Action::On).await.unwrap_err();
        assert!(err.to_string().contains("pin 9"), "got: {err}");

        let applied = request_apply(&h.inputs, PinId(2), Action::Toggle)
            .await
            .expect("apply");
        assert_eq!(applied.level, Level::On);
        assert!(applied.persisted);
        assert!(applied.published.is_empty(), "no link connected");
    }

    #[tokio::test]
    async fn shutdown_announces_offline_on_connected_cloud() {
        let h = spawn_engine();
        h.cloud.set_state(ConnectionState::Connected);
        h.inputs
            .send(EngineInput::Link(LinkEvent::Connected(LinkId::Cloud)))
            .await
            .expect("send");
        // Round-trip through the queue so the connect has been handled.
        request_status(&h.inputs).await.expect("status");

        h.shutdown.send(()).expect("shutdown");
        h.task.await.expect("join").expect("engine task");

        let status = h.cloud.published_on("esp32_02/system/status");
        assert_eq!(status.last().map(|p| p.payload.as_str()), Some("offline"));
    }
}
