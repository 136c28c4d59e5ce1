use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use gpiosync_core::config::{self, AgentConfig, GpioBackend, GpioConfig};
use gpiosync_core::{LinkId, TopicScheme};
use gpiosync_engine::{
    ChannelLink, EngineParts, FileStore, MemoryLink, PinController, SimulatedPins, SyncEngine,
    SysfsPins,
};

use crate::error::{io_err, DaemonError};
use crate::mqtt::{MqttDriver, MqttLink};
use crate::paths::{run_dir, socket_path, state_dir};
use crate::processor::{self, engine_task, EngineInput, ENGINE_QUEUE_CAPACITY};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
///
/// Startup is strict: a live control socket, a config that does not load, a
/// store that does not open, or a pin that cannot be restored aborts before
/// any pin is driven or any link connects. The socket is claimed first so a
/// refused second instance never touches the hardware or the brokers.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let config = config::load_at(&home)?;
    ensure_runtime_dirs(&home)?;

    let socket = socket_path(&home);
    let listener = bind_control_socket(&socket)?;
    let Assembled {
        engine,
        mqtt_links,
        drivers,
    } = match assemble(&home, &config) {
        Ok(assembled) => assembled,
        Err(err) => {
            let _ = fs::remove_file(&socket);
            return Err(err);
        }
    };

    let started_at_unix = unix_seconds_now();
    let (input_tx, input_rx) = mpsc::channel::<EngineInput>(ENGINE_QUEUE_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    // Every receiver exists before any task can send shutdown.
    let engine_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = engine_task(engine, input_rx, mqtt_links, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let driver_handles: Vec<(LinkId, JoinHandle<Result<(), DaemonError>>)> = drivers
        .into_iter()
        .map(|driver| spawn_driver(driver, input_tx.clone(), shutdown_tx.clone()))
        .collect();

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(signal_task(shutdown, shutdown_rx))
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let server = SocketServer {
            home: home.clone(),
            socket,
            device_id: config.device_id.clone(),
            inputs: input_tx.clone(),
            shutdown_tx: shutdown.clone(),
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = server.serve(listener, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(input_tx);

    tracing::info!(
        device_id = %config.device_id,
        pins = config.pins.len(),
        "gpiosync agent running",
    );

    let (engine_result, socket_result, signal_result) =
        tokio::join!(engine_handle, socket_handle, signal_handle);
    handle_join("engine", engine_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    for (id, handle) in driver_handles {
        handle_join(&format!("{id}_link"), handle.await)?;
    }
    Ok(())
}

struct Assembled {
    engine: SyncEngine,
    mqtt_links: Vec<Arc<MqttLink>>,
    drivers: Vec<MqttDriver>,
}

/// Open the store, build pins and links, and restore the configured pins.
fn assemble(home: &Path, config: &AgentConfig) -> Result<Assembled, DaemonError> {
    let store = FileStore::open(&state_dir(home), &config.storage.namespace)?;
    tracing::info!(path = %store.path().display(), "state store opened");
    let controller = build_controller(&config.gpio);
    let topics = TopicScheme::new(config.device_id.clone());

    let mut links: Vec<Arc<dyn ChannelLink>> = Vec::new();
    let mut mqtt_links = Vec::new();
    let mut drivers = Vec::new();
    for id in LinkId::ALL {
        let section = config.link(id);
        if section.enabled {
            let (link, driver) = MqttLink::connect(id, section, &topics)?;
            links.push(link.clone());
            mqtt_links.push(link);
            drivers.push(driver);
        } else {
            tracing::info!(link = %id, "link disabled in config");
            links.push(Arc::new(MemoryLink::new(id)));
        }
    }
    let [cloud, local]: [Arc<dyn ChannelLink>; 2] = links
        .try_into()
        .map_err(|_| DaemonError::Protocol("expected exactly two links".to_string()))?;

    let mut engine = SyncEngine::new(EngineParts {
        topics,
        pins: config.pins.clone(),
        controller,
        store: Arc::new(store),
        cloud,
        local,
        heartbeat_interval: config.heartbeat_interval(),
    });
    engine.boot()?;
    Ok(Assembled {
        engine,
        mqtt_links,
        drivers,
    })
}

/// Claim the control socket: refuse a live one, clear a stale one, bind
/// and restrict it to the owner.
fn bind_control_socket(socket: &Path) -> Result<UnixListener, DaemonError> {
    prepare_socket_for_bind(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    if let Err(err) = set_socket_permissions(socket) {
        let _ = fs::remove_file(socket);
        return Err(err);
    }
    tracing::info!(socket = %socket.display(), "control socket listening");
    Ok(listener)
}

fn spawn_driver(
    driver: MqttDriver,
    inputs: mpsc::Sender<EngineInput>,
    shutdown: broadcast::Sender<()>,
) -> (LinkId, JoinHandle<Result<(), DaemonError>>) {
    let id = driver.id();
    let shutdown_rx = shutdown.subscribe();
    let handle = tokio::spawn(async move {
        let result = driver.run(inputs, shutdown_rx).await;
        if result.is_err() {
            let _ = shutdown.send(());
        }
        result
    });
    (id, handle)
}

pub fn build_controller(gpio: &GpioConfig) -> Arc<dyn PinController> {
    match gpio.backend {
        GpioBackend::Sysfs => {
            tracing::info!(root = %gpio.sysfs_root.display(), "using sysfs gpio");
            Arc::new(SysfsPins::new(&gpio.sysfs_root, gpio.valid_outputs.clone()))
        }
        GpioBackend::Simulated => {
            tracing::warn!("using simulated gpio; no hardware will be driven");
            Arc::new(SimulatedPins::new(gpio.valid_outputs.clone()))
        }
    }
}

async fn signal_task(
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

struct SocketServer {
    home: PathBuf,
    socket: PathBuf,
    device_id: String,
    inputs: mpsc::Sender<EngineInput>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
}

impl SocketServer {
    async fn serve(
        self,
        listener: UnixListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => break Err(io_err(&self.socket, err)),
                    };
                    let home = self.home.clone();
                    let device_id = self.device_id.clone();
                    let inputs = self.inputs.clone();
                    let shutdown_tx = self.shutdown_tx.clone();
                    let started_at_unix = self.started_at_unix;
                    tokio::spawn(async move {
                        if let Err(err) = handle_socket_client(
                            stream,
                            home,
                            device_id,
                            inputs,
                            shutdown_tx,
                            started_at_unix,
                        ).await {
                            tracing::error!(error = %err, "socket client error");
                        }
                    });
                }
            }
        };

        drop(listener);
        if self.socket.exists() {
            let _ = fs::remove_file(&self.socket);
        }
        result
    }
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    device_id: String,
    inputs: mpsc::Sender<EngineInput>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match processor::request_status(&inputs).await {
                Ok(status) => DaemonResponse::ok(build_status_payload(
                    &home,
                    &device_id,
                    json!(status),
                    started_at_unix,
                )),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "set" => match (request.pin, request.action) {
                (Some(pin), Some(action)) => {
                    match processor::request_apply(&inputs, pin, action).await {
                        Ok(applied) => DaemonResponse::ok(json!(applied)),
                        Err(DaemonError::Protocol(reason)) => DaemonResponse::error(reason),
                        Err(err) => DaemonResponse::error(err.to_string()),
                    }
                }
                _ => DaemonResponse::error("set requires 'pin' and 'action'"),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }
    Ok(())
}

fn build_status_payload(home: &Path, device_id: &str, engine: Value, started_at_unix: u64) -> Value {
    json!({
        "running": true,
        "device_id": device_id,
        "started_at_unix": started_at_unix,
        "socket": socket_path(home).display().to_string(),
        "pins": engine["pins"],
        "links": engine["links"],
        "reporter": engine["reporter"],
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [state_dir(home), run_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `GPIOSYNC_LOG_FORMAT=json` switches to one JSON object per line.
const LOG_FORMAT_ENV: &str = "GPIOSYNC_LOG_FORMAT";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

/// Validate the config a daemon start would use, without starting anything.
pub fn check_config(home: &Path) -> Result<AgentConfig, DaemonError> {
    Ok(config::load_at(home)?)
}
