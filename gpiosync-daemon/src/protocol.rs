//! Control-socket wire format and the blocking client the CLI uses.
//!
//! Each connection carries newline-delimited JSON: one [`DaemonRequest`] in,
//! one [`DaemonResponse`] out. `set` requests are queued behind link traffic
//! on the engine task, so a reply reflects the level actually applied.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gpiosync_core::{Action, PinId};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request: `status`, `set` (with `pin` and
/// `action`) or `stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<PinId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

impl DaemonRequest {
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            pin: None,
            action: None,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// One round trip on the control socket: write `request` as a single JSON
/// line, read back the daemon's single-line reply.
///
/// A missing socket file, or one nobody is accepting on, means no agent is
/// running for `home` and maps to [`DaemonError::DaemonNotRunning`].
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let stream = UnixStream::connect(&socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        }
        _ => io_err(&socket, err),
    })?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    (&stream)
        .write_all(line.as_bytes())
        .map_err(|e| io_err(&socket, e))?;

    let mut reply = String::new();
    let read = BufReader::new(&stream)
        .read_line(&mut reply)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(format!(
            "agent closed the control socket before answering '{}'",
            request.cmd
        )));
    }
    Ok(serde_json::from_str(reply.trim_end())?)
}

/// How often `request_status` retries while the agent is still binding.
const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Snapshot of pin levels, link states and heartbeat counters.
///
/// Retries briefly so a status issued right after `daemon start` does not
/// race the agent's bind.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::command("status");
    let mut attempt = 1;
    loop {
        match send_request(home, &request) {
            Ok(response) => return into_reply(response),
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                attempt += 1;
                sleep(STATUS_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Ask the agent to stop the reporter, announce `offline` and exit.
pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    into_reply(send_request(home, &DaemonRequest::command("stop"))?).map(|_| ())
}

/// Ask the running daemon to apply `action` to `pin`. The reply carries the
/// applied level, or the reason the command was rejected.
pub fn request_set(home: &Path, pin: PinId, action: Action) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        cmd: "set".to_string(),
        pin: Some(pin),
        action: Some(action),
    };
    into_reply(send_request(home, &request)?)
}

// A rejected command comes back as `ok: false` with the engine's reason.
fn into_reply(response: DaemonResponse) -> Result<Value, DaemonError> {
    match (response.ok, response.error) {
        (true, _) => Ok(response.data.unwrap_or(Value::Null)),
        (false, Some(reason)) => Err(DaemonError::Protocol(reason)),
        (false, None) => Err(DaemonError::Protocol(
            "agent rejected the request without a reason".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_request_wire_format() {
        let request = DaemonRequest {
            cmd: "set".to_string(),
            pin: Some(PinId(2)),
            action: Some(Action::Toggle),
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"cmd":"set","pin":2,"action":"TOGGLE"}"#
        );
        assert_eq!(
            serde_json::to_string(&DaemonRequest::command("status")).unwrap(),
            r#"{"cmd":"status"}"#
        );
    }

    #[test]
    fn request_without_optional_fields_parses() {
        let request: DaemonRequest = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(request.cmd, "stop");
        assert!(request.pin.is_none() && request.action.is_none());
    }

    #[test]
    fn missing_socket_reports_not_running() {
        let home = TempDir::new().unwrap();
        let err = send_request(home.path(), &DaemonRequest::command("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }

    #[test]
    fn rejected_set_surfaces_engine_reason() {
        let err = into_reply(DaemonResponse::error("pin 7 is not a valid output")).unwrap_err();
        assert!(matches!(&err, DaemonError::Protocol(reason) if reason.contains("pin 7")));

        let bare = DaemonResponse {
            ok: false,
            data: None,
            error: None,
        };
        assert!(into_reply(bare).unwrap_err().to_string().contains("without a reason"));
    }

    #[test]
    fn stale_socket_file_reports_not_running() {
        let home = TempDir::new().unwrap();
        let socket = socket_path(home.path());
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        let listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        drop(listener);

        let err = request_stop(home.path()).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }
}
