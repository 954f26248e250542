use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rowsync_core::paths::socket_path;

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            force: None,
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

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Status surface plus daemon uptime. Retries briefly so a `status` issued
/// right after `daemon start` does not race the socket bind.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Ask the daemon to run a sync. `force` drops the cached snapshot first.
pub fn request_sync(home: &Path, force: bool) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        force: Some(force),
        ..DaemonRequest::new("sync")
    };
    response_into_data(send_request(home, &request)?)
}

/// Prometheus exposition text from the daemon's recorder.
pub fn request_metrics(home: &Path) -> Result<String, DaemonError> {
    match response_into_data(send_request(home, &DaemonRequest::new("metrics"))?)? {
        Value::String(text) => Ok(text),
        other => Err(DaemonError::Protocol(format!(
            "expected metrics text, got {other}"
        ))),
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    use rowsync_core::paths;
    use serde_json::json;
    use tempfile::TempDir;

    /// Answer exactly one request with `reply`, handing back what was received.
    fn serve_once(home: &Path, reply: DaemonResponse) -> thread::JoinHandle<DaemonRequest> {
        std::fs::create_dir_all(paths::root(home)).unwrap();
        let listener = UnixListener::bind(paths::socket_path(home)).unwrap();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let request: DaemonRequest = serde_json::from_str(line.trim()).unwrap();
            let mut writer = stream;
            writeln!(writer, "{}", serde_json::to_string(&reply).unwrap()).unwrap();
            request
        })
    }

    #[test]
    fn missing_socket_reports_not_running() {
        let home = TempDir::new().unwrap();
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn sync_request_carries_force_flag() {
        let home = TempDir::new().unwrap();
        let server = serve_once(home.path(), DaemonResponse::ok(json!({"triggered": true})));

        let data = request_sync(home.path(), true).unwrap();
        assert_eq!(data["triggered"], json!(true));

        let received = server.join().unwrap();
        assert_eq!(received.cmd, "sync");
        assert_eq!(received.force, Some(true));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let home = TempDir::new().unwrap();
        let server = serve_once(home.path(), DaemonResponse::error("unknown command 'x'"));

        let err = request_stop(home.path()).unwrap_err();
        server.join().unwrap();
        match err {
            DaemonError::Protocol(message) => assert!(message.contains("unknown command")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn metrics_payload_must_be_text() {
        let home = TempDir::new().unwrap();
        let server = serve_once(
            home.path(),
            DaemonResponse::ok(json!("rowsync_syncs_total 3\n")),
        );
        let text = request_metrics(home.path()).unwrap();
        server.join().unwrap();
        assert!(text.starts_with("rowsync_syncs_total"));
    }

    #[test]
    fn force_is_omitted_when_unset() {
        let encoded = serde_json::to_string(&DaemonRequest::new("status")).unwrap();
        assert_eq!(encoded, r#"{"cmd":"status"}"#);
        let decoded: DaemonRequest = serde_json::from_str(r#"{"cmd":"sync"}"#).unwrap();
        assert_eq!(decoded.force, None);
    }
}
