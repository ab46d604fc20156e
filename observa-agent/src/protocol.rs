use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, AgentError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub cmd: String,
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
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

/// Send one JSON request to the agent socket and return one response.
pub fn send_request(home: &Path, request: &AgentRequest) -> Result<AgentResponse, AgentError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(AgentError::AgentNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            AgentError::AgentNotRunning {
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
        return Err(AgentError::Protocol(
            "agent closed connection before responding".to_string(),
        ));
    }

    let response: AgentResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, AgentError> {
    let request = AgentRequest {
        cmd: "status".to_string(),
    };

    let mut last_not_running: Option<AgentError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ AgentError::AgentNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        AgentError::Protocol("agent status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), AgentError> {
    let response = send_request(
        home,
        &AgentRequest {
            cmd: "stop".to_string(),
        },
    )?;
    response_into_data(response).map(|_| ())
}

/// Trigger one reconciliation cycle and return its summary.
pub fn request_sync(home: &Path) -> Result<Value, AgentError> {
    let response = send_request(
        home,
        &AgentRequest {
            cmd: "sync".to_string(),
        },
    )?;
    response_into_data(response)
}

fn response_into_data(response: AgentResponse) -> Result<Value, AgentError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(AgentError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown agent error".to_string()),
        ))
    }
}
