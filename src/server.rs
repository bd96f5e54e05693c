//! IPC endpoint: a UNIX stream socket speaking one JSON object per
//! connection.
//!
//! The acceptor runs on its own thread; every accepted client is
//! handled on a detached worker which reads one request frame,
//! dispatches it under the service lock, writes one reply frame and
//! closes. Failures are answered with `{"Error": "<chain>"}` and never
//! stop the server.

use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use crate::error::{Context, Error, Result};
use crate::fan::FanMode;
use crate::service::Service;

const MAX_REQUEST_SIZE: usize = 64 * 1024;
const MAX_ACCEPT_FAILURES: u32 = 100;
const LISTEN_BACKLOG: libc::c_int = 3;

pub struct Server {
    listener: UnixListener,
    path: PathBuf,
}

impl Server {
    /// Bind the socket, make it world-writable so unprivileged clients
    /// can connect, and narrow the kernel backlog.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path).context(path.display().to_string())?;
        }
        let listener = UnixListener::bind(path).context(path.display().to_string())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o666))
            .context(path.display().to_string())?;
        unsafe { libc::listen(listener.as_raw_fd(), LISTEN_BACKLOG) };
        info!(path = %path.display(), "IPC server listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Blocking accept loop, one detached worker per client. After 100
    /// consecutive accept failures the quit flag is raised.
    pub fn run(&self, service: Arc<Mutex<Service>>, quit: &AtomicBool) {
        let mut failures: u32 = 0;
        while !quit.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    failures = 0;
                    let service = Arc::clone(&service);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, &service) {
                            warn!(error = %e.chain(), "client handler failed");
                        }
                    });
                }
                Err(e) => {
                    // accept() reports EBADF once the socket has been
                    // shut down for teardown; that is not a failure.
                    if quit.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!("giving up accepting connections after {failures} failures");
                        quit.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }

    /// Interrupt a blocked `accept` from another thread.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR) };
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn handle_client(mut stream: UnixStream, service: &Arc<Mutex<Service>>) -> Result<()> {
    let reply = match read_frame(&mut stream).and_then(|request| dispatch(service, &request)) {
        Ok(value) => value,
        Err(e) => json!({ "Error": e.chain() }),
    };
    let raw = serde_json::to_vec(&reply)?;
    stream.write_all(&raw)?;
    Ok(())
}

/// Read until the buffer parses as one complete JSON value or the peer
/// shuts down its writing end.
fn read_frame(stream: &mut UnixStream) -> Result<Value> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_SIZE {
            return Err(Error::Protocol("Request too large".to_string()));
        }
        if let Ok(value) = serde_json::from_slice::<Value>(&buf) {
            return Ok(value);
        }
    }
    serde_json::from_slice(&buf).map_err(|_| Error::Protocol("Invalid JSON".to_string()))
}

/// Decode and execute one request under the service lock.
pub fn dispatch(service: &Arc<Mutex<Service>>, request: &Value) -> Result<Value> {
    let Some(object) = request.as_object() else {
        return Err(Error::Protocol("Not a JSON object".to_string()));
    };
    let Some(command) = object.get("Command") else {
        return Err(Error::Protocol("Missing 'Command' field".to_string()));
    };
    let Some(command) = command.as_str() else {
        return Err(Error::Protocol("Command: not a string".to_string()));
    };
    let mut service = service.lock().unwrap();
    match command {
        "set-fan-speed" => set_fan_speed(&mut service, object),
        "status" => status(&service, object),
        _ => Err(Error::Protocol("Invalid command".to_string())),
    }
}

#[derive(Clone, Copy)]
enum SpeedRequest {
    Auto,
    Fixed(f32),
}

fn set_fan_speed(service: &mut Service, args: &Map<String, Value>) -> Result<Value> {
    let mut fan: Option<usize> = None;
    let mut speed: Option<SpeedRequest> = None;
    let fan_count = service.fans.len();

    for (key, value) in args {
        match key.as_str() {
            "Command" => {}
            "Fan" => {
                let Some(index) = value.as_i64() else {
                    return Err(Error::Protocol("Fan: Not an integer".to_string()));
                };
                if index < 0 {
                    return Err(Error::Protocol("Fan: Cannot be negative".to_string()));
                }
                if index as usize >= fan_count {
                    return Err(Error::Protocol("Fan: No such fan available".to_string()));
                }
                fan = Some(index as usize);
            }
            "Speed" => {
                speed = Some(match value {
                    Value::String(s) if s == "auto" => SpeedRequest::Auto,
                    Value::Number(n) => {
                        let percent = n.as_f64().unwrap_or(f64::NAN);
                        if !(0.0..=100.0).contains(&percent) {
                            return Err(Error::Protocol("Speed: Invalid value".to_string()));
                        }
                        SpeedRequest::Fixed(percent as f32)
                    }
                    _ => {
                        return Err(Error::Protocol(
                            "Speed: Invalid type. Either float or 'auto'".to_string(),
                        ));
                    }
                });
            }
            _ => return Err(Error::Protocol("Unknown arguments".to_string())),
        }
    }

    let Some(speed) = speed else {
        return Err(Error::Protocol("Missing argument: Speed".to_string()));
    };

    for i in 0..fan_count {
        if fan.is_none() || fan == Some(i) {
            match speed {
                SpeedRequest::Auto => service.fans[i].fan.set_auto(),
                SpeedRequest::Fixed(percent) => service.fans[i].fan.set_fixed(percent),
            }
            if !service.read_only {
                service.fans[i].fan.ec_flush(service.ec.as_mut())?;
            }
        }
    }

    service.write_target_speeds_to_config()?;
    Ok(json!({ "Status": "OK" }))
}

fn status(service: &Service, args: &Map<String, Value>) -> Result<Value> {
    if args.len() > 1 {
        return Err(Error::Protocol("Unknown arguments".to_string()));
    }
    let fans: Vec<Value> = service
        .fans
        .iter()
        .map(|ftc| {
            json!({
                "Name": ftc.fan.name(),
                "Temperature": ftc.temperature(),
                "AutoMode": ftc.fan.mode() == FanMode::Auto,
                "Critical": ftc.fan.is_critical(),
                "CurrentSpeed": ftc.fan.current_speed(),
                "TargetSpeed": ftc.fan.target_speed(),
                "RequestedSpeed": ftc.fan.requested_speed(),
                "SpeedSteps": ftc.fan.speed_steps(),
            })
        })
        .collect();
    Ok(json!({
        "PID": std::process::id(),
        "SelectedConfigId": service.service_config.selected_config_id,
        "ReadOnly": service.read_only,
        "Fans": fans,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_frame_returns_one_complete_object() {
        let (mut client, mut server_end) = UnixStream::pair().unwrap();
        client
            .write_all(br#"{"Command": "status"}"#)
            .unwrap();
        let value = read_frame(&mut server_end).unwrap();
        assert_eq!(value["Command"], "status");
    }

    #[test]
    fn read_frame_rejects_garbage_after_eof() {
        let (mut client, mut server_end) = UnixStream::pair().unwrap();
        client.write_all(b"{\"Command\": ").unwrap();
        drop(client);
        let err = read_frame(&mut server_end).unwrap_err();
        assert_eq!(err.chain(), "Invalid JSON");
    }
}
