//! Local HTTP surface.
//!
//! A hand-rolled HTTP/1.1 server over `TcpListener`: the thin caller layer
//! above the pipeline, kept deliberately small. Each accepted connection is
//! handled on its own thread so a long-lived MJPEG stream never starves
//! session control requests. No authentication; bind to loopback.
//!
//! Routes:
//! - `GET  /health`           liveness + capture/session state
//! - `GET  /stream`           multipart x-mixed-replace JPEG frames
//! - `POST /session/start`    `{power, catalyst, minutes, seconds}`
//! - `POST /session/stop`     idempotent
//! - `POST /annotate`         `{timestamp, text}`, accepted fire-and-forget
//! - `GET  /data/recent`      last sensor rows, formatted
//! - `GET  /download/log`     current session's CSV
//! - `GET  /download/video`   current session's AVI

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::{Artifact, Pipeline};
use crate::{PipelineError, SessionKey};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8650".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: Arc<Pipeline>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let pipeline = self.pipeline;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, pipeline, shutdown_thread) {
                log::error!("api server stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                // Connection threads outlive the accept loop only until the
                // hub closes or the peer disconnects.
                let pipeline = pipeline.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &pipeline) {
                        log::warn!("api request failed: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    power: String,
    catalyst: String,
    minutes: u32,
    seconds: u32,
}

#[derive(Debug, Deserialize)]
struct AnnotateRequest {
    timestamp: String,
    text: String,
}

fn handle_connection(mut stream: TcpStream, pipeline: &Pipeline) -> Result<()> {
    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "capturing": pipeline.is_capturing(),
                "session_active": pipeline.session_active(),
            });
            write_json_response(&mut stream, 200, &body.to_string())
        }
        ("GET", "/stream") => stream_frames(stream, pipeline),
        ("POST", "/session/start") => {
            let parsed: StartSessionRequest = match serde_json::from_slice(&request.body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let body = serde_json::json!({"error": err.to_string()});
                    return write_json_response(&mut stream, 400, &body.to_string());
                }
            };
            let key = match SessionKey::from_parts(
                &parsed.power,
                &parsed.catalyst,
                parsed.minutes,
                parsed.seconds,
            ) {
                Ok(key) => key,
                Err(err) => {
                    let body = serde_json::json!({"error": err.to_string()});
                    return write_json_response(&mut stream, 400, &body.to_string());
                }
            };
            match pipeline.start_session(key.clone()) {
                Ok(()) => {
                    let body =
                        serde_json::json!({"status": "started", "session": key.file_stem()});
                    write_json_response(&mut stream, 200, &body.to_string())
                }
                Err(err)
                    if matches!(
                        err.downcast_ref::<PipelineError>(),
                        Some(PipelineError::SessionInProgress)
                    ) =>
                {
                    write_json_response(&mut stream, 409, r#"{"error":"session_in_progress"}"#)
                }
                Err(err) => {
                    let body = serde_json::json!({"error": err.to_string()});
                    write_json_response(&mut stream, 500, &body.to_string())
                }
            }
        }
        ("POST", "/session/stop") => {
            pipeline.stop_session();
            write_json_response(&mut stream, 200, r#"{"status":"stopped"}"#)
        }
        ("POST", "/annotate") => {
            let parsed: AnnotateRequest = match serde_json::from_slice(&request.body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let body = serde_json::json!({"error": err.to_string()});
                    return write_json_response(&mut stream, 400, &body.to_string());
                }
            };
            pipeline.submit_annotation(&parsed.timestamp, &parsed.text);
            write_json_response(&mut stream, 202, r#"{"status":"accepted"}"#)
        }
        ("GET", "/data/recent") => match pipeline.recent_rows() {
            Ok(rows) => {
                let body = serde_json::to_string(&rows)?;
                write_json_response(&mut stream, 200, &body)
            }
            Err(err) => {
                let body = serde_json::json!({"error": err.to_string()});
                write_json_response(&mut stream, 500, &body.to_string())
            }
        },
        ("GET", "/download/log") => send_artifact(&mut stream, pipeline, Artifact::SensorLog),
        ("GET", "/download/video") => send_artifact(&mut stream, pipeline, Artifact::Video),
        ("GET", _) => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
        _ => write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#),
    }
}

fn send_artifact(stream: &mut TcpStream, pipeline: &Pipeline, artifact: Artifact) -> Result<()> {
    match pipeline.artifact_path(artifact) {
        Ok(path) => {
            let bytes = std::fs::read(&path)?;
            write_response(stream, 200, "application/octet-stream", &bytes)
        }
        Err(err)
            if matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::NotFound(_))
            ) =>
        {
            write_json_response(stream, 404, r#"{"error":"not_found"}"#)
        }
        Err(err) => {
            let body = serde_json::json!({"error": err.to_string()});
            write_json_response(stream, 500, &body.to_string())
        }
    }
}

/// Serve the live MJPEG stream until the hub closes or the peer disconnects.
fn stream_frames(mut stream: TcpStream, pipeline: &Pipeline) -> Result<()> {
    let frames = pipeline.subscribe();
    stream.set_read_timeout(None)?;
    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
          Cache-Control: no-store\r\n\
          Connection: close\r\n\r\n",
    )?;

    for frame in frames {
        let part = format!(
            "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            frame.byte_len()
        );
        if stream.write_all(part.as_bytes()).is_err()
            || stream.write_all(frame.jpeg()).is_err()
            || stream.write_all(b"\r\n").is_err()
        {
            // Viewer went away; dropping the stream unsubscribes it.
            break;
        }
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .ok_or_else(|| anyhow!("connection closed mid-request"))?;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .map(|value| value.parse())
        .transpose()
        .map_err(|_| anyhow!("invalid content-length"))?
        .unwrap_or(0);
    if header_end + 4 + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    while data.len() < header_end + 4 + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed mid-body"));
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = data[header_end + 4..header_end + 4 + content_length].to_vec();

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        202 => "HTTP/1.1 202 Accepted",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}
