//! JSON-over-HTTP/1.1 calls on a unix domain socket.
//!
//! Reads use a short socket timeout so a blocked call notices cancellation of
//! its [`CallContext`] promptly.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::cancel::CallContext;
use crate::error::TetherError;

const READ_SLICE: Duration = Duration::from_millis(100);
const MAX_HEADER_BYTES: usize = 1024 * 1024;
const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SocketTransport {
    socket_path: PathBuf,
    host: &'static str,
}

#[derive(Debug)]
struct RawResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

/// One server-sent event frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

impl SocketTransport {
    pub fn new(socket_path: impl Into<PathBuf>, host: &'static str) -> Self {
        Self {
            socket_path: socket_path.into(),
            host,
        }
    }

    /// The socket file is the liveness marker of the process behind it.
    pub fn exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub fn call<Req, Resp>(
        &self,
        ctx: &CallContext,
        path: &str,
        request: &Req,
    ) -> Result<Resp, TetherError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        debug!(trace_id = ctx.trace_id(), host = self.host, path, "rpc call");
        let mut stream = self.open(ctx, "POST", path, Some(&body), "application/json")?;
        let raw = read_limited(&mut stream, ctx, MAX_RESPONSE_BYTES).map_err(|err| match err {
            TetherError::Rpc(detail) => TetherError::Rpc(format!("{} {} {}", self.host, path, detail)),
            other => other,
        })?;
        let response = parse_response(&raw)?;
        if response.status >= 400 {
            return Err(rpc_failure(self.host, path, &response));
        }
        if response.body.is_empty() {
            return serde_json::from_slice(b"{}").map_err(TetherError::from);
        }
        serde_json::from_slice(&response.body).map_err(|err| {
            TetherError::Rpc(format!(
                "{} {} returned invalid JSON: {}",
                self.host, path, err
            ))
        })
    }

    /// Open a streaming call whose body is a sequence of server-sent events.
    pub fn stream(&self, ctx: &CallContext, path: &str) -> Result<EventStream, TetherError> {
        debug!(trace_id = ctx.trace_id(), host = self.host, path, "rpc stream");
        let mut stream = self.open(ctx, "GET", path, None, "text/event-stream")?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
                break pos;
            }
            let read = read_cancellable(&mut stream, ctx, &mut chunk)?;
            if read == 0 {
                return Err(TetherError::Rpc(format!(
                    "{} {} closed before sending headers",
                    self.host, path
                )));
            }
            buf.extend_from_slice(&chunk[..read]);
            if buf.len() > MAX_HEADER_BYTES {
                return Err(TetherError::Rpc("response headers too large".to_string()));
            }
        };
        let (status, headers) = parse_head(&buf[..header_end])?;
        let pending = buf[header_end + 4..].to_vec();
        if status >= 400 {
            let mut body = pending;
            let _ = (&mut stream)
                .take(MAX_HEADER_BYTES as u64)
                .read_to_end(&mut body);
            return Err(rpc_failure(
                self.host,
                path,
                &RawResponse {
                    status,
                    headers,
                    body,
                },
            ));
        }
        Ok(EventStream {
            stream,
            ctx: ctx.clone(),
            pending,
        })
    }

    #[cfg(unix)]
    fn open(
        &self,
        ctx: &CallContext,
        method: &str,
        path: &str,
        body: Option<&[u8]>,
        accept: &str,
    ) -> Result<UnixStream, TetherError> {
        ctx.check()?;
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|err| {
            TetherError::Rpc(format!(
                "failed to connect to {} socket {}: {}",
                self.host,
                self.socket_path.display(),
                err
            ))
        })?;
        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nAccept: {}\r\nX-Trace-Id: {}\r\n",
            method,
            path,
            self.host,
            accept,
            ctx.trace_id()
        );
        if let Some(body) = body {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str("Content-Length: ");
            request.push_str(&body.len().to_string());
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes())?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }
        stream.set_read_timeout(Some(READ_SLICE))?;
        Ok(stream)
    }

    #[cfg(not(unix))]
    fn open(
        &self,
        _ctx: &CallContext,
        _method: &str,
        _path: &str,
        _body: Option<&[u8]>,
        _accept: &str,
    ) -> Result<UnixStream, TetherError> {
        Err(TetherError::Config(
            "daemon sockets are only supported on unix hosts".to_string(),
        ))
    }
}

#[cfg(not(unix))]
type UnixStream = std::net::TcpStream;

pub struct EventStream {
    stream: UnixStream,
    ctx: CallContext,
    pending: Vec<u8>,
}

impl EventStream {
    /// Next complete frame, or `None` once the server closes the stream.
    pub fn next_event(&mut self) -> Result<Option<SseEvent>, TetherError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = self.pending.windows(2).position(|window| window == b"\n\n") {
                let frame: Vec<u8> = self.pending.drain(..pos + 2).collect();
                if let Some(event) = parse_sse_frame(&String::from_utf8_lossy(&frame)) {
                    return Ok(Some(event));
                }
                continue;
            }
            let read = read_cancellable(&mut self.stream, &self.ctx, &mut chunk)?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Read until EOF, failing once more than `limit` bytes arrive.
fn read_limited<R: Read>(
    stream: &mut R,
    ctx: &CallContext,
    limit: usize,
) -> Result<Vec<u8>, TetherError> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = read_cancellable(stream, ctx, &mut chunk)?;
        if read == 0 {
            return Ok(raw);
        }
        raw.extend_from_slice(&chunk[..read]);
        if raw.len() > limit {
            return Err(TetherError::Rpc(format!("response exceeds {limit} bytes")));
        }
    }
}

fn read_cancellable<R: Read>(
    stream: &mut R,
    ctx: &CallContext,
    chunk: &mut [u8],
) -> Result<usize, TetherError> {
    loop {
        match stream.read(chunk) {
            Ok(read) => return Ok(read),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                ctx.check()?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(TetherError::Io(err)),
        }
    }
}

fn parse_head(head: &[u8]) -> Result<(u16, BTreeMap<String, String>), TetherError> {
    let header_text = String::from_utf8_lossy(head);
    let mut lines = header_text.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| TetherError::Rpc("response missing status line".to_string()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TetherError::Rpc("response has invalid status".to_string()))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Ok((status, headers))
}

fn parse_response(raw: &[u8]) -> Result<RawResponse, TetherError> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TetherError::Rpc("response missing header delimiter".to_string()))?;
    let (status, headers) = parse_head(&raw[..split])?;
    let mut body = raw[split + 4..].to_vec();
    if let Some(length) = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
    {
        body.truncate(length);
    }
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

fn rpc_failure(host: &str, path: &str, response: &RawResponse) -> TetherError {
    let text = String::from_utf8_lossy(&response.body).trim().to_string();
    let is_json = response
        .headers
        .get("content-type")
        .is_some_and(|value| value.contains("json"));
    let detail = is_json
        .then(|| serde_json::from_str::<serde_json::Value>(&text).ok())
        .flatten()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or(text);
    debug!(host, path, status = response.status, "rpc failure");
    TetherError::Rpc(format!(
        "{} {} failed (HTTP {}): {}",
        host, path, response.status, detail
    ))
}

fn parse_sse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("id:") {
            event.id = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            event.event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}
