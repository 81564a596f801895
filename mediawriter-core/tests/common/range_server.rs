//! Minimal HTTP/1.1 server with Range support for the download tests.
//!
//! Serves one static body. Each connection handles a single GET; the reply to
//! the n-th request can be scripted (status code, dropped connection, stall),
//! requests past the end of the script are served normally. Every request's
//! `Range` header is logged so tests can assert what the client asked for.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How to answer one request.
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    /// Honour the request.
    Serve,
    /// Announce the full reply, send this many body bytes, then close.
    DropAfter(usize),
    /// Announce the full reply, send this many body bytes, then go quiet.
    StallAfter(usize),
    /// Answer with this status and an empty body.
    Status(u16),
    /// Answer 206 with the body from this offset, whatever was asked for.
    WrongRange(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// How long a stalled reply stays silent before closing.
    pub stall_for: Duration,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            stall_for: Duration::from_secs(3),
        }
    }
}

pub struct RangeServer {
    pub url: String,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
}

impl RangeServer {
    /// `Range` header of every request so far, in arrival order.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

/// Starts a server in a background thread serving `body`. The server runs
/// until the process exits.
pub fn start(body: Vec<u8>) -> RangeServer {
    start_scripted(body, Vec::new(), RangeServerOptions::default())
}

pub fn start_scripted(body: Vec<u8>, script: Vec<Reply>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let script = Arc::new(Mutex::new(VecDeque::from(script)));
    let ranges = Arc::new(Mutex::new(Vec::new()));
    {
        let ranges = Arc::clone(&ranges);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let body = Arc::clone(&body);
                let script = Arc::clone(&script);
                let ranges = Arc::clone(&ranges);
                thread::spawn(move || handle(stream, &body, &script, &ranges, opts));
            }
        });
    }
    RangeServer {
        url: format!("http://127.0.0.1:{port}/image.iso"),
        ranges,
    }
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    script: &Mutex<VecDeque<Reply>>,
    ranges: &Mutex<Vec<Option<String>>>,
    opts: RangeServerOptions,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (method, range_header) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    ranges.lock().unwrap().push(range_header.clone());
    let reply = script.lock().unwrap().pop_front().unwrap_or(Reply::Serve);

    if let Reply::Status(code) = reply {
        let response =
            format!("HTTP/1.1 {code} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    let total = body.len() as u64;
    let start = match reply {
        Reply::WrongRange(start) => Some(start),
        _ => range_header
            .as_deref()
            .filter(|_| opts.support_ranges)
            .and_then(parse_range_start),
    };
    let (status, content_range, slice) = match start {
        Some(start) if start >= total => {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes());
            return;
        }
        Some(start) => (
            "206 Partial Content",
            format!("bytes {start}-{}/{total}", total - 1),
            &body[start as usize..],
        ),
        None => ("200 OK", format!("bytes 0-{}/{total}", total.saturating_sub(1)), body),
    };

    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Range: {content_range}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
        slice.len()
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    match reply {
        Reply::DropAfter(n) => {
            let _ = stream.write_all(&slice[..n.min(slice.len())]);
            let _ = stream.flush();
        }
        Reply::StallAfter(n) => {
            let _ = stream.write_all(&slice[..n.min(slice.len())]);
            let _ = stream.flush();
            thread::sleep(opts.stall_for);
        }
        _ => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns the method and the raw `Range` header value, if any.
fn parse_request(request: &str) -> (&str, Option<String>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    (method, range)
}

/// Start offset of an open-ended `bytes=N-` range.
fn parse_range_start(value: &str) -> Option<u64> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, _) = spec.split_once('-')?;
    start.trim().parse().ok()
}
