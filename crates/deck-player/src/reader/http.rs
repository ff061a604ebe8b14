//! Plain HTTP/ICY transport for network streams.
//!
//! A connection owns a socket and a fetch thread that copies socket bytes into a cache
//! [`RingBuffer`]. The response header block is parsed out of that same cache (with a
//! rollback point, so an incomplete block can be retried once more bytes arrive); every
//! byte behind it is stream payload.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PlayerError;
use crate::ring_buffer::RingBuffer;

/// Socket read size of the fetch thread.
const FETCH_CHUNK: usize = 4096;
/// Header block scan limit.
const MAX_HEADER_BYTES: usize = 32 * 1024;
/// Wait slice while the cache is full or empty.
const CACHE_WAIT: Duration = Duration::from_millis(150);
/// Socket read timeout, so the fetch thread notices cancellation on a silent server.
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HttpUrl {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: String,
}

impl HttpUrl {
    pub(crate) fn parse(url: &str) -> Result<Self, PlayerError> {
        let Some(rest) = strip_prefix_ignore_case(url, "http://") else {
            return Err(PlayerError::Stream(format!("unsupported url scheme: {url}")));
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| PlayerError::Stream(format!("invalid port in {url}")))?;
                (host, port)
            }
            None => (authority, 80),
        };
        if host.is_empty() {
            return Err(PlayerError::Stream(format!("missing host in {url}")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Resolve a `Location` header value against this URL.
    pub(crate) fn resolve(&self, location: &str) -> String {
        if location.contains("://") {
            return location.to_string();
        }
        if location.starts_with('/') {
            return format!("http://{}:{}{}", self.host, self.port, location);
        }
        let dir = match self.path.rfind('/') {
            Some(i) => &self.path[..=i],
            None => "/",
        };
        format!("http://{}:{}{}{}", self.host, self.port, dir, location)
    }
}

pub(crate) fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

pub(crate) struct CacheState {
    pub(crate) ring: RingBuffer,
    /// Fetch thread hit end of stream (or a socket error).
    pub(crate) eof: bool,
    /// Prebuffer watermark reached; never reset.
    pub(crate) ready: bool,
    /// Reader closed or cancelled.
    pub(crate) closed: bool,
    pub(crate) headers_done: bool,
    /// Total bytes received from the socket.
    pub(crate) received: u64,
}

pub(crate) struct NetShared {
    cache: Mutex<CacheState>,
    cv: Condvar,
    prebuffer: usize,
    title: Mutex<Option<String>>,
    title_updated: AtomicBool,
}

impl NetShared {
    fn new(ring: RingBuffer, prebuffer: usize) -> Self {
        Self {
            cache: Mutex::new(CacheState {
                ring,
                eof: false,
                ready: false,
                closed: false,
                headers_done: false,
                received: 0,
            }),
            cv: Condvar::new(),
            prebuffer,
            title: Mutex::new(None),
            title_updated: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_title(&self, title: String) {
        *self.title.lock().unwrap_or_else(PoisonError::into_inner) = Some(title);
        self.title_updated.store(true, Ordering::Release);
    }

    pub(crate) fn title(&self) -> Option<String> {
        self.title.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn take_title_update(&self) -> bool {
        self.title_updated.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_ready(&self, st: &mut CacheState) {
        if !st.ready && st.headers_done && (st.ring.fill() >= self.prebuffer || st.eof) {
            st.ready = true;
            tracing::debug!(cached_bytes = st.ring.fill(), "network stream ready");
        }
    }

    fn wait<'a>(&self, st: MutexGuard<'a, CacheState>) -> MutexGuard<'a, CacheState> {
        self.cv
            .wait_timeout(st, CACHE_WAIT)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    /// Read payload bytes into `out`.
    ///
    /// With `exact`, waits until `out.len()` bytes are cached; otherwise until at least one
    /// is. At EOF returns whatever is left (possibly 0). Returns 0 once closed.
    pub(crate) fn read(&self, out: &mut [u8], exact: bool) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut st = self.lock();
        loop {
            if st.closed {
                return 0;
            }
            let fill = st.ring.fill();
            let enough = if exact { fill >= out.len() } else { fill > 0 };
            if enough || st.eof {
                let n = fill.min(out.len());
                st.ring.read_into(&mut out[..n]);
                drop(st);
                self.cv.notify_all();
                return n;
            }
            st = self.wait(st);
        }
    }

    fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        drop(st);
        self.cv.notify_all();
    }
}

/// Cloneable view of a network reader's cache for code that no longer owns the reader.
#[derive(Clone)]
pub struct ReaderStatus {
    shared: Arc<NetShared>,
}

impl ReaderStatus {
    pub fn is_ready(&self) -> bool {
        self.shared.lock().ready
    }

    pub fn is_eof(&self) -> bool {
        self.shared.lock().eof
    }

    /// Bytes currently cached.
    pub fn fill(&self) -> usize {
        self.shared.lock().ring.fill()
    }

    /// Total bytes received so far.
    pub fn received(&self) -> u64 {
        self.shared.lock().received
    }

    /// Wait up to `timeout` for new bytes, readiness or EOF. Returns `true` on progress.
    pub fn wait_for_progress(&self, timeout: Duration) -> bool {
        let st = self.shared.lock();
        let before = st.received;
        let (st, _) = self
            .shared
            .cv
            .wait_timeout_while(st, timeout, |s| {
                s.received == before && !s.ready && !s.eof && !s.closed
            })
            .unwrap_or_else(PoisonError::into_inner);
        st.received != before || st.ready || st.eof
    }

    /// Latest in-band stream title.
    pub fn stream_title(&self) -> Option<String> {
        self.shared.title()
    }

    /// Return and reset the "title changed" flag.
    pub fn take_title_update(&self) -> bool {
        self.shared.take_title_update()
    }

    /// Abort the stream: blocked reads return, the fetch thread exits.
    pub fn cancel(&self) {
        self.shared.close();
    }
}

/// Parsed response head.
#[derive(Debug, Default)]
pub(crate) struct ResponseHead {
    pub(crate) status: u16,
    /// Lower-cased keys.
    pub(crate) headers: HashMap<String, String>,
}

impl ResponseHead {
    fn parse(block: &str) -> Result<Self, PlayerError> {
        let mut lines = block.lines();
        let status_line = lines.next().unwrap_or_default().trim();
        let mut parts = status_line.split_whitespace();
        let proto = parts.next().unwrap_or_default();
        if !(proto.starts_with("HTTP/") || proto == "ICY") {
            return Err(PlayerError::Stream(format!(
                "unexpected response line: {status_line:?}"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| PlayerError::Stream(format!("missing status in {status_line:?}")))?;
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        Ok(Self { status, headers })
    }

    pub(crate) fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// One HTTP request/response with its fetch thread.
pub(crate) struct HttpConnection {
    shared: Arc<NetShared>,
    socket: TcpStream,
    fetch: Option<thread::JoinHandle<()>>,
}

impl HttpConnection {
    /// Connect, send the request and start fetching into a fresh cache.
    pub(crate) fn open(
        url: &HttpUrl,
        cache_bytes: usize,
        prebuffer_bytes: usize,
        connect_timeout: Duration,
    ) -> Result<Self, PlayerError> {
        let mut socket = connect(url, connect_timeout)?;
        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: deck/{}\r\nAccept: */*\r\nIcy-MetaData: 1\r\nConnection: close\r\n\r\n",
            url.path,
            url.host,
            env!("CARGO_PKG_VERSION"),
        );
        socket
            .write_all(request.as_bytes())
            .map_err(|e| PlayerError::Stream(format!("sending request to {}: {e}", url.host)))?;
        socket
            .set_read_timeout(Some(SOCKET_READ_TIMEOUT))
            .map_err(|e| PlayerError::Stream(format!("socket setup: {e}")))?;

        let ring = RingBuffer::try_new(cache_bytes)?;
        let shared = Arc::new(NetShared::new(ring, prebuffer_bytes));
        let reader_socket = socket
            .try_clone()
            .map_err(|e| PlayerError::Stream(format!("socket setup: {e}")))?;
        let thread_shared = shared.clone();
        let fetch = thread::Builder::new()
            .name("stream-fetch".to_string())
            .spawn(move || fetch_loop(reader_socket, &thread_shared))
            .map_err(|e| PlayerError::Stream(format!("spawning fetch thread: {e}")))?;

        Ok(Self {
            shared,
            socket,
            fetch: Some(fetch),
        })
    }

    /// Parse the response head out of the cache, waiting up to `timeout` for it to arrive.
    /// Gives up early once `cancel` is set.
    pub(crate) fn read_head(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<ResponseHead, PlayerError> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        loop {
            if st.closed || cancel.load(Ordering::Acquire) {
                return Err(PlayerError::Stream("stream closed".to_string()));
            }
            let available = st.ring.fill().min(MAX_HEADER_BYTES);
            st.ring.mark_rollback_point();
            let peek = st.ring.read(available).unwrap_or_default();
            st.ring.rollback();

            if let Some(end) = find_head_end(&peek) {
                st.ring.read(end);
                st.headers_done = true;
                self.shared.update_ready(&mut st);
                drop(st);
                self.shared.cv.notify_all();
                let block = String::from_utf8_lossy(&peek[..end]);
                return ResponseHead::parse(&block);
            }
            if available >= MAX_HEADER_BYTES {
                return Err(PlayerError::Stream(format!(
                    "response header exceeds {MAX_HEADER_BYTES} bytes"
                )));
            }
            if st.eof {
                return Err(PlayerError::Stream(
                    "connection closed before response header".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(PlayerError::Stream("timed out waiting for response header".to_string()));
            }
            st = self.shared.wait(st);
        }
    }

    pub(crate) fn shared(&self) -> &Arc<NetShared> {
        &self.shared
    }

    pub(crate) fn status(&self) -> ReaderStatus {
        ReaderStatus {
            shared: self.shared.clone(),
        }
    }

    /// Cancel, shut the socket down and join the fetch thread.
    pub(crate) fn close(&mut self) {
        self.shared.close();
        let _ = self.socket.shutdown(Shutdown::Both);
        if let Some(handle) = self.fetch.take() {
            if handle.join().is_err() {
                tracing::warn!("stream fetch thread panicked");
            }
        }
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect(url: &HttpUrl, timeout: Duration) -> Result<TcpStream, PlayerError> {
    let addrs = (url.host.as_str(), url.port)
        .to_socket_addrs()
        .map_err(|e| PlayerError::Stream(format!("resolving {}: {e}", url.host)))?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => {
                tracing::info!(host = url.host.as_str(), %addr, "connected");
                return Ok(socket);
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(PlayerError::Stream(match last_err {
        Some(e) => format!("connecting to {}:{}: {e}", url.host, url.port),
        None => format!("no addresses for {}", url.host),
    }))
}

/// Byte length of the header block including its blank line, if complete.
fn find_head_end(bytes: &[u8]) -> Option<usize> {
    let crlf = bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
    let lf = bytes.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn fetch_loop(mut socket: TcpStream, shared: &NetShared) {
    let mut buf = [0u8; FETCH_CHUNK];
    'fetch: loop {
        if shared.lock().closed {
            break;
        }
        let n = match socket.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "stream read failed");
                break;
            }
        };
        let mut st = shared.lock();
        while !st.ring.write(&buf[..n]) {
            if st.closed {
                break 'fetch;
            }
            st = shared.wait(st);
        }
        st.received += n as u64;
        shared.update_ready(&mut st);
        drop(st);
        shared.cv.notify_all();
    }
    let mut st = shared.lock();
    st.eof = true;
    shared.update_ready(&mut st);
    tracing::debug!(received_bytes = st.received, "stream fetch finished");
    drop(st);
    shared.cv.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_defaults_port_and_path() {
        let url = HttpUrl::parse("http://radio.example").unwrap();
        assert_eq!(url.host, "radio.example");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/");

        let url = HttpUrl::parse("HTTP://host:8000/live.mp3?x=1").unwrap();
        assert_eq!(url.host, "host");
        assert_eq!(url.port, 8000);
        assert_eq!(url.path, "/live.mp3?x=1");
    }

    #[test]
    fn parse_url_rejects_bad_input() {
        assert!(HttpUrl::parse("https://host/").is_err());
        assert!(HttpUrl::parse("http://:80/").is_err());
        assert!(HttpUrl::parse("http://host:notaport/").is_err());
    }

    #[test]
    fn resolve_location_variants() {
        let base = HttpUrl::parse("http://a:81/dir/stream").unwrap();
        assert_eq!(base.resolve("http://b/x"), "http://b/x");
        assert_eq!(base.resolve("/top"), "http://a:81/top");
        assert_eq!(base.resolve("other"), "http://a:81/dir/other");
    }

    #[test]
    fn head_parsing_accepts_icy_and_lowercases_keys() {
        let head = ResponseHead::parse("ICY 200 OK\r\nicy-metaint: 16000\r\nContent-Type: audio/mpeg\r\n")
            .unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.get("content-type").unwrap(), "audio/mpeg");
        assert_eq!(head.headers.get("icy-metaint").unwrap(), "16000");

        let head = ResponseHead::parse("HTTP/1.1 302 Found\r\nLocation: /x\r\n").unwrap();
        assert!(head.is_redirect());
        assert!(ResponseHead::parse("garbage\r\n").is_err());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"HTTP/1.0 200 OK\r\n\r\nbody"), Some(19));
        assert_eq!(find_head_end(b"ICY 200 OK\n\nbody"), Some(12));
        assert_eq!(find_head_end(b"HTTP/1.0 200 OK\r\nX: y\r\n"), None);
    }
}
