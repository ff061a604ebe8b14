//! Unified byte source for decoders: local files and plain HTTP streams.
//!
//! Network sources are fetched by a background thread into a cache ring buffer (see
//! [`http`]); readers block on that cache. Local files are read directly and are the only
//! seekable sources.

mod http;
mod icy;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use symphonia::core::io::MediaSource;

use crate::error::PlayerError;
use http::{HttpConnection, HttpUrl, NetShared, strip_prefix_ignore_case};
use icy::IcyState;

pub use http::ReaderStatus;

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 3;

const MIN_CACHE_KB: usize = 256;
const MAX_CACHE_KB: usize = 4096;

/// Network cache sizing and connection timeouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderConfig {
    cache_bytes: usize,
    prebuffer_bytes: usize,
    connect_timeout: Duration,
}

impl ReaderConfig {
    /// Cache is clamped to 256 KB..4 MB, prebuffer to at most 3/4 of the cache.
    pub fn new(cache_kb: usize, prebuffer_kb: usize) -> Self {
        let cache_kb = cache_kb.clamp(MIN_CACHE_KB, MAX_CACHE_KB);
        let prebuffer_kb = prebuffer_kb.min(cache_kb * 3 / 4);
        Self {
            cache_bytes: cache_kb * 1024,
            prebuffer_bytes: prebuffer_kb * 1024,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(Duration::from_millis(100));
        self
    }

    pub fn cache_bytes(&self) -> usize {
        self.cache_bytes
    }

    pub fn prebuffer_bytes(&self) -> usize {
        self.prebuffer_bytes
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// How long to wait for the response header after connecting.
    fn header_timeout(&self) -> Duration {
        self.connect_timeout.saturating_mul(2)
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::new(512, 128)
    }
}

enum Source {
    File {
        file: File,
        size: u64,
    },
    Network {
        conn: HttpConnection,
        icy: Option<IcyState>,
        content_length: Option<u64>,
    },
}

/// Open file or network stream.
///
/// Besides the `Read`/`Seek` interface used by decoders, it offers the chunked
/// `read_bytes` + `buffer` interface and a replaying `probe` for format sniffing.
pub struct StreamReader {
    url: String,
    source: Option<Source>,
    eof: bool,
    scratch: Vec<u8>,
    replay: Vec<u8>,
    replay_pos: usize,
    position: u64,
    headers: HashMap<String, String>,
}

impl StreamReader {
    /// Open `url`. `http://` URLs are streamed, `https://` is rejected, anything else is a
    /// local path.
    pub fn open(url: &str, config: &ReaderConfig) -> Result<Self, PlayerError> {
        Self::open_cancellable(url, config, &AtomicBool::new(false))
    }

    /// Like [`StreamReader::open`], but a network open gives up with a stream error soon
    /// after `cancel` is set (the TCP connect itself still runs to its timeout).
    pub fn open_cancellable(
        url: &str,
        config: &ReaderConfig,
        cancel: &AtomicBool,
    ) -> Result<Self, PlayerError> {
        if strip_prefix_ignore_case(url, "https://").is_some() {
            return Err(PlayerError::Stream(format!("https is not supported: {url}")));
        }
        if strip_prefix_ignore_case(url, "http://").is_some() {
            Self::open_network(url, config, cancel)
        } else {
            Self::open_file(url)
        }
    }

    fn open_file(path: &str) -> Result<Self, PlayerError> {
        let io_err = |source| PlayerError::Io {
            path: path.to_string(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len();
        tracing::debug!(path, size, "opened local file");
        Ok(Self::with_source(path, Source::File { file, size }, HashMap::new()))
    }

    fn open_network(
        url: &str,
        config: &ReaderConfig,
        cancel: &AtomicBool,
    ) -> Result<Self, PlayerError> {
        let mut current = url.to_string();
        for hop in 0..=MAX_REDIRECTS {
            if cancel.load(Ordering::Acquire) {
                return Err(PlayerError::Stream(format!("open cancelled: {current}")));
            }
            let target = HttpUrl::parse(&current)?;
            tracing::info!(url = current.as_str(), hop, "opening network stream");
            let mut conn = HttpConnection::open(
                &target,
                config.cache_bytes,
                config.prebuffer_bytes,
                config.connect_timeout,
            )?;
            let head = conn.read_head(config.header_timeout(), cancel)?;

            if head.is_redirect() {
                let Some(location) = head.headers.get("location") else {
                    return Err(PlayerError::Stream(format!(
                        "{current}: redirect {} without location",
                        head.status
                    )));
                };
                let next = target.resolve(location);
                conn.close();
                tracing::info!(status = head.status, location = next.as_str(), "following redirect");
                current = next;
                continue;
            }
            if !(200..300).contains(&head.status) {
                return Err(PlayerError::Stream(format!(
                    "{current}: http status {}",
                    head.status
                )));
            }

            let icy = head
                .headers
                .get("icy-metaint")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .map(IcyState::new);
            let content_length = head
                .headers
                .get("content-length")
                .and_then(|v| v.parse::<u64>().ok());
            tracing::debug!(
                status = head.status,
                content_type = head.headers.get("content-type").map(String::as_str),
                icy_metaint = icy.is_some(),
                "stream response"
            );
            let source = Source::Network {
                conn,
                icy,
                content_length,
            };
            return Ok(Self::with_source(&current, source, head.headers));
        }
        Err(PlayerError::Stream(format!(
            "too many redirects opening {url}"
        )))
    }

    fn with_source(url: &str, source: Source, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.to_string(),
            source: Some(source),
            eof: false,
            scratch: Vec::new(),
            replay: Vec::new(),
            replay_pos: 0,
            position: 0,
            headers,
        }
    }

    /// URL or path this reader was opened with (after redirects).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_network(&self) -> bool {
        matches!(self.source, Some(Source::Network { .. }))
    }

    /// Read up to `n` bytes into the scratch buffer (see [`StreamReader::buffer`]).
    ///
    /// Returns `false` only when nothing could be read. A short read marks EOF.
    pub fn read_bytes(&mut self, n: usize) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.resize(n, 0);
        let got = self.fill_exact(&mut scratch);
        scratch.truncate(got);
        self.scratch = scratch;
        self.position += got as u64;
        if got < n {
            self.eof = true;
        }
        got > 0 || n == 0
    }

    /// Like [`StreamReader::read_bytes`], but the bytes are delivered again by the next reads.
    pub fn probe(&mut self, n: usize) -> bool {
        let ok = self.read_bytes(n);
        let mut replay = self.scratch.clone();
        replay.extend_from_slice(&self.replay[self.replay_pos..]);
        self.position -= self.scratch.len() as u64;
        self.replay = replay;
        self.replay_pos = 0;
        ok
    }

    fn replay_remaining(&self) -> usize {
        self.replay.len() - self.replay_pos
    }

    fn take_replay(&mut self, out: &mut [u8]) -> usize {
        let n = self.replay_remaining().min(out.len());
        if n > 0 {
            out[..n].copy_from_slice(&self.replay[self.replay_pos..self.replay_pos + n]);
            self.replay_pos += n;
            if self.replay_pos == self.replay.len() {
                self.replay.clear();
                self.replay_pos = 0;
            }
        }
        n
    }

    fn fill_exact(&mut self, out: &mut [u8]) -> usize {
        let from_replay = self.take_replay(out);
        let rest = &mut out[from_replay..];
        if rest.is_empty() {
            return from_replay;
        }
        let got = match self.source.as_mut() {
            None => 0,
            Some(Source::File { file, .. }) => read_file_shrinking(file, rest),
            Some(Source::Network { conn, icy, .. }) => read_network(conn.shared(), icy, rest, true),
        };
        from_replay + got
    }

    /// Bytes of the last `read_bytes`/`probe`.
    pub fn buffer(&self) -> &[u8] {
        &self.scratch
    }

    pub fn bytes_in_buffer(&self) -> usize {
        self.scratch.len()
    }

    pub fn clear_buffer(&mut self) {
        self.scratch.clear();
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.replay_remaining() == 0
    }

    /// Files are always ready; network streams once the prebuffer watermark was reached.
    pub fn is_ready(&self) -> bool {
        match &self.source {
            Some(Source::Network { conn, .. }) => conn.shared().lock().ready,
            Some(Source::File { .. }) => true,
            None => false,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.source, Some(Source::File { .. }))
    }

    /// File size, or the announced content length of a network stream.
    pub fn file_size(&self) -> Option<u64> {
        match &self.source {
            Some(Source::File { size, .. }) => Some(*size),
            Some(Source::Network { content_length, .. }) => *content_length,
            None => None,
        }
    }

    /// Payload bytes delivered so far (probed bytes not counted until re-read).
    pub fn stream_position(&self) -> u64 {
        self.position
    }

    /// Response header by case-insensitive name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Media type without parameters, lower-cased.
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Latest in-band (ICY) stream title.
    pub fn stream_title(&self) -> Option<String> {
        match &self.source {
            Some(Source::Network { conn, .. }) => conn.shared().title(),
            _ => None,
        }
    }

    /// Return and reset the "stream title changed" flag.
    pub fn take_title_update(&self) -> bool {
        match &self.source {
            Some(Source::Network { conn, .. }) => conn.shared().take_title_update(),
            _ => false,
        }
    }

    /// Observer handle for network streams.
    pub fn status(&self) -> Option<ReaderStatus> {
        match &self.source {
            Some(Source::Network { conn, .. }) => Some(conn.status()),
            _ => None,
        }
    }

    /// Seek to an absolute byte offset. Local files only.
    pub fn seek_to(&mut self, offset: u64) -> bool {
        self.is_seekable() && Seek::seek(self, SeekFrom::Start(offset)).is_ok()
    }

    /// Release the source. Network readers cancel and join their fetch thread.
    pub fn close(&mut self) {
        if let Some(source) = self.source.take() {
            if let Source::Network { mut conn, .. } = source {
                conn.close();
            }
            tracing::debug!(url = self.url.as_str(), "reader closed");
        }
        self.scratch = Vec::new();
        self.replay = Vec::new();
        self.replay_pos = 0;
        self.headers.clear();
        self.eof = true;
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fill `out` from the current file position. On a short read near EOF, go back and read
/// the smaller amount again so the file position matches what was returned.
fn read_file_shrinking(file: &mut File, out: &mut [u8]) -> usize {
    let Ok(start) = file.stream_position() else {
        return 0;
    };
    let mut want = out.len();
    loop {
        let got = match read_full(file, &mut out[..want]) {
            Ok(got) => got,
            Err(e) => {
                tracing::warn!(error = %e, "file read failed");
                return 0;
            }
        };
        if got == want || got == 0 {
            return got;
        }
        if file.seek(SeekFrom::Start(start)).is_err() {
            return got;
        }
        want = got;
    }
}

fn read_full(file: &mut File, out: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < out.len() {
        match file.read(&mut out[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read payload from the cache, stripping ICY metadata blocks when enabled.
fn read_network(shared: &NetShared, icy: &mut Option<IcyState>, out: &mut [u8], exact: bool) -> usize {
    let Some(icy) = icy else {
        return shared.read(out, exact);
    };
    let mut filled = 0;
    while filled < out.len() {
        if icy.audio_budget() == 0 {
            let mut len = [0u8; 1];
            if shared.read(&mut len, true) == 0 {
                break;
            }
            let mut block = vec![0u8; len[0] as usize * 16];
            let got = shared.read(&mut block, true);
            if let Some(title) = icy.apply_block(&block[..got]) {
                shared.set_title(title);
            }
            if got < block.len() {
                break;
            }
            continue;
        }
        let want = (out.len() - filled).min(icy.audio_budget());
        let n = shared.read(&mut out[filled..filled + want], exact);
        if n == 0 {
            break;
        }
        icy.consume_audio(n);
        filled += n;
        if !exact || n < want {
            break;
        }
    }
    filled
}

impl Read for StreamReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let n = self.take_replay(out);
        if n > 0 {
            self.position += n as u64;
            return Ok(n);
        }
        let n = match self.source.as_mut() {
            None => 0,
            Some(Source::File { file, .. }) => file.read(out)?,
            Some(Source::Network { conn, icy, .. }) => read_network(conn.shared(), icy, out, false),
        };
        if n == 0 {
            self.eof = true;
        }
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for StreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let Some(Source::File { file, size }) = self.source.as_mut() else {
            return match pos {
                SeekFrom::Current(0) => Ok(self.position),
                _ => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "network streams are not seekable",
                )),
            };
        };
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(delta) => *size as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        let at = file.seek(SeekFrom::Start(target as u64))?;
        self.replay.clear();
        self.replay_pos = 0;
        self.position = at;
        self.eof = false;
        Ok(at)
    }
}

impl MediaSource for StreamReader {
    fn is_seekable(&self) -> bool {
        StreamReader::is_seekable(self)
    }

    fn byte_len(&self) -> Option<u64> {
        match &self.source {
            Some(Source::File { size, .. }) => Some(*size),
            _ => None,
        }
    }
}
