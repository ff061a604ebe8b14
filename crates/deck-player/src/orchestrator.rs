//! Decode loop and playback state machine.
//!
//! One long-lived thread takes file names from a [`Mailbox`], picks a decoder, feeds PCM
//! into the [`AudioSink`] and reports progress through the [`EventQueue`]. Controllers
//! interact only through the methods on [`PlaybackOrchestrator`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use deck_types::{ItemStatus, PlaybackRequest, PlayerEvent, PlayerStatus};

use crate::charset::decode_text;
use crate::config::PlayerConfig;
use crate::decoder::{
    DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, Decoder, DecoderRegistry, MetaField,
};
use crate::error::PlayerError;
use crate::events::EventQueue;
use crate::lyrics;
use crate::mailbox::Mailbox;
use crate::reader::{ReaderStatus, StreamReader};
use crate::sink::AudioSink;
use crate::status::PlayerStatusState;
use crate::track_info::{CoverImage, SharedTrackInfo, TrackInfo};

/// Scratch buffer for decoded PCM; each decode call fills at most half of it.
pub const DECODE_BUFFER_BYTES: usize = 64 * 1024;
/// Bytes sniffed from the source when the extension does not identify a decoder.
pub const PROBE_BYTES: usize = 4096;
/// Fade-out decrement per loop iteration, in percent.
pub const FADE_STEP_PERCENT: u8 = 10;

const SINK_WAIT: Duration = Duration::from_secs(1);
const BUFFERING_POLL: Duration = Duration::from_millis(100);

struct Control {
    item: ItemStatus,
    request: PlaybackRequest,
    seek: Option<u64>,
}

struct Shared {
    sink: Arc<AudioSink>,
    registry: DecoderRegistry,
    config: PlayerConfig,
    track_info: SharedTrackInfo,
    events: EventQueue,
    mailbox: Mailbox<String>,
    control: Mutex<Control>,
    status: Mutex<PlayerStatusState>,
    active_reader: Mutex<Option<ReaderStatus>>,
    /// Aborts a network open that has not produced a reader yet.
    open_cancelled: AtomicBool,
    shutdown: AtomicBool,
}

/// Decoder plus the reader status used for buffering and cancellation.
struct Session {
    decoder: Box<dyn Decoder>,
    reader: Option<ReaderStatus>,
}

pub struct PlaybackOrchestrator {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PlaybackOrchestrator {
    /// Spawn the decode thread.
    pub fn new(
        sink: Arc<AudioSink>,
        registry: DecoderRegistry,
        config: PlayerConfig,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            sink,
            registry,
            config,
            track_info: TrackInfo::shared(),
            events: EventQueue::new(),
            mailbox: Mailbox::new(),
            control: Mutex::new(Control {
                item: ItemStatus::Stopped,
                request: PlaybackRequest::None,
                seek: None,
            }),
            status: Mutex::new(PlayerStatusState::default()),
            active_reader: Mutex::new(None),
            open_cancelled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || thread_shared.run())?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn sink(&self) -> &Arc<AudioSink> {
        &self.shared.sink
    }

    pub fn track_info(&self) -> SharedTrackInfo {
        self.shared.track_info.clone()
    }

    pub fn events(&self) -> EventQueue {
        self.shared.events.clone()
    }

    /// Request playback of `file` (a path or URL).
    ///
    /// A track that is already playing is skipped: cut immediately, or faded out when
    /// `fade_on_skip` is set and audio is actually audible. A file requested before the
    /// decode thread picked up the previous one replaces it.
    pub fn play_file(&self, file: impl Into<String>) {
        let file = file.into();
        if self.shared.is_shutting_down() {
            tracing::warn!(file = file.as_str(), "play ignored after shutdown");
            return;
        }
        tracing::info!(file = file.as_str(), "play requested");
        // Skip decision and handoff share the control lock; the decode thread marks an
        // item Playing only under that lock, after taking it.
        let mut c = self.shared.control();
        if c.item == ItemStatus::Playing {
            let sink = &self.shared.sink;
            let audible = sink.is_device_open() && !sink.is_paused() && !sink.is_holding();
            if self.shared.config.fade_on_skip && audible {
                sink.set_fade_target(100);
                tracing::debug!("fading out current track");
            } else {
                c.item = ItemStatus::Stopped;
                self.shared.cancel_reader();
            }
        }
        if let Some(replaced) = self.shared.mailbox.put(file) {
            tracing::debug!(file = replaced.as_str(), "pending file replaced");
        }
        c.request = PlaybackRequest::Play;
    }

    /// Stop the current track and drop any pending file.
    pub fn stop(&self) {
        let mut c = self.shared.control();
        c.request = PlaybackRequest::Stop;
        c.seek = None;
        if c.item == ItemStatus::Playing {
            c.item = ItemStatus::Stopped;
        }
        self.shared.mailbox.clear();
        self.shared.cancel_reader();
        drop(c);
        tracing::info!("stop requested");
    }

    /// Pause or resume the current track. Returns `false` when nothing is playing.
    pub fn pause(&self, paused: bool) -> bool {
        let mut c = self.shared.control();
        if c.item != ItemStatus::Playing {
            return false;
        }
        self.shared.sink.set_pause(paused);
        c.request = if paused {
            PlaybackRequest::Pause
        } else {
            PlaybackRequest::Play
        };
        let shown = presentation(&c);
        drop(c);
        self.shared
            .events
            .push(PlayerEvent::PlaybackStateChanged(shown));
        true
    }

    pub fn toggle_pause(&self) -> bool {
        let paused = self.shared.sink.is_paused();
        self.pause(!paused)
    }

    /// Seek relative to the current position. Returns the absolute target second.
    pub fn seek(&self, relative_seconds: i64) -> u64 {
        let current = (self.shared.sink.get_playtime_ms() / 1000) as i64;
        let target = current.saturating_add(relative_seconds).max(0) as u64;
        self.shared.control().seek = Some(target);
        tracing::debug!(relative_seconds, target, "seek requested");
        target
    }

    pub fn pending_seek(&self) -> Option<u64> {
        self.shared.control().seek
    }

    pub fn item_status(&self) -> ItemStatus {
        self.shared.control().item
    }

    pub fn request(&self) -> PlaybackRequest {
        self.shared.control().request
    }

    /// Item status as shown to users: `Paused` for a playing item with a pause request.
    pub fn playback_status(&self) -> ItemStatus {
        presentation(&self.shared.control())
    }

    pub fn playtime_ms(&self) -> u64 {
        self.shared.sink.get_playtime_ms()
    }

    pub fn status(&self) -> PlayerStatus {
        let (shown, request) = {
            let c = self.shared.control();
            (presentation(&c), c.request)
        };
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(shown, request, &self.shared.sink)
    }

    /// Stop playback and join the decode thread. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let mut c = self.shared.control();
            if c.item == ItemStatus::Playing {
                c.item = ItemStatus::Stopped;
            }
        }
        self.shared.cancel_reader();
        self.shared.sink.begin_shutdown();
        self.shared.mailbox.close();
        if handle.join().is_err() {
            tracing::error!("decode thread panicked");
        }
        tracing::info!("playback orchestrator shut down");
    }
}

impl Drop for PlaybackOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn presentation(c: &Control) -> ItemStatus {
    if c.item == ItemStatus::Playing && c.request == PlaybackRequest::Pause {
        ItemStatus::Paused
    } else {
        c.item
    }
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_info(&self) -> MutexGuard<'_, TrackInfo> {
        self.track_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_playing(&self) -> bool {
        !self.is_shutting_down() && self.control().item == ItemStatus::Playing
    }

    fn set_active_reader(&self, status: Option<ReaderStatus>) {
        *self
            .active_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn cancel_reader(&self) {
        self.open_cancelled.store(true, Ordering::Release);
        if let Some(status) = self
            .active_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            status.cancel();
        }
    }

    fn run(&self) {
        while let Some(file) = self.mailbox.take() {
            if self.is_shutting_down() {
                break;
            }
            self.play_item(&file);
            if self.config.close_device_on_idle
                && !self.mailbox.is_pending()
                && !self.is_shutting_down()
            {
                self.sink.close_device();
            }
        }
        tracing::debug!("decode thread exiting");
    }

    fn play_item(&self, file: &str) {
        {
            let mut c = self.control();
            // Taken from the mailbox just before a stop cleared it.
            if c.request == PlaybackRequest::Stop {
                tracing::debug!(file, "stopped before start");
                return;
            }
            self.open_cancelled.store(false, Ordering::Release);
            c.item = ItemStatus::Playing;
            c.seek = None;
            if c.request != PlaybackRequest::Pause {
                c.request = PlaybackRequest::Play;
            }
        }
        self.events
            .push(PlayerEvent::PlaybackStateChanged(ItemStatus::Playing));

        let end = match self.open_session(file) {
            Ok(Some(mut session)) => {
                let end = self.play_session(file, &mut session);
                session.decoder.close();
                end
            }
            Ok(None) => ItemStatus::Stopped,
            Err(_) if !self.is_playing() => {
                tracing::debug!(file, "open abandoned");
                ItemStatus::Stopped
            }
            Err(e) => {
                tracing::warn!(file, error = %e, "track skipped");
                self.events.push(PlayerEvent::Error(e.kind()));
                ItemStatus::Finished
            }
        };
        self.set_active_reader(None);

        let end = {
            let mut c = self.control();
            if c.item == ItemStatus::Playing {
                c.item = end;
            }
            c.seek = None;
            c.item
        };
        if end == ItemStatus::Stopped {
            self.sink.clear_buffer();
        }
        self.sink.mark_done();
        {
            let mut ti = self.track_info();
            ti.clear();
            ti.mark_updated();
        }
        self.events.push(PlayerEvent::TrackInfoChanged);
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_playback();
        tracing::info!(file, status = ?end, "track ended");
        self.events.push(PlayerEvent::PlaybackStateChanged(end));
    }

    /// Select and open a decoder: extension first, then the stream's content type, then
    /// magic bytes. `None` when playback was stopped while the source was opening.
    fn open_session(&self, file: &str) -> Result<Option<Session>, PlayerError> {
        let mut probed: Option<StreamReader> = None;

        let factory = match self.registry.for_extension(file) {
            Some(factory) => factory,
            None => {
                let Some(mut reader) = self.open_reader(file)? else {
                    return Ok(None);
                };
                reader.probe(PROBE_BYTES);
                let by_mime = reader
                    .content_type()
                    .and_then(|mime| self.registry.for_mime_type(&mime));
                let factory = by_mime.or_else(|| self.registry.for_data(reader.buffer()));
                probed = Some(reader);
                factory.ok_or_else(|| PlayerError::DecoderNotFound(file.to_string()))?
            }
        };
        tracing::debug!(file, decoder = factory.identifier(), "decoder selected");

        let mut decoder = factory.create();
        let mut reader_status = None;
        if factory.wants_reader() {
            let reader = match probed.take() {
                Some(reader) => reader,
                None => match self.open_reader(file)? {
                    Some(reader) => reader,
                    None => return Ok(None),
                },
            };
            reader_status = reader.status();
            decoder.set_reader(Some(reader));
        }
        drop(probed);

        decoder
            .open(file)
            .map_err(|e| PlayerError::DecoderOpen {
                decoder: factory.identifier().to_string(),
                path: file.to_string(),
                reason: format!("{e:#}"),
            })?;
        Ok(Some(Session {
            decoder,
            reader: reader_status,
        }))
    }

    /// Open `file` and register it for cancellation. `None` if a stop, skip or shutdown
    /// arrived while connecting.
    fn open_reader(&self, file: &str) -> Result<Option<StreamReader>, PlayerError> {
        let reader = StreamReader::open_cancellable(
            file,
            &self.config.reader_config(),
            &self.open_cancelled,
        )?;
        self.set_active_reader(reader.status());
        if !self.is_playing() {
            tracing::debug!(file, "source opened after stop");
            return Ok(None);
        }
        Ok(Some(reader))
    }

    fn play_session(&self, file: &str, session: &mut Session) -> ItemStatus {
        let decoder = session.decoder.as_mut();
        let rate = decoder
            .samplerate()
            .filter(|r| *r > 0)
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        let channels = decoder
            .channels()
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_CHANNELS);
        self.publish_track_info(file, decoder, rate, channels);

        self.sink.reset_fade();
        if let Err(e) = self.sink.open_device(rate, channels) {
            tracing::warn!(file, error = %e, "cannot open output for track");
            self.events.push(PlayerEvent::Error(e.kind()));
            return ItemStatus::Finished;
        }
        let paused = self.control().request == PlaybackRequest::Pause;
        self.sink.set_pause(paused);
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.now_playing = Some(file.to_string());
            status.duration_ms = decoder.length().map(|s| s as u64 * 1000);
        }
        self.events.push(PlayerEvent::TrackInfoChanged);

        if let Some(reader) = &session.reader {
            if !self.wait_for_buffer(reader) {
                return ItemStatus::Finished;
            }
        }
        self.feed(decoder, rate)
    }

    fn publish_track_info(&self, file: &str, decoder: &dyn Decoder, rate: u32, channels: u16) {
        let mut ti = self.track_info();
        ti.clear();
        ti.file_name = file.to_string();
        ti.file_type = decoder.file_type().unwrap_or_default();
        ti.bitrate = decoder.bitrate().unwrap_or(0);
        ti.sample_rate = rate;
        ti.channels = channels;
        ti.length_s = decoder.length().unwrap_or(0);
        apply_meta_data(&mut ti, decoder);
        if !ti.has_lyrics() {
            if let Some(path) = lyrics::find_matching_file(file, &self.config.lyrics_file_pattern)
            {
                match ti.load_lyrics_from_file(&path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "lyrics loaded"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "lyrics unreadable"),
                }
            }
        }
        ti.mark_updated();
        tracing::info!(
            title = %ti.full_title(),
            rate_hz = rate,
            channels,
            length_s = ti.length_s,
            "track info"
        );
    }

    /// Block until the network cache reached its prebuffer watermark.
    ///
    /// Gives up after `buffering_stall_cycles` polls without any new bytes arriving.
    fn wait_for_buffer(&self, reader: &ReaderStatus) -> bool {
        if reader.is_ready() {
            return true;
        }
        self.events.push(PlayerEvent::BufferingStarted);
        let mut last = reader.received();
        let mut stalled = 0u32;
        while !reader.is_ready() {
            if !self.is_playing() {
                return false;
            }
            reader.wait_for_progress(BUFFERING_POLL);
            let received = reader.received();
            if received == last {
                stalled += 1;
                if stalled >= self.config.buffering_stall_cycles {
                    tracing::warn!(received, "buffering stalled");
                    self.events.push(PlayerEvent::BufferingFailed);
                    return false;
                }
            } else {
                stalled = 0;
                last = received;
            }
        }
        self.events.push(PlayerEvent::BufferingDone);
        true
    }

    fn feed(&self, decoder: &mut dyn Decoder, rate: u32) -> ItemStatus {
        let mut scratch = vec![0u8; DECODE_BUFFER_BYTES];
        let chunk = (DECODE_BUFFER_BYTES / 2)
            .min(self.sink.buffer_capacity() / 2)
            .max(2);

        loop {
            if !self.is_playing() {
                return ItemStatus::Stopped;
            }

            let seek = self.control().seek.take();
            if let Some(second) = seek {
                if decoder.seek(second) {
                    let paused = self.sink.is_paused();
                    self.sink.clear_buffer();
                    self.sink.set_pause(paused);
                    self.sink.set_sample_count(second * rate as u64);
                    tracing::debug!(second, "seek applied");
                } else {
                    tracing::debug!(second, "seek not supported by source");
                }
            }

            if self.sink.fade_in_progress() && self.sink.fade_step(FADE_STEP_PERCENT) {
                tracing::debug!("fade-out complete");
                return ItemStatus::Stopped;
            }

            let n = match decoder.decode(&mut scratch[..chunk]) {
                Ok(n) => n,
                Err(e) => {
                    if !self.is_playing() {
                        return ItemStatus::Stopped;
                    }
                    tracing::warn!(error = %format!("{e:#}"), "decode failed");
                    self.sink.set_pause(true);
                    self.events
                        .push(PlayerEvent::Error(deck_types::ErrorKind::Decode));
                    return ItemStatus::Finished;
                }
            };
            if n == 0 {
                return self.drain();
            }

            let pcm = &scratch[..n & !1];
            while !self.sink.push(pcm) {
                if !self.is_playing() {
                    return ItemStatus::Stopped;
                }
                self.sink.resume_if_buffered();
                self.sink.wait_for_space(pcm.len(), SINK_WAIT);
            }
            self.sink.resume_if_buffered();
            self.refresh_meta_data(decoder);
        }
    }

    /// Let the callback play out what is buffered after the decoder hit EOF.
    fn drain(&self) -> ItemStatus {
        self.sink.mark_done();
        loop {
            if !self.is_playing() {
                return ItemStatus::Stopped;
            }
            self.sink.resume_if_buffered();
            if self.sink.wait_until_drained(SINK_WAIT) {
                return ItemStatus::Finished;
            }
        }
    }

    fn refresh_meta_data(&self, decoder: &mut dyn Decoder) {
        let recent = decoder.current_bitrate();
        let updated = decoder.meta_data_is_updated();
        let mut ti = self.track_info();
        if let Some(bitrate) = recent {
            ti.recent_bitrate = bitrate;
        }
        if !updated {
            return;
        }
        let before = (ti.title.clone(), ti.artist.clone(), ti.album.clone());
        apply_meta_data(&mut ti, decoder);
        if (&ti.title, &ti.artist, &ti.album) != (&before.0, &before.1, &before.2) {
            ti.mark_updated();
            tracing::info!(title = %ti.full_title(), "track info updated");
            drop(ti);
            self.events.push(PlayerEvent::TrackInfoChanged);
        }
    }
}

/// Copy every metadata field the decoder provides into `ti`.
fn apply_meta_data(ti: &mut TrackInfo, decoder: &dyn Decoder) {
    let charset = decoder.meta_data_charset();
    for field in MetaField::TEXT {
        let Some(raw) = decoder.meta_data(field, true) else {
            continue;
        };
        let text = decode_text(&raw, charset);
        let slot = match field {
            MetaField::Title => &mut ti.title,
            MetaField::Artist => &mut ti.artist,
            MetaField::Album => &mut ti.album,
            MetaField::TrackNr => &mut ti.track_nr,
            MetaField::Date => &mut ti.date,
            MetaField::Comment => &mut ti.comment,
            MetaField::Lyrics => &mut ti.lyrics,
            MetaField::ImageData | MetaField::ImageMimeType => continue,
        };
        *slot = text;
    }
    if let Some(data) = decoder.meta_data(MetaField::ImageData, true) {
        let mime_type = decoder
            .meta_data(MetaField::ImageMimeType, true)
            .map(|m| decode_text(&m, charset))
            .unwrap_or_default();
        ti.image = Some(CoverImage { data, mime_type });
    }
}
