use serde::{Deserialize, Serialize};

/// Status of the item currently handled by the decode loop.
///
/// `Paused` never appears as an item status; it is only reported by the
/// presentation status when a playing item has a pending pause request.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// A track is being decoded and fed to the sink.
    Playing,
    /// Playing, but the sink is paused on user request.
    Paused,
    /// Playback was stopped explicitly (or never started).
    #[default]
    Stopped,
    /// The last track ended on its own (EOF, error, or skipped before start).
    Finished,
}

/// Last request issued by a controller (UI, network layer, CLI).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackRequest {
    #[default]
    None,
    Play,
    Pause,
    Stop,
}

/// Category of a playback failure reported through the event queue.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The audio device could not be opened or reconfigured.
    Device,
    /// No registered decoder accepts the input.
    DecoderNotFound,
    /// A decoder was found but could not open the input.
    DecoderOpen,
    /// The decoder failed while producing PCM.
    Decode,
    /// Network connect/read failure or too many redirects.
    Stream,
    /// Local file access failed.
    File,
}

/// Events published by the playback core.
///
/// Consumers poll the queue; the core has no knowledge of them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PlayerEvent {
    BufferingStarted,
    BufferingDone,
    BufferingFailed,
    TrackInfoChanged,
    PlaybackStateChanged(ItemStatus),
    Error(ErrorKind),
}

/// Point-in-time playback status exposed to controllers.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStatus {
    /// Presentation status (`Paused` when a playing item is paused).
    pub status: ItemStatus,
    /// Last controller request.
    pub request: PlaybackRequest,
    /// File name or URL of the current track.
    pub now_playing: Option<String>,
    /// Elapsed playback time in milliseconds.
    pub elapsed_ms: u64,
    /// Track length in milliseconds when known.
    pub duration_ms: Option<u64>,
    /// Negotiated output sample rate (Hz).
    pub sample_rate: Option<u32>,
    /// Negotiated output channel count.
    pub channels: Option<u16>,
    /// Volume index (0..15).
    pub volume: u8,
    /// Whether the audio device is currently open.
    pub device_open: bool,
    /// Bytes waiting in the playback buffer.
    pub buffered_bytes: usize,
    /// Playback buffer capacity in bytes.
    pub buffer_capacity: usize,
    /// Number of underruns observed by the output callback.
    pub underrun_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_defaults_to_stopped() {
        assert_eq!(ItemStatus::default(), ItemStatus::Stopped);
        assert_eq!(PlaybackRequest::default(), PlaybackRequest::None);
    }

    #[test]
    fn player_event_serializes_with_kind_tag() {
        let json = serde_json::to_string(&PlayerEvent::Error(ErrorKind::DecoderNotFound)).unwrap();
        assert_eq!(json, r#"{"kind":"error","value":"decoder_not_found"}"#);
        let json = serde_json::to_string(&PlayerEvent::BufferingDone).unwrap();
        assert_eq!(json, r#"{"kind":"buffering_done"}"#);
    }

    #[test]
    fn player_status_roundtrips_through_json() {
        let status = PlayerStatus {
            status: ItemStatus::Paused,
            request: PlaybackRequest::Pause,
            now_playing: Some("track.flac".to_string()),
            elapsed_ms: 1500,
            volume: 14,
            ..PlayerStatus::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: PlayerStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
