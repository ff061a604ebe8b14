use std::sync::{Arc, Mutex};

use deck_types::{ItemStatus, PlaybackRequest, PlayerStatus};

use crate::sink::AudioSink;

/// Track-level status fields maintained by the decode thread.
///
/// Everything that lives in the sink (position, volume, buffer level) is read from it at
/// snapshot time instead of being mirrored here.
#[derive(Debug, Default)]
pub struct PlayerStatusState {
    /// File name or URL currently handled by the decode loop.
    pub now_playing: Option<String>,
    /// Total track duration in milliseconds when known.
    pub duration_ms: Option<u64>,
}

impl PlayerStatusState {
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Build a snapshot for controllers.
    pub fn snapshot(
        &self,
        status: ItemStatus,
        request: PlaybackRequest,
        sink: &AudioSink,
    ) -> PlayerStatus {
        let format = sink.format();
        PlayerStatus {
            status,
            request,
            now_playing: self.now_playing.clone(),
            elapsed_ms: sink.get_playtime_ms(),
            duration_ms: self.duration_ms,
            sample_rate: format.map(|f| f.sample_rate),
            channels: format.map(|f| f.channels),
            volume: sink.get_volume(),
            device_open: sink.is_device_open(),
            buffered_bytes: sink.buffer_fill(),
            buffer_capacity: sink.buffer_capacity(),
            underrun_events: sink.underrun_events(),
        }
    }

    /// Forget the track once the decode loop is done with it.
    pub fn clear_playback(&mut self) {
        self.now_playing = None;
        self.duration_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;

    #[test]
    fn snapshot_reads_sink_state() {
        let sink = AudioSink::with_capacity(Box::new(NullOutput::default()), 4096);
        sink.set_volume(9);
        let state = PlayerStatusState {
            now_playing: Some("track.flac".to_string()),
            duration_ms: Some(3_000),
        };

        let snap = state.snapshot(ItemStatus::Playing, PlaybackRequest::Play, &sink);
        assert_eq!(snap.now_playing.as_deref(), Some("track.flac"));
        assert_eq!(snap.duration_ms, Some(3_000));
        assert_eq!(snap.volume, 9);
        assert_eq!(snap.buffer_capacity, 4096);
        assert!(!snap.device_open);
        assert_eq!(snap.sample_rate, None);
        assert_eq!(snap.elapsed_ms, 0);
    }

    #[test]
    fn snapshot_reports_open_format() {
        let sink = AudioSink::with_capacity(Box::new(NullOutput::default()), 4096);
        sink.open_device(48_000, 2).unwrap();
        let snap = PlayerStatusState::default().snapshot(
            ItemStatus::Stopped,
            PlaybackRequest::None,
            &sink,
        );
        assert!(snap.device_open);
        assert_eq!(snap.sample_rate, Some(48_000));
        assert_eq!(snap.channels, Some(2));
        assert!(snap.now_playing.is_none());
    }

    #[test]
    fn clear_playback_resets_track_fields() {
        let mut state = PlayerStatusState {
            now_playing: Some("track".to_string()),
            duration_ms: Some(10),
        };
        state.clear_playback();
        assert!(state.now_playing.is_none());
        assert!(state.duration_ms.is_none());
    }
}
