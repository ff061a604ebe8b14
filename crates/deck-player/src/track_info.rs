use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Lyrics longer than this are truncated on load.
pub const MAX_LYRICS_BYTES: usize = 16 * 1024;

/// Embedded cover art.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoverImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Metadata of the current track, shared between the decode thread and readers.
///
/// Always accessed through [`SharedTrackInfo`]; the orchestrator fills it in one locked
/// section so readers never see a half-updated record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub track_nr: String,
    pub date: String,
    pub comment: String,
    pub file_type: String,
    pub file_name: String,
    pub lyrics: String,
    pub image: Option<CoverImage>,
    /// Nominal bitrate in bits per second.
    pub bitrate: u32,
    /// Bitrate of the most recently decoded block.
    pub recent_bitrate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Track length in seconds, 0 when unknown.
    pub length_s: u32,
    updated: bool,
}

pub type SharedTrackInfo = Arc<Mutex<TrackInfo>>;

impl TrackInfo {
    pub fn shared() -> SharedTrackInfo {
        Arc::new(Mutex::new(Self::default()))
    }

    /// Reset every field. The updated flag is kept so a pending change is not lost.
    pub fn clear(&mut self) {
        let updated = self.updated;
        *self = Self::default();
        self.updated = updated;
    }

    pub fn mark_updated(&mut self) {
        self.updated = true;
    }

    /// Return and reset the updated flag.
    pub fn take_updated(&mut self) -> bool {
        std::mem::take(&mut self.updated)
    }

    pub fn has_lyrics(&self) -> bool {
        !self.lyrics.is_empty()
    }

    pub fn has_cover_artwork(&self) -> bool {
        self.image.as_ref().is_some_and(|img| !img.data.is_empty())
    }

    /// "Artist - Title", falling back to whichever is set, then to the file name.
    pub fn full_title(&self) -> String {
        match (self.artist.is_empty(), self.title.is_empty()) {
            (false, false) => format!("{} - {}", self.artist, self.title),
            (true, false) => self.title.clone(),
            (false, true) => self.artist.clone(),
            (true, true) => self.file_name.clone(),
        }
    }

    /// Load lyrics from a text file (lossy UTF-8, at most [`MAX_LYRICS_BYTES`]).
    pub fn load_lyrics_from_file(&mut self, path: &Path) -> std::io::Result<()> {
        let mut buf = Vec::new();
        std::fs::File::open(path)?
            .take(MAX_LYRICS_BYTES as u64)
            .read_to_end(&mut buf)?;
        self.lyrics = String::from_utf8_lossy(&buf).into_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_updated_resets_flag() {
        let mut ti = TrackInfo::default();
        assert!(!ti.take_updated());
        ti.mark_updated();
        assert!(ti.take_updated());
        assert!(!ti.take_updated());
    }

    #[test]
    fn clear_keeps_pending_update() {
        let mut ti = TrackInfo {
            title: "x".into(),
            sample_rate: 44_100,
            ..TrackInfo::default()
        };
        ti.mark_updated();
        ti.clear();
        assert!(ti.title.is_empty());
        assert_eq!(ti.sample_rate, 0);
        assert!(ti.take_updated());
    }

    #[test]
    fn full_title_fallbacks() {
        let mut ti = TrackInfo {
            file_name: "a.ogg".into(),
            ..TrackInfo::default()
        };
        assert_eq!(ti.full_title(), "a.ogg");
        ti.title = "Song".into();
        assert_eq!(ti.full_title(), "Song");
        ti.artist = "Band".into();
        assert_eq!(ti.full_title(), "Band - Song");
    }

    #[test]
    fn lyrics_are_truncated() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &vec![b'a'; MAX_LYRICS_BYTES + 100]).unwrap();
        let mut ti = TrackInfo::default();
        ti.load_lyrics_from_file(file.path()).unwrap();
        assert_eq!(ti.lyrics.len(), MAX_LYRICS_BYTES);
        assert!(ti.has_lyrics());
    }
}
