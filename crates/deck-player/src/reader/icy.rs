//! SHOUTcast/Icecast in-band metadata.
//!
//! With `icy-metaint: N` the server inserts a metadata block after every N payload bytes:
//! one length byte (×16) followed by `StreamTitle='...';`-style text padded with NULs.

/// Per-stream de-interleaving state.
#[derive(Debug)]
pub(crate) struct IcyState {
    interval: usize,
    until_meta: usize,
    title: Option<String>,
}

impl IcyState {
    pub(crate) fn new(interval: usize) -> Self {
        Self {
            interval,
            until_meta: interval,
            title: None,
        }
    }

    /// Audio bytes that may be read before the next metadata block.
    pub(crate) fn audio_budget(&self) -> usize {
        self.until_meta
    }

    pub(crate) fn consume_audio(&mut self, n: usize) {
        self.until_meta = self.until_meta.saturating_sub(n);
    }

    /// Apply a metadata block and restart the audio countdown.
    ///
    /// Returns the new title when it differs from the previous one.
    pub(crate) fn apply_block(&mut self, block: &[u8]) -> Option<String> {
        self.until_meta = self.interval;
        if block.is_empty() {
            return None;
        }
        let title = parse_stream_title(&String::from_utf8_lossy(block))?;
        if self.title.as_deref() == Some(title.as_str()) {
            return None;
        }
        tracing::info!(title = title.as_str(), "stream title changed");
        self.title = Some(title.clone());
        Some(title)
    }
}

fn parse_stream_title(text: &str) -> Option<String> {
    let start = text.find("StreamTitle='")? + "StreamTitle='".len();
    let rest = &text[start..];
    let end = rest.find("';").or_else(|| rest.rfind('\''))?;
    Some(rest[..end].trim_end_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_parsing() {
        assert_eq!(
            parse_stream_title("StreamTitle='Band - It's Live';StreamUrl='';\0\0"),
            Some("Band - It's Live".to_string())
        );
        assert_eq!(parse_stream_title("StreamUrl='x';"), None);
    }

    #[test]
    fn countdown_and_update_flag() {
        let mut icy = IcyState::new(8);
        assert_eq!(icy.audio_budget(), 8);
        icy.consume_audio(5);
        assert_eq!(icy.audio_budget(), 3);
        assert_eq!(icy.apply_block(b"StreamTitle='A';"), Some("A".to_string()));
        assert_eq!(icy.audio_budget(), 8);
        assert_eq!(icy.title.as_deref(), Some("A"));
        assert_eq!(icy.apply_block(b"StreamTitle='A';"), None);
        assert_eq!(icy.apply_block(b""), None);
        assert_eq!(icy.title.as_deref(), Some("A"));
    }
}
