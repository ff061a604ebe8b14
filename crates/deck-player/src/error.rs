//! Error taxonomy of the playback core.
//!
//! Conditions that are recovered locally (buffer underrun, short reads near EOF, seek on a
//! non-seekable source) never become a [`PlayerError`]; they are handled where they are
//! detected.

use deck_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    /// The audio device could not be opened or reconfigured.
    #[error("audio device error: {0}")]
    Device(String),
    /// No registered decoder accepts the input.
    #[error("no decoder found for {0}")]
    DecoderNotFound(String),
    /// A decoder was selected but failed to open the input.
    #[error("decoder {decoder} failed to open {path}: {reason}")]
    DecoderOpen {
        decoder: String,
        path: String,
        reason: String,
    },
    /// Network connect/read failure, bad HTTP status or too many redirects.
    #[error("stream error: {0}")]
    Stream(String),
    /// Local file access failed.
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A buffer of the requested size could not be allocated.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
}

impl PlayerError {
    /// Category reported through [`deck_types::PlayerEvent::Error`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlayerError::Device(_) => ErrorKind::Device,
            PlayerError::DecoderNotFound(_) => ErrorKind::DecoderNotFound,
            PlayerError::DecoderOpen { .. } => ErrorKind::DecoderOpen,
            PlayerError::Stream(_) => ErrorKind::Stream,
            PlayerError::Io { .. } | PlayerError::OutOfMemory(_) => ErrorKind::File,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_each_variant() {
        assert_eq!(PlayerError::Device("x".into()).kind(), ErrorKind::Device);
        assert_eq!(
            PlayerError::DecoderNotFound("a.xyz".into()).kind(),
            ErrorKind::DecoderNotFound
        );
        assert_eq!(PlayerError::Stream("refused".into()).kind(), ErrorKind::Stream);
        let io = PlayerError::Io {
            path: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(io.kind(), ErrorKind::File);
    }

    #[test]
    fn display_includes_context() {
        let err = PlayerError::DecoderOpen {
            decoder: "symphonia".into(),
            path: "a.flac".into(),
            reason: "bad header".into(),
        };
        assert_eq!(
            err.to_string(),
            "decoder symphonia failed to open a.flac: bad header"
        );
    }
}
