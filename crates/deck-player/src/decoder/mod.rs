//! Decoder capability contract and the in-process registry of decoders.
//!
//! A [`DecoderFactory`] describes a codec (extensions, mime types, magic bytes) and builds
//! [`Decoder`] instances. Decoders produce interleaved signed 16-bit native-endian PCM.

use std::sync::Arc;

use crate::charset::Charset;
use crate::reader::StreamReader;

pub mod symphonia;

pub use self::symphonia::SymphoniaDecoderFactory;

/// Sample rate assumed when a decoder does not report one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
/// Channel count assumed when a decoder does not report one.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Metadata fields a decoder may expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaField {
    Title,
    Artist,
    Album,
    TrackNr,
    Date,
    Comment,
    Lyrics,
    ImageData,
    ImageMimeType,
}

impl MetaField {
    /// Text fields copied into `TrackInfo` on open and on live updates.
    pub const TEXT: [MetaField; 7] = [
        MetaField::Title,
        MetaField::Artist,
        MetaField::Album,
        MetaField::TrackNr,
        MetaField::Date,
        MetaField::Comment,
        MetaField::Lyrics,
    ];
}

/// One open decoding session.
///
/// `decode` returns the number of bytes written into `out`; `Ok(0)` means end of stream.
pub trait Decoder: Send {
    /// Hand the decoder the reader it should pull bytes from.
    ///
    /// Only called when the owning factory reports [`DecoderFactory::wants_reader`].
    fn set_reader(&mut self, _reader: Option<StreamReader>) {}

    fn open(&mut self, path: &str) -> anyhow::Result<()>;

    fn close(&mut self);

    fn decode(&mut self, out: &mut [u8]) -> anyhow::Result<usize>;

    /// Seek to an absolute position in seconds. `false` when unsupported or failed.
    fn seek(&mut self, _second: u64) -> bool {
        false
    }

    fn samplerate(&self) -> Option<u32> {
        None
    }

    fn channels(&self) -> Option<u16> {
        None
    }

    /// Nominal bitrate in bits per second.
    fn bitrate(&self) -> Option<u32> {
        None
    }

    /// Bitrate of the most recently decoded chunk.
    fn current_bitrate(&self) -> Option<u32> {
        None
    }

    /// Track length in seconds.
    fn length(&self) -> Option<u32> {
        None
    }

    fn file_type(&self) -> Option<String> {
        None
    }

    /// Raw metadata bytes. `for_current_file` is false when asking about a file that is not
    /// the one being decoded (tag lookups for a playlist, for example).
    fn meta_data(&self, _field: MetaField, _for_current_file: bool) -> Option<Vec<u8>> {
        None
    }

    /// True once after the decoder saw new metadata mid-stream.
    fn meta_data_is_updated(&mut self) -> bool {
        false
    }

    fn meta_data_charset(&self) -> Charset {
        Charset::AutoDetect
    }
}

pub trait DecoderFactory: Send + Sync {
    /// Short unique id, e.g. `"symphonia"`.
    fn identifier(&self) -> &str;

    /// Human readable name for logs and device listings.
    fn name(&self) -> &str;

    /// Lower-case extensions without the dot.
    fn file_extensions(&self) -> &[&'static str];

    fn mime_types(&self) -> &[&'static str] {
        &[]
    }

    /// Whether the decoder reads through a [`StreamReader`] handed over by the orchestrator.
    fn wants_reader(&self) -> bool {
        false
    }

    fn check_magic_bytes(&self, _data: &[u8]) -> bool {
        false
    }

    fn create(&self) -> Box<dyn Decoder>;
}

/// Lookup table of decoder factories, searched in registration order.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: Vec<Arc<dyn DecoderFactory>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every decoder bundled with this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SymphoniaDecoderFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn DecoderFactory>) {
        tracing::debug!(
            id = factory.identifier(),
            name = factory.name(),
            "decoder registered"
        );
        self.factories.push(factory);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn DecoderFactory>> {
        self.factories.iter()
    }

    /// Match by the extension of `path` (a file path or URL; query strings are ignored).
    pub fn for_extension(&self, path: &str) -> Option<Arc<dyn DecoderFactory>> {
        let ext = extension_of(path)?;
        self.factories
            .iter()
            .find(|f| {
                f.file_extensions()
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(ext))
            })
            .cloned()
    }

    pub fn for_mime_type(&self, mime: &str) -> Option<Arc<dyn DecoderFactory>> {
        let mime = mime.split(';').next().unwrap_or(mime).trim();
        if mime.is_empty() {
            return None;
        }
        self.factories
            .iter()
            .find(|f| f.mime_types().iter().any(|m| m.eq_ignore_ascii_case(mime)))
            .cloned()
    }

    pub fn for_data(&self, data: &[u8]) -> Option<Arc<dyn DecoderFactory>> {
        if data.is_empty() {
            return None;
        }
        self.factories
            .iter()
            .find(|f| f.check_magic_bytes(data))
            .cloned()
    }
}

fn extension_of(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}
