//! Bundled decoder backed by Symphonia.
//!
//! Reads through the orchestrator's [`StreamReader`], so the same code path serves local
//! files and HTTP streams. Output is interleaved native-endian `i16`.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{
    MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey,
};
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use super::{Decoder, DecoderFactory, MetaField};
use crate::charset::Charset;
use crate::reader::{ReaderConfig, ReaderStatus, StreamReader};

const EXTENSIONS: &[&str] = &[
    "flac", "mp3", "mp2", "m4a", "aac", "alac", "wav", "aif", "aiff", "ogg", "oga",
];

const MIME_TYPES: &[&str] = &[
    "audio/flac",
    "audio/x-flac",
    "audio/mpeg",
    "audio/mp3",
    "audio/aac",
    "audio/aacp",
    "audio/mp4",
    "audio/wav",
    "audio/x-wav",
    "audio/aiff",
    "audio/x-aiff",
    "audio/ogg",
    "application/ogg",
];

pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn identifier(&self) -> &str {
        "symphonia"
    }

    fn name(&self) -> &str {
        "Symphonia (FLAC/MP3/AAC/ALAC/WAV/AIFF/Vorbis)"
    }

    fn file_extensions(&self) -> &[&'static str] {
        EXTENSIONS
    }

    fn mime_types(&self) -> &[&'static str] {
        MIME_TYPES
    }

    fn wants_reader(&self) -> bool {
        true
    }

    fn check_magic_bytes(&self, data: &[u8]) -> bool {
        if data.starts_with(b"fLaC") || data.starts_with(b"ID3") || data.starts_with(b"OggS") {
            return true;
        }
        if data.len() >= 12 {
            let riff = &data[..4] == b"RIFF" && &data[8..12] == b"WAVE";
            let aiff = &data[..4] == b"FORM" && (&data[8..12] == b"AIFF" || &data[8..12] == b"AIFC");
            if riff || aiff {
                return true;
            }
        }
        // MPEG audio frame sync: 11 set bits, layer bits non-zero.
        data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0 && data[1] & 0x06 != 0
    }

    fn create(&self) -> Box<dyn Decoder> {
        Box::new(SymphoniaDecoder::default())
    }
}

#[derive(Default)]
pub struct SymphoniaDecoder {
    reader: Option<StreamReader>,
    status: Option<ReaderStatus>,
    session: Option<Session>,
    meta: HashMap<MetaField, Vec<u8>>,
    meta_updated: bool,
}

struct Session {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    length_s: Option<u32>,
    bitrate: Option<u32>,
    recent_bitrate: Option<u32>,
    codec: Option<&'static str>,
    sample_buf: Option<(SampleBuffer<i16>, SignalSpec, usize)>,
    pending: Vec<u8>,
    pending_pos: usize,
    // Frames to drop after an accurate seek landed before the requested timestamp.
    skip_frames: u64,
}

impl Session {
    /// Decode the next packet of our track into `pending`. `false` at end of stream.
    fn next_chunk(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == IoErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.restart()?;
                    continue;
                }
                Err(e) => return Err(anyhow!(e).context("read packet")),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let packet_bytes = packet.buf().len();

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::warn!(reason, "skipping undecodable packet");
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == IoErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(e) => return Err(anyhow!(e).context("decode packet")),
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let spec = *decoded.spec();
            let capacity = decoded.capacity();
            let rebuild = match &self.sample_buf {
                Some((_, s, cap)) => *s != spec || *cap < capacity,
                None => true,
            };
            if rebuild {
                self.sample_buf = Some((
                    SampleBuffer::<i16>::new(capacity as u64, spec),
                    spec,
                    capacity,
                ));
            }
            let Some((buf, _, _)) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let channels = spec.channels.count().max(1);
            let skip = (self.skip_frames.min(frames as u64) as usize) * channels;
            self.skip_frames -= (skip / channels) as u64;
            let samples = &buf.samples()[skip..];

            self.pending.clear();
            self.pending.reserve(samples.len() * 2);
            for sample in samples {
                self.pending.extend_from_slice(&sample.to_ne_bytes());
            }
            self.pending_pos = 0;

            if spec.rate > 0 {
                let bits = packet_bytes as u64 * 8 * spec.rate as u64 / frames as u64;
                self.recent_bitrate = u32::try_from(bits).ok();
            }
            if self.pending.is_empty() {
                continue;
            }
            return Ok(true);
        }
    }

    /// A chained stream began a new logical bitstream: rebuild the codec for it.
    fn restart(&mut self) -> Result<()> {
        let (track_id, params, decoder) =
            audio_decoder(self.format.as_ref()).context("restart stream")?;
        if params.sample_rate.is_some() && params.sample_rate != self.sample_rate {
            // The output keeps running at the rate negotiated on open.
            tracing::warn!(
                old_rate_hz = ?self.sample_rate,
                new_rate_hz = ?params.sample_rate,
                "stream restarted at a different sample rate"
            );
        }
        self.codec = codec_name(&params);
        tracing::info!(track_id, codec = self.codec.unwrap_or("unknown"), "stream restarted");
        self.track_id = track_id;
        self.decoder = decoder;
        self.sample_buf = None;
        self.pending.clear();
        self.pending_pos = 0;
        self.skip_frames = 0;
        Ok(())
    }

    fn seek(&mut self, second: u64) -> bool {
        let target = SeekTo::Time {
            time: Time::new(second, 0.0),
            track_id: Some(self.track_id),
        };
        match self.format.seek(SeekMode::Accurate, target) {
            Ok(seeked) => {
                self.decoder.reset();
                self.pending.clear();
                self.pending_pos = 0;
                self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
                tracing::debug!(second, actual_ts = seeked.actual_ts, "seeked");
                true
            }
            Err(e) => {
                tracing::debug!(second, error = %e, "seek failed");
                false
            }
        }
    }
}

impl SymphoniaDecoder {
    fn absorb_revision(&mut self, rev: &MetadataRevision) -> bool {
        let mut changed = false;
        for (field, value) in revision_fields(rev) {
            if self.meta.get(&field) != Some(&value) {
                self.meta.insert(field, value);
                changed = true;
            }
        }
        changed
    }

    fn poll_live_metadata(&mut self) {
        let mut latest = None;
        if let Some(session) = self.session.as_mut() {
            let mut md = session.format.metadata();
            if !md.is_latest() {
                latest = md.skip_to_latest().map(revision_fields);
            }
        }
        if let Some(fields) = latest {
            for (field, value) in fields {
                if self.meta.get(&field) != Some(&value) {
                    self.meta.insert(field, value);
                    self.meta_updated = true;
                }
            }
        }
        if let Some(status) = &self.status {
            if status.take_title_update() {
                if let Some(title) = status.stream_title() {
                    self.meta.insert(MetaField::Title, title.into_bytes());
                    self.meta_updated = true;
                }
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn set_reader(&mut self, reader: Option<StreamReader>) {
        self.reader = reader;
    }

    fn open(&mut self, path: &str) -> Result<()> {
        self.close();
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => StreamReader::open(path, &ReaderConfig::default())
                .with_context(|| format!("open {path}"))?,
        };
        self.status = reader.status();
        let byte_len = reader.file_size();

        let mut hint = Hint::new();
        if let Some(ext) = super::extension_of(path) {
            hint.with_extension(ext);
        }
        if let Some(mime) = reader.content_type() {
            hint.mime_type(&mime);
        }

        let mss = MediaSourceStream::new(Box::new(reader), Default::default());
        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .with_context(|| format!("probe {path}"))?;

        let (track_id, params, decoder) =
            audio_decoder(probed.format.as_ref()).with_context(|| format!("open {path}"))?;

        if let Some(mut md) = probed.metadata.get() {
            if let Some(rev) = md.skip_to_latest() {
                self.absorb_revision(rev);
            }
        }
        if let Some(rev) = probed.format.metadata().skip_to_latest() {
            self.absorb_revision(rev);
        }

        let sample_rate = params.sample_rate;
        let length_s = length_seconds(&params);
        let bitrate = match (byte_len, length_s) {
            (Some(bytes), Some(secs)) if secs > 0 => u32::try_from(bytes * 8 / secs as u64).ok(),
            _ => None,
        };
        let session = Session {
            format: probed.format,
            decoder,
            track_id,
            sample_rate,
            channels: params
                .channels
                .and_then(|c| u16::try_from(c.count()).ok()),
            length_s,
            bitrate,
            recent_bitrate: None,
            codec: codec_name(&params),
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            skip_frames: 0,
        };
        tracing::info!(
            path,
            codec = session.codec.unwrap_or("unknown"),
            rate_hz = sample_rate.unwrap_or(0),
            channels = session.channels.unwrap_or(0),
            "decoder opened"
        );
        self.session = Some(session);
        Ok(())
    }

    fn close(&mut self) {
        self.session = None;
        self.status = None;
        self.meta.clear();
        self.meta_updated = false;
    }

    fn decode(&mut self, out: &mut [u8]) -> Result<usize> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("decoder not open"))?;
        let mut written = 0;
        while written < out.len() {
            if session.pending_pos < session.pending.len() {
                let n = (session.pending.len() - session.pending_pos).min(out.len() - written);
                out[written..written + n]
                    .copy_from_slice(&session.pending[session.pending_pos..session.pending_pos + n]);
                session.pending_pos += n;
                written += n;
                continue;
            }
            if !session.next_chunk()? {
                break;
            }
        }
        self.poll_live_metadata();
        Ok(written)
    }

    fn seek(&mut self, second: u64) -> bool {
        self.session
            .as_mut()
            .is_some_and(|session| session.seek(second))
    }

    fn samplerate(&self) -> Option<u32> {
        self.session.as_ref()?.sample_rate
    }

    fn channels(&self) -> Option<u16> {
        self.session.as_ref()?.channels
    }

    fn bitrate(&self) -> Option<u32> {
        self.session.as_ref()?.bitrate
    }

    fn current_bitrate(&self) -> Option<u32> {
        self.session.as_ref()?.recent_bitrate
    }

    fn length(&self) -> Option<u32> {
        self.session.as_ref()?.length_s
    }

    fn file_type(&self) -> Option<String> {
        self.session.as_ref()?.codec.map(str::to_string)
    }

    fn meta_data(&self, field: MetaField, for_current_file: bool) -> Option<Vec<u8>> {
        if !for_current_file {
            return None;
        }
        self.meta.get(&field).cloned()
    }

    fn meta_data_is_updated(&mut self) -> bool {
        std::mem::take(&mut self.meta_updated)
    }

    fn meta_data_charset(&self) -> Charset {
        Charset::Utf8
    }
}

fn revision_fields(rev: &MetadataRevision) -> Vec<(MetaField, Vec<u8>)> {
    let mut fields = Vec::new();
    for tag in rev.tags() {
        let field = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => MetaField::Title,
            Some(StandardTagKey::Artist) => MetaField::Artist,
            Some(StandardTagKey::Album) => MetaField::Album,
            Some(StandardTagKey::TrackNumber) => MetaField::TrackNr,
            Some(StandardTagKey::Date) | Some(StandardTagKey::ReleaseDate) => MetaField::Date,
            Some(StandardTagKey::Comment) => MetaField::Comment,
            Some(StandardTagKey::Lyrics) => MetaField::Lyrics,
            _ => continue,
        };
        fields.push((field, tag.value.to_string().into_bytes()));
    }
    let cover = rev
        .visuals()
        .iter()
        .find(|v| v.usage == Some(StandardVisualKey::FrontCover))
        .or_else(|| rev.visuals().first());
    if let Some(visual) = cover {
        fields.push((MetaField::ImageData, visual.data.to_vec()));
        fields.push((MetaField::ImageMimeType, visual.media_type.clone().into_bytes()));
    }
    fields
}

/// First audio track of `format` and a codec for it.
fn audio_decoder(
    format: &dyn FormatReader,
) -> Result<(u32, CodecParameters, Box<dyn symphonia::core::codecs::Decoder>)> {
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio track"))?;
    let params = track.codec_params.clone();
    let decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .context("no codec for track")?;
    Ok((track.id, params, decoder))
}

fn length_seconds(params: &CodecParameters) -> Option<u32> {
    let frames = params.n_frames?;
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    u32::try_from(frames / rate).ok()
}

fn codec_name(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP1 | CODEC_TYPE_MP2 | CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}
