//! Output device discovery and the CPAL-backed [`OutputBackend`].
//!
//! `cpal::Stream` is not `Send` on every host, so each open stream lives on its own
//! thread and is driven by commands over a channel.

use std::thread;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::output::{OutputBackend, OutputFormat, OutputStream};
use crate::sink::SinkConsumer;

/// Callback scratch size in source frames; larger host requests are served in chunks.
const SCRATCH_FRAMES: usize = 8_192;

/// Output device metadata for `--list-devices`.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
    pub is_default: bool,
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Describe every output device of `host`.
pub fn list_devices(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let mut out = Vec::new();
    for d in host.output_devices().context("No output devices")? {
        let name = d.description()?.name().to_string();
        let mut min_rate = u32::MAX;
        let mut max_rate = 0;
        let mut max_channels = 0;
        if let Ok(ranges) = d.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
                max_channels = max_channels.max(r.channels());
            }
        }
        if max_rate == 0 {
            tracing::warn!(device = %name, "skipping device without usable output configs");
            continue;
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            min_rate,
            max_rate,
            max_channels,
        });
    }
    Ok(out)
}

/// Pick an output config that runs at exactly `format.sample_rate`.
///
/// Prefers the source channel count, then stereo for mono sources, then any layout; within
/// that, `i16` over the other sample formats.
pub fn pick_output_config(
    device: &cpal::Device,
    format: OutputFormat,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<((u8, u8), cpal::SupportedStreamConfigRange)> = None;
    for range in device.supported_output_configs()? {
        let Some(rank) = rank_range(
            range.channels(),
            range.min_sample_rate(),
            range.max_sample_rate(),
            range.sample_format(),
            format,
        ) else {
            continue;
        };
        if best.as_ref().is_none_or(|(b, _)| rank < *b) {
            best = Some((rank, range));
        }
    }
    let (_, range) = best.ok_or_else(|| {
        anyhow!(
            "device supports no {} Hz / {} ch output",
            format.sample_rate,
            format.channels
        )
    })?;
    Ok(range.with_sample_rate(format.sample_rate))
}

/// Prefer a fixed buffer size if the device advertises one.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            const MAX_FRAMES: u32 = 4_096;
            Some(cpal::BufferSize::Fixed((*max).min(MAX_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Lower is better. `None` when the range cannot play `want` without resampling.
fn rank_range(
    channels: u16,
    min_rate: u32,
    max_rate: u32,
    sample_format: cpal::SampleFormat,
    want: OutputFormat,
) -> Option<(u8, u8)> {
    if want.sample_rate < min_rate || want.sample_rate > max_rate || channels == 0 {
        return None;
    }
    let channel_rank = if channels == want.channels {
        0
    } else if want.channels == 1 && channels == 2 {
        1
    } else {
        2
    };
    let format_rank = match sample_format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => return None,
    };
    Some((channel_rank, format_rank))
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Real audio output through CPAL's default host.
#[derive(Clone, Debug, Default)]
pub struct CpalOutput {
    device: Option<String>,
}

impl CpalOutput {
    /// `device` selects an output by name substring; `None` uses the default device.
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

enum Command {
    Play,
    Pause,
    Close,
}

impl OutputBackend for CpalOutput {
    fn open(&self, format: OutputFormat, consumer: SinkConsumer) -> Result<Box<dyn OutputStream>> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let needle = self.device.clone();
        let handle = thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || run_device(needle, format, consumer, cmd_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                commands: cmd_tx,
                handle: Some(handle),
            })),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(anyhow!("output thread exited before reporting"))
            }
        }
    }
}

fn run_device(
    needle: Option<String>,
    format: OutputFormat,
    consumer: SinkConsumer,
    commands: Receiver<Command>,
    ready: Sender<Result<()>>,
) {
    let stream = match build_stream(needle.as_deref(), format, consumer) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.pause() {
        tracing::debug!("initial pause not supported: {e}");
    }
    let _ = ready.send(Ok(()));

    for command in commands.iter() {
        match command {
            Command::Play => {
                if let Err(e) = stream.play() {
                    tracing::warn!("stream play failed: {e}");
                }
            }
            Command::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::warn!("stream pause failed: {e}");
                }
            }
            Command::Close => break,
        }
    }
    drop(stream);
    tracing::debug!("cpal output thread exiting");
}

fn build_stream(
    needle: Option<&str>,
    format: OutputFormat,
    consumer: SinkConsumer,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = pick_device(&host, needle)?;
    let supported = pick_output_config(&device, format)?;
    let mut config = supported.config();
    if let Some(buffer_size) = pick_buffer_size(&supported) {
        config.buffer_size = buffer_size;
    }
    tracing::info!(
        device = %device.description().map(|d| d.name().to_string()).unwrap_or_default(),
        rate_hz = config.sample_rate,
        channels = config.channels,
        sample_format = ?supported.sample_format(),
        "opening output stream"
    );
    match supported.sample_format() {
        cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, format, consumer),
        cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, format, consumer),
        cpal::SampleFormat::I32 => build_typed::<i32>(&device, &config, format, consumer),
        cpal::SampleFormat::U16 => build_typed::<u16>(&device, &config, format, consumer),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: OutputFormat,
    consumer: SinkConsumer,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<i16>,
{
    let out_channels = config.channels.max(1) as usize;
    let src_channels = format.channels.max(1) as usize;
    let scratch_frames = match config.buffer_size {
        cpal::BufferSize::Fixed(frames) => (frames as usize).max(SCRATCH_FRAMES),
        cpal::BufferSize::Default => SCRATCH_FRAMES,
    };
    let mut scratch = vec![0u8; scratch_frames * src_channels * 2];

    let err_fn = |err| tracing::warn!("stream error: {err}");
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            render(data, &mut scratch, src_channels, out_channels, |buf| {
                consumer.pull(buf);
            });
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Fill `data` with mapped frames, pulling at most `scratch.len()` bytes at a time.
/// `scratch` must hold at least one source frame.
fn render<T>(
    data: &mut [T],
    scratch: &mut [u8],
    src_channels: usize,
    out_channels: usize,
    mut pull: impl FnMut(&mut [u8]),
) where
    T: cpal::Sample + cpal::FromSample<i16>,
{
    let src_frame = src_channels * 2;
    let chunk_frames = (scratch.len() / src_frame).max(1);
    for out in data.chunks_mut(chunk_frames * out_channels) {
        let frames = out.len() / out_channels;
        let src = &mut scratch[..frames * src_frame];
        pull(&mut *src);
        for (frame, dst) in src.chunks_exact(src_frame).zip(out.chunks_exact_mut(out_channels)) {
            for (ch, slot) in dst.iter_mut().enumerate() {
                *slot = T::from_sample(mapped_sample(frame, src_channels, out_channels, ch));
            }
        }
    }
}

/// Sample for output channel `dst_ch` from one interleaved source frame.
fn mapped_sample(frame: &[u8], src_channels: usize, dst_channels: usize, dst_ch: usize) -> i16 {
    let get = |ch: usize| -> i16 {
        let i = ch * 2;
        if ch < src_channels && i + 1 < frame.len() {
            i16::from_ne_bytes([frame[i], frame[i + 1]])
        } else {
            0
        }
    };
    match (src_channels, dst_channels) {
        (2, 1) => ((get(0) as i32 + get(1) as i32) / 2) as i16,
        (1, _) => get(0),
        _ => get(dst_ch.min(src_channels - 1)),
    }
}

struct CpalStream {
    commands: Sender<Command>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OutputStream for CpalStream {
    fn play(&mut self) {
        let _ = self.commands.send(Command::Play);
    }

    fn pause(&mut self) {
        let _ = self.commands.send(Command::Pause);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn want(rate: u32, channels: u16) -> OutputFormat {
        OutputFormat {
            sample_rate: rate,
            channels,
        }
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn rank_rejects_rates_outside_range() {
        let f = cpal::SampleFormat::I16;
        assert!(rank_range(2, 48_000, 96_000, f, want(44_100, 2)).is_none());
        assert!(rank_range(2, 8_000, 44_100, f, want(48_000, 2)).is_none());
        assert!(rank_range(2, 44_100, 44_100, f, want(44_100, 2)).is_some());
    }

    #[test]
    fn rank_prefers_exact_channels_then_i16() {
        let exact_f32 = rank_range(2, 8_000, 192_000, cpal::SampleFormat::F32, want(44_100, 2));
        let exact_i16 = rank_range(2, 8_000, 192_000, cpal::SampleFormat::I16, want(44_100, 2));
        let wide_i16 = rank_range(8, 8_000, 192_000, cpal::SampleFormat::I16, want(44_100, 2));
        assert!(exact_i16 < exact_f32);
        assert!(exact_f32 < wide_i16);

        let mono_on_stereo = rank_range(2, 8_000, 192_000, cpal::SampleFormat::I16, want(22_050, 1));
        let mono_on_quad = rank_range(4, 8_000, 192_000, cpal::SampleFormat::I16, want(22_050, 1));
        assert!(mono_on_stereo < mono_on_quad);
    }

    #[test]
    fn channel_mapping() {
        let stereo: Vec<u8> = [1000i16, -3000]
            .iter()
            .flat_map(|s| s.to_ne_bytes())
            .collect();
        assert_eq!(mapped_sample(&stereo, 2, 2, 0), 1000);
        assert_eq!(mapped_sample(&stereo, 2, 2, 1), -3000);
        assert_eq!(mapped_sample(&stereo, 2, 1, 0), -1000);
        assert_eq!(mapped_sample(&stereo, 2, 4, 3), -3000);

        let mono = 700i16.to_ne_bytes();
        assert_eq!(mapped_sample(&mono, 1, 2, 0), 700);
        assert_eq!(mapped_sample(&mono, 1, 2, 1), 700);
    }

    #[test]
    fn render_pulls_in_chunks_that_fit_scratch() {
        // Room for two stereo frames; the host asks for five.
        let mut scratch = vec![0u8; 8];
        let mut data = [0i16; 10];
        let mut next = 0i16;
        let mut pulls = Vec::new();
        render(&mut data, &mut scratch, 2, 2, |buf| {
            pulls.push(buf.len());
            for sample in buf.chunks_exact_mut(2) {
                sample.copy_from_slice(&next.to_ne_bytes());
                next += 1;
            }
        });
        assert_eq!(pulls, vec![8, 8, 4]);
        assert_eq!(data, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(scratch.len(), 8);
    }

    #[test]
    fn render_maps_mono_source_to_stereo() {
        let mut scratch = vec![0u8; 4];
        let mut data = [0f32; 6];
        render(&mut data, &mut scratch, 1, 2, |buf| {
            for sample in buf.chunks_exact_mut(2) {
                sample.copy_from_slice(&i16::MAX.to_ne_bytes());
            }
        });
        assert!(data.iter().all(|s| (*s - 1.0).abs() < 1e-3));
    }
}
