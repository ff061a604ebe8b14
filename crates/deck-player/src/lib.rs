//! Audio streaming and playback core.
//!
//! A [`orchestrator::PlaybackOrchestrator`] turns file paths and HTTP URLs into PCM:
//! [`reader::StreamReader`] fetches bytes, a [`decoder::Decoder`] produces interleaved
//! `i16` samples and [`sink::AudioSink`] buffers them for the real-time output callback.

pub mod charset;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod events;
pub mod lyrics;
pub mod mailbox;
pub mod orchestrator;
pub mod output;
pub mod reader;
pub mod ring_buffer;
pub mod sink;
pub mod spectrum;
pub mod status;
pub mod track_info;

pub use config::PlayerConfig;
pub use error::PlayerError;
pub use orchestrator::PlaybackOrchestrator;
