use serde::Deserialize;

use crate::reader::ReaderConfig;

/// Playback tuning and policy shared by the orchestrator, sink and stream reader.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlayerConfig {
    /// `;`-separated lyrics file patterns. `$` is the track basename without extension.
    pub lyrics_file_pattern: String,
    /// Release the audio device between tracks when nothing else is queued.
    pub close_device_on_idle: bool,
    /// Fade out instead of cutting when a new file is requested mid-track.
    pub fade_on_skip: bool,
    /// Network read-ahead cache size in KB.
    pub network_cache_kb: usize,
    /// Bytes (in KB) cached before a network stream counts as ready.
    pub network_prebuffer_kb: usize,
    /// TCP connect timeout for network sources.
    pub connect_timeout_ms: u64,
    /// 100 ms cycles without cache growth before buffering is abandoned.
    pub buffering_stall_cycles: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            lyrics_file_pattern: "$.txt;$.lrc".to_string(),
            close_device_on_idle: false,
            fade_on_skip: false,
            network_cache_kb: 512,
            network_prebuffer_kb: 128,
            connect_timeout_ms: 5000,
            buffering_stall_cycles: 50,
        }
    }
}

impl PlayerConfig {
    /// Stream reader settings derived from the network fields.
    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig::new(self.network_cache_kb, self.network_prebuffer_kb)
            .with_connect_timeout(std::time::Duration::from_millis(self.connect_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.lyrics_file_pattern, "$.txt;$.lrc");
        assert!(!cfg.close_device_on_idle);
        assert_eq!(cfg.network_cache_kb, 512);
        assert_eq!(cfg.network_prebuffer_kb, 128);
        assert_eq!(cfg.buffering_stall_cycles, 50);
    }

    #[test]
    fn reader_config_applies_clamps() {
        let cfg = PlayerConfig {
            network_cache_kb: 64,
            network_prebuffer_kb: 1024,
            ..PlayerConfig::default()
        };
        let reader = cfg.reader_config();
        assert_eq!(reader.cache_bytes(), 256 * 1024);
        assert_eq!(reader.prebuffer_bytes(), 192 * 1024);
    }
}
