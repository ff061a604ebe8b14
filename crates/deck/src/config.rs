//! Configuration loading.
//!
//! File values come from TOML; command line flags override them.

use std::path::Path;

use anyhow::{Context, Result};
use deck_player::PlayerConfig;
use serde::Deserialize;

use crate::cli::Args;

/// Top-level config file schema.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeckConfig {
    /// Output device name substring.
    pub device: Option<String>,
    /// Initial volume index (0..=14).
    pub volume: Option<u8>,
    /// Playback core settings.
    pub player: PlayerConfig,
}

impl DeckConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<DeckConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }
}

/// Everything `deck play` needs, after merging file and flags.
#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub inputs: Vec<String>,
    pub device: Option<String>,
    pub volume: Option<u8>,
    pub null_output: bool,
    pub player: PlayerConfig,
}

impl PlayConfig {
    pub fn resolve(args: &Args, inputs: &[String], file: DeckConfig) -> Self {
        let mut player = file.player;
        if args.fade_on_skip {
            player.fade_on_skip = true;
        }
        Self {
            inputs: inputs.to_vec(),
            device: args.device.clone().or(file.device),
            volume: args.volume.or(file.volume),
            null_output: args.null_output,
            player,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn missing_tables_fall_back_to_defaults() {
        let cfg: DeckConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, DeckConfig::default());
        assert_eq!(cfg.player.lyrics_file_pattern, "$.txt;$.lrc");
    }

    #[test]
    fn load_reads_player_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.toml");
        std::fs::write(
            &path,
            "device = \"USB\"\nvolume = 10\n\n[player]\nnetwork_cache_kb = 1024\nclose_device_on_idle = true\n",
        )
        .unwrap();
        let cfg = DeckConfig::load(&path).unwrap();
        assert_eq!(cfg.device.as_deref(), Some("USB"));
        assert_eq!(cfg.volume, Some(10));
        assert_eq!(cfg.player.network_cache_kb, 1024);
        assert!(cfg.player.close_device_on_idle);
        assert_eq!(cfg.player.network_prebuffer_kb, 128);
    }

    #[test]
    fn load_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "volume = \"loud\"").unwrap();
        let err = DeckConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
        assert!(DeckConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn flags_override_file_values() {
        let args =
            Args::try_parse_from(["deck", "--volume", "3", "--fade-on-skip", "play", "x.flac"])
                .unwrap();
        let file = DeckConfig {
            device: Some("DAC".to_string()),
            volume: Some(12),
            player: PlayerConfig::default(),
        };
        let cfg = PlayConfig::resolve(&args, &["x.flac".to_string()], file);
        assert_eq!(cfg.volume, Some(3));
        assert_eq!(cfg.device.as_deref(), Some("DAC"));
        assert!(cfg.player.fade_on_skip);
        assert!(!cfg.null_output);
    }
}
