use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "deck", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML config file (a `[player]` table plus `device`/`volume`)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Volume index, 0 (mute) to 14 (full scale)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=14))]
    pub volume: Option<u8>,

    /// Decode in real time without opening an audio device
    #[arg(long)]
    pub null_output: bool,

    /// Fade out instead of cutting when skipping
    #[arg(long)]
    pub fade_on_skip: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files and/or http:// URLs in order
    Play {
        #[arg(required = true)]
        inputs: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_overrides() {
        let args = Args::try_parse_from([
            "deck",
            "--volume",
            "9",
            "--null-output",
            "play",
            "a.flac",
            "http://radio.example/live",
        ])
        .unwrap();
        assert_eq!(args.volume, Some(9));
        assert!(args.null_output);
        assert!(!args.fade_on_skip);
        match args.cmd {
            Some(Command::Play { inputs }) => {
                assert_eq!(inputs, vec!["a.flac", "http://radio.example/live"]);
            }
            None => panic!("expected play"),
        }
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["deck", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }

    #[test]
    fn rejects_out_of_range_volume_and_empty_play() {
        assert!(Args::try_parse_from(["deck", "--volume", "15", "play", "a.mp3"]).is_err());
        assert!(Args::try_parse_from(["deck", "play"]).is_err());
    }
}
