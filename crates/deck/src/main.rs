//! deck: play local files and HTTP streams through the deck-player core.
//!
//! Each input is opened by the stream reader, decoded by the first matching decoder and
//! played on a CPAL output (or the null output with `--null-output`).

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use deck::cli::{Args, Command};
use deck::config::{DeckConfig, PlayConfig};
use deck::runtime;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,deck=info,deck_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    match &args.cmd {
        Some(Command::Play { inputs }) => {
            let file = match &args.config {
                Some(path) => DeckConfig::load(path)?,
                None => DeckConfig::default(),
            };
            runtime::run_play(PlayConfig::resolve(&args, inputs, file), true)
        }
        None => bail!("nothing to do: use `deck play <inputs>...` or `--list-devices`"),
    }
}
