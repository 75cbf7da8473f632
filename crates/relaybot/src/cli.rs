use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relaybot")]
#[command(author, version, about = "Relay server between a Telegram Mini App and its bot", long_about = None)]
pub struct Cli {
    /// Path to config.yaml (default: ./bot/config.yaml, then ./config.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not contact Telegram; notifier calls report failure
        #[arg(long)]
        offline: bool,
    },

    /// Print the resolved configuration (token redacted) and exit
    PrintConfig,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
