use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "webirc-bridge",
    version,
    about = "Reverse proxy bridging IRCv3-over-WebSocket clients to a conventional ircd"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    pub config: PathBuf,
}
