//! Command-line surface

use clap::Parser;
use std::path::PathBuf;

/// Peer-to-peer file and directory transfer with operator-gated receiving
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// TCP port used for the listener and for outbound connections
    #[arg(short, long, default_value_t = crate::protocol::DEFAULT_PORT)]
    pub port: u16,

    /// Directory where inbound transfers are placed
    #[arg(short = 'r', long, default_value = "./received")]
    pub receive_root: PathBuf,

    /// Do not accept inbound connections (outbound-only mode)
    #[arg(long)]
    pub no_listen: bool,

    /// Write timestamped report lines to a file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}
