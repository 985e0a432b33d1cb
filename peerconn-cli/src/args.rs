//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// PeerConn - paired message and file channels between two hosts.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,

    /// Display name announced to the peer (overrides config).
    #[arg(long, global = true)]
    pub name: Option<String>,

    /// Directory for received files (overrides config).
    #[arg(long, global = true)]
    pub download_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Wait for a peer on a message port and a file port.
    Listen {
        #[arg(long)]
        message_port: u16,
        #[arg(long)]
        file_port: u16,
        /// Local address to bind. Defaults to this host's outbound IPv4 address.
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Connect to a listening peer.
    Dial {
        address: String,
        #[arg(long)]
        message_port: u16,
        #[arg(long)]
        file_port: u16,
        #[arg(long)]
        id: Option<String>,
    },
}

impl Args {
    /// Default tracing directive for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen() {
        let args = Args::parse_from([
            "peerconn",
            "listen",
            "--message-port",
            "5000",
            "--file-port",
            "5001",
            "-vv",
        ]);
        assert_eq!(args.log_filter(), "trace");
        match args.mode {
            Mode::Listen {
                message_port,
                file_port,
                address,
                id,
            } => {
                assert_eq!((message_port, file_port), (5000, 5001));
                assert!(address.is_none());
                assert!(id.is_none());
            }
            Mode::Dial { .. } => panic!("expected listen"),
        }
    }

    #[test]
    fn parses_dial_with_globals() {
        let args = Args::parse_from([
            "peerconn",
            "--name",
            "alice",
            "dial",
            "10.0.0.2",
            "--message-port",
            "5000",
            "--file-port",
            "5001",
            "--id",
            "c1",
        ]);
        assert_eq!(args.name.as_deref(), Some("alice"));
        assert_eq!(args.log_filter(), "info");
        assert!(matches!(args.mode, Mode::Dial { ref address, ref id, .. }
            if address == "10.0.0.2" && id.as_deref() == Some("c1")));
    }
}
