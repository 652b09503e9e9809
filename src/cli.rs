// Command line for the relay node

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Relay node CLI
#[derive(Debug, Parser)]
#[command(name = "anonrelay")]
#[command(about = "Cypherpunk remailer node with a durable delivery queue")]
pub struct RelayCli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: RelayCommand,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum RelayCommand {
    /// Poll the spool and pump the queue until interrupted
    Run,

    /// Ingest the spool directory once
    Ingest,

    /// Run one delivery pass over the queue
    Pump,

    /// Enqueue a raw message read from stdin
    Submit {
        /// Envelope sender
        #[arg(short, long)]
        from: String,

        /// Envelope recipient (repeatable)
        #[arg(short, long, required = true)]
        to: Vec<String>,
    },

    /// Wrap the message on stdin for a remailer chain
    Wrap {
        /// Remailer address, first hop first (repeatable)
        #[arg(short, long, required = true)]
        to: Vec<String>,

        /// Armored public key of the matching hop (repeatable)
        #[arg(short, long, required = true)]
        key: Vec<PathBuf>,

        /// DEFLATE level 1-9 for ZPGP layers (0 or unset: plain PGP)
        #[arg(short, long)]
        level: Option<u32>,
    },

    /// Peel the remailer message on stdin with the configured keys
    Unwrap,

    /// List queue entries
    List {
        /// Queue name (default: the configured inbound queue)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Encrypt the mail on stdin into an envelope-protected message
    Seal {
        /// Armored recipient public key (repeatable)
        #[arg(short, long, required = true)]
        key: Vec<PathBuf>,

        /// Outer To header
        #[arg(short, long)]
        to: Option<String>,
    },

    /// Decrypt a sealed message from stdin
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = RelayCli::try_parse_from(["anonrelay", "pump"]).unwrap();
        assert!(matches!(cli.command, RelayCommand::Pump));
        assert!(cli.config.is_none());

        let cli = RelayCli::try_parse_from([
            "anonrelay",
            "submit",
            "--from",
            "a@example.org",
            "--to",
            "b@example.org",
            "--to",
            "c@example.org",
            "--config",
            "relay.json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("relay.json")));
        match cli.command {
            RelayCommand::Submit { from, to } => {
                assert_eq!(from, "a@example.org");
                assert_eq!(to, vec!["b@example.org", "c@example.org"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_wrap_parsing() {
        let cli = RelayCli::try_parse_from([
            "anonrelay", "wrap", "-t", "hop1@example.net", "-k", "hop1.asc", "-t",
            "hop2@example.net", "-k", "hop2.asc", "--level", "9",
        ])
        .unwrap();
        match cli.command {
            RelayCommand::Wrap { to, key, level } => {
                assert_eq!(to.len(), 2);
                assert_eq!(key[1], PathBuf::from("hop2.asc"));
                assert_eq!(level, Some(9));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_submit_needs_recipient() {
        assert!(RelayCli::try_parse_from(["anonrelay", "submit", "--from", "a@example.org"]).is_err());
    }
}
