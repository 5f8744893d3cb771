//! # Command-Line Interface
//!
//! Argument parsing for the gateway binary, built on the `clap` derive
//! API. The binary is configuration-file driven; the command line only
//! selects the file, the log destination and the verbosity.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Help-message styling, matching the classic clap v3 appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Programmable L4 network gateway.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Validate the configuration and exit without starting the gateway
    #[arg(long)]
    pub validate_only: bool,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress user-facing console output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Detailed log destination: a file path, or "stderr"
    #[arg(long)]
    pub log_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let args = Args::parse_from(["l4-gateway", "--config", "gateway.json"]);
        assert_eq!(args.config, PathBuf::from("gateway.json"));
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(!args.validate_only);
    }

    #[test]
    fn counts_verbosity_flags() {
        let args = Args::parse_from(["l4-gateway", "-c", "g.json", "-vv", "--quiet"]);
        assert_eq!(args.verbose, 2);
        assert!(args.quiet);
    }
}
