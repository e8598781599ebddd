//! Command-line interface definitions for lensproxy.
//!
//! Uses clap's derive API for type-safe argument parsing.

use crate::proxy::FilterMode;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Interactive TLS-intercepting proxy.
///
/// lensproxy accepts CONNECT tunnels, classifies the first bytes of each
/// one, and decrypts TLS traffic for selected hosts by minting per-host
/// certificates signed by a local root. Everything else is relayed
/// untouched.
#[derive(Parser, Debug)]
#[command(name = "lensproxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    ///
    /// Format: HOST:PORT (e.g. 127.0.0.1:8080). Port 0 asks the OS for a
    /// free port. Overrides the config file.
    #[arg(short = 'l', long = "listen", value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Path to a TOML config file.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable TLS interception.
    ///
    /// Without this flag (or `decrypt.enabled` in the config file) every
    /// tunnel is relayed without inspection.
    #[arg(long = "decrypt")]
    pub decrypt: bool,

    /// How --decrypt-host patterns are interpreted.
    #[arg(long = "decrypt-mode", value_name = "MODE")]
    pub decrypt_mode: Option<DecryptModeArg>,

    /// Host pattern for the decrypt policy (repeatable).
    ///
    /// Patterns allow `*` wildcards and match the hostname or
    /// hostname:port, case-insensitively.
    #[arg(long = "decrypt-host", value_name = "PATTERN")]
    pub decrypt_hosts: Vec<String>,

    /// Maximum number of cached per-host TLS contexts.
    #[arg(long = "cache-capacity", value_name = "N")]
    pub cache_capacity: Option<usize>,

    /// Print the root certificate PEM on startup.
    ///
    /// Import it into a client trust store to accept intercepted sessions.
    #[arg(long = "print-root-ca")]
    pub print_root_ca: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// CLI spelling of the decrypt filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecryptModeArg {
    /// Decrypt only matching targets.
    Include,
    /// Decrypt everything except matching targets.
    Exclude,
}

impl From<DecryptModeArg> for FilterMode {
    fn from(mode: DecryptModeArg) -> Self {
        match mode {
            DecryptModeArg::Include => FilterMode::Include,
            DecryptModeArg::Exclude => FilterMode::Exclude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_defaults() {
        let cli = Cli::parse_from(["lensproxy"]);
        assert!(cli.listen.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.decrypt);
        assert!(cli.decrypt_mode.is_none());
        assert!(cli.decrypt_hosts.is_empty());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_parse_full() {
        let cli = Cli::parse_from([
            "lensproxy",
            "-l",
            "0.0.0.0:3128",
            "-c",
            "/etc/lensproxy.toml",
            "--decrypt",
            "--decrypt-mode",
            "exclude",
            "--decrypt-host",
            "*.internal",
            "--decrypt-host",
            "telemetry.example.com",
            "--cache-capacity",
            "32",
            "-vv",
        ]);

        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:3128"));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/lensproxy.toml")));
        assert!(cli.decrypt);
        assert_eq!(cli.decrypt_mode, Some(DecryptModeArg::Exclude));
        assert_eq!(cli.decrypt_hosts, vec!["*.internal", "telemetry.example.com"]);
        assert_eq!(cli.cache_capacity, Some(32));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_mode_conversion() {
        assert_eq!(FilterMode::from(DecryptModeArg::Include), FilterMode::Include);
        assert_eq!(FilterMode::from(DecryptModeArg::Exclude), FilterMode::Exclude);
    }
}
