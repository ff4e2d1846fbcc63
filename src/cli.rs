//! Command-line interface for Parley
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;

/// Parley - Real-time voice conversations with a remote agent
#[derive(Parser, Debug, Default)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace (includes per-chunk scheduling), -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// API key for the conversational endpoint
    #[arg(long, env = "PARLEY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// WebSocket endpoint URL (overrides the saved setting)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Model name sent in the session setup (overrides the saved setting)
    #[arg(long)]
    pub model: Option<String>,

    /// Close an open session after this many seconds without agent audio
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout_secs: Option<u64>,

    /// Remember --endpoint, --model and --idle-timeout-secs for later runs
    #[arg(long)]
    pub save: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set parley modules to requested verbosity level
    builder.filter_module("parley", args.log_level());

    // Network and GUI framework modules only at -vvvv (very verbose)
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("rustls", args.log_level());
        builder.filter_module("gpui", args.log_level());
        builder.filter_module("blade_graphics", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_flags() {
        let args = Args::parse_from(["parley", "-vv"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::parse_from(["parley", "-q", "-vvv"]);
        assert_eq!(args.log_level(), LevelFilter::Error);

        assert_eq!(Args::default().log_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_session_overrides() {
        let args = Args::parse_from([
            "parley",
            "--api-key",
            "abc",
            "--model",
            "models/other",
            "--idle-timeout-secs",
            "5",
        ]);
        assert_eq!(args.api_key.as_deref(), Some("abc"));
        assert_eq!(args.model.as_deref(), Some("models/other"));
        assert_eq!(args.idle_timeout_secs, Some(5));
        assert!(args.endpoint.is_none());

        assert!(Args::try_parse_from(["parley", "--idle-timeout-secs", "0"]).is_err());
    }
}
