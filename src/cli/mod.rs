//! CLI module for direct command-line usage
//!
//! Every subcommand goes through the same library components as an
//! embedding shell front-end would.

mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use runner::{
    run_cache_clear, run_cache_export, run_cache_import, run_cache_stats, run_generate, run_reset,
    run_risk, run_status, run_validate,
};

/// nlsh-guard - Safety and resilience layer for natural-language shell commands
#[derive(Parser)]
#[command(name = "nlsh-guard")]
#[command(about = "Vet LLM-generated shell commands before they reach your terminal")]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Generate a command from a natural-language request
    nlsh-guard generate list the ten largest files here

    # Only accept read-only commands
    nlsh-guard generate --restricted show disk usage

    # Check a command without generating anything
    nlsh-guard validate \"find . -name '*.log' -delete\"

    # Show limiter tokens and breaker states
    nlsh-guard status

    # Drop cache entries older than a day
    nlsh-guard cache clear --older-than 86400")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Turn a request into a vetted shell command
    Generate {
        /// Natural-language request
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,

        /// Only accept read-only commands
        #[arg(long)]
        restricted: bool,

        /// Neither read nor write the command cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Check a command against the safety rules
    Validate {
        /// Command to check
        command: String,

        /// Apply the read-only allowlist
        #[arg(long)]
        restricted: bool,
    },

    /// Print the risk level of a command
    Risk {
        /// Command to classify
        command: String,
    },

    /// Manage the command cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Reset limiter and breaker state (both when no flag is given)
    Reset {
        /// Refill the rate limiter bucket
        #[arg(long)]
        rate_limit: bool,

        /// Close every circuit breaker
        #[arg(long)]
        breaker: bool,
    },

    /// Show effective configuration, limiter tokens and breaker states
    Status,
}

/// Cache maintenance commands
#[derive(Subcommand)]
pub enum CacheCommand {
    /// Remove entries (all of them unless --older-than is given)
    Clear {
        /// Only remove entries created more than SECS seconds ago
        #[arg(long, value_name = "SECS")]
        older_than: Option<u64>,
    },

    /// Show entry count and payload size
    Stats,

    /// Print one entry in the portable export format
    Export {
        /// Cache key (64 hex characters)
        key: String,
    },

    /// Load an entry from an export file
    Import {
        /// Export file to read
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_joins_words() {
        let cli = Cli::try_parse_from(["nlsh-guard", "generate", "list", "files", "--restricted"])
            .unwrap();
        match cli.command {
            Commands::Generate {
                request,
                restricted,
                no_cache,
            } => {
                assert_eq!(request, vec!["list", "files"]);
                assert!(restricted);
                assert!(!no_cache);
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn test_generate_requires_request() {
        assert!(Cli::try_parse_from(["nlsh-guard", "generate"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["nlsh-guard", "status", "-v", "-c", "/tmp/c.yaml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
    }

    #[test]
    fn test_cache_clear_older_than() {
        let cli =
            Cli::try_parse_from(["nlsh-guard", "cache", "clear", "--older-than", "60"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheCommand::Clear {
                    older_than: Some(60)
                }
            }
        ));
    }

    #[test]
    fn test_reset_flags() {
        let cli = Cli::try_parse_from(["nlsh-guard", "reset", "--breaker"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Reset {
                rate_limit: false,
                breaker: true
            }
        ));
    }
}
