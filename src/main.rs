use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use nlsh_guard::GuardError;
use nlsh_guard::cli::{
    CacheCommand, Cli, Commands, run_cache_clear, run_cache_export, run_cache_import,
    run_cache_stats, run_generate, run_reset, run_risk, run_status, run_validate,
};
use nlsh_guard::config::load_or_default;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries only the command; everything else goes to stderr
    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nlsh-guard: {e:#}");
            ExitCode::from(e.downcast_ref::<GuardError>().map_or(1, GuardError::exit_code))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_or_default(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load default config".to_string(),
    })?;
    debug!(
        safe_mode = config.security.safe_mode,
        backend = %config.backend.program,
        "Configuration loaded"
    );

    let mut out = io::stdout().lock();
    match cli.command {
        Commands::Generate {
            request,
            restricted,
            no_cache,
        } => {
            run_generate(&config, &request.join(" "), restricted, !no_cache, &mut out).await?;
        }
        Commands::Validate {
            command,
            restricted,
        } => run_validate(&config, &command, restricted, &mut out)?,
        Commands::Risk { command } => run_risk(&command, &mut out)?,
        Commands::Cache { action } => match action {
            CacheCommand::Clear { older_than } => run_cache_clear(&config, older_than, &mut out)?,
            CacheCommand::Stats => run_cache_stats(&config, &mut out)?,
            CacheCommand::Export { key } => run_cache_export(&config, &key, &mut out)?,
            CacheCommand::Import { file } => run_cache_import(&config, &file, &mut out)?,
        },
        Commands::Reset {
            rate_limit,
            breaker,
        } => run_reset(&config, rate_limit, breaker, &mut out)?,
        Commands::Status => run_status(&config, &mut out)?,
    }

    Ok(())
}
