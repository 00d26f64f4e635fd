//! Bosun command-line interface.

use clap::Parser;

mod client;
mod commands;
mod config;
mod executor;
mod handlers;
mod logging;
mod server;
mod tryjob;

use bosun_scheduler::config::LogFormat;
use bosun_scheduler::MasterConfig;
use commands::{Commands, LogFormatArg};
use config::CliConfig;
use handlers::{ChangeArgs, TryArgs};

#[derive(Parser)]
#[command(name = "bosun")]
#[command(author, version, about = "Bosun build coordinator", long_about = None)]
struct Cli {
    /// Log output format; overrides the master configuration
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Tracing filter directives; RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn resolve_format(arg: Option<LogFormatArg>, configured: LogFormat) -> LogFormat {
    match arg {
        Some(LogFormatArg::Text) => LogFormat::Text,
        Some(LogFormatArg::Json) => LogFormat::Json,
        None => configured,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_format = cli.log_format;
    let log_filter = cli.log_filter;
    let init_client_logging = || {
        logging::init_tracing(
            resolve_format(log_format, LogFormat::Text),
            Some(log_filter.as_deref().unwrap_or("warn")),
        )
    };

    match cli.command {
        Commands::Serve { config } => {
            let master_config = MasterConfig::from_file(&config)?;
            let filter = log_filter.clone().or_else(|| master_config.logging.filter.clone());
            logging::init_tracing(
                resolve_format(log_format, master_config.logging.format),
                filter.as_deref(),
            );
            server::serve(&config, master_config).await?;
        }
        Commands::Validate { config } => {
            init_client_logging();
            handlers::validate(&config)?;
        }
        Commands::Try {
            jobdir,
            builders,
            branch,
            revision,
            diff,
            patchlevel,
            who,
            comment,
            codebase,
            repository,
            project,
            properties,
        } => {
            init_client_logging();
            handlers::try_job(TryArgs {
                jobdir,
                builders,
                branch,
                revision,
                diff,
                patchlevel,
                who,
                comment,
                codebase,
                repository,
                project,
                properties,
            })?;
        }
        Commands::Sendchange {
            master,
            who,
            branch,
            revision,
            category,
            project,
            repository,
            codebase,
            comments,
            files,
        } => {
            init_client_logging();
            let config = CliConfig::load().unwrap_or_default();
            handlers::sendchange(
                &config,
                ChangeArgs {
                    master,
                    who,
                    branch,
                    revision,
                    category,
                    project,
                    repository,
                    codebase,
                    comments,
                    files,
                },
            )
            .await?;
        }
    }

    Ok(())
}
