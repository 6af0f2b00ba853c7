mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use clangaroo::cache::QueryCache;
use clangaroo::config::Config;
use clangaroo::tiers::{AnalysisRequest, QueryOptions};
use clangaroo::{mcp, AnalysisError, ExitCode, ServiceContext};
use cli::{build_request, CacheCommands, Cli, Commands};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = match cli.config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::Usage.into();
        }
    };

    let outcome = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Cache { command } => cache(&config, command),
        Commands::Query {
            operation,
            target,
            query,
            pattern,
            depth,
            no_declaration,
            summarize,
        } => {
            let options = QueryOptions {
                include_declaration: !no_declaration,
                depth,
                summarize,
            };
            match build_request(operation, target.as_deref(), query, pattern, options) {
                Ok(request) => run_query(config, operation.name(), request).await,
                Err(err) => {
                    error!("{err:#}");
                    Ok(ExitCode::Usage)
                }
            }
        }
    };
    outcome.unwrap_or_else(failure).into()
}

fn failure(err: anyhow::Error) -> ExitCode {
    error!("{err:#}");
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AnalysisError>())
        .map(ExitCode::for_error)
        .unwrap_or(ExitCode::Failed)
}

async fn run_query(config: Config, name: &str, request: AnalysisRequest) -> Result<ExitCode> {
    let service = ServiceContext::start(config)
        .await
        .context("failed to start the analysis service")?;
    let outcome = service.query(request).await;
    service.shutdown().await;
    match outcome {
        Ok(answer) => {
            println!("{}", serde_json::to_string_pretty(&answer)?);
            Ok(if answer.is_empty() {
                ExitCode::NotFound
            } else {
                ExitCode::Success
            })
        }
        Err(err) => {
            error!("{name} failed: {err}");
            Ok(ExitCode::for_error(&err))
        }
    }
}

/// Logs go to stderr; stdout belongs to the tool protocol.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .target(env_logger::Target::Stderr)
        .init();
}

async fn serve(config: Config) -> Result<ExitCode> {
    let service = Arc::new(
        ServiceContext::start(config)
            .await
            .context("failed to start the analysis service")?,
    );
    let served = tokio::select! {
        result = mcp::run_server(service.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; shutting down");
            Ok(())
        }
    };
    service.shutdown().await;
    served.map(|_| ExitCode::Success)
}

fn cache(config: &Config, command: CacheCommands) -> Result<ExitCode> {
    let cache = QueryCache::open(&config.cache_db_path(), config.cache_ttl, config.ai.cache_ttl);
    match command {
        CacheCommands::Stats => {
            println!("{}", serde_json::to_string_pretty(&cache.stats())?);
        }
        CacheCommands::Clear => {
            let removed = cache.clear();
            println!("removed {removed} cached entries");
        }
    }
    Ok(ExitCode::Success)
}
