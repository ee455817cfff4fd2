use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::{Parser, Subcommand};
use service::Service;

mod artifacts;
mod auth;
mod config;
mod http_objects;
mod key_locks;
mod middleware;
mod range;
mod routes;
mod service;
mod signed_url;
mod signing;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print a runner bearer token signed with the configured secret.
    IssueToken {
        #[arg(long)]
        runner_id: String,
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        job_id: String,
    },
}

fn issue_token(
    config: &config::ServerConfig,
    runner_id: &str,
    run_id: &str,
    job_id: &str,
) -> anyhow::Result<String> {
    if config.artifacts.signing_secret.is_none() {
        anyhow::bail!("artifacts.signing_secret must be set to issue tokens");
    }
    let key = signing::SigningKey::from_config(config.artifacts.signing_secret.as_deref())?;
    let tokens = auth::TokenService::new(key, config.artifacts.token_ttl());
    Ok(tokens.issue(runner_id, run_id, job_id)?)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match config::ServerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {:?}", err);
            std::process::exit(1);
        }
    };

    if let Some(Command::IssueToken {
        runner_id,
        run_id,
        job_id,
    }) = cli.command
    {
        match issue_token(&config, &runner_id, &run_id, &job_id) {
            Ok(token) => println!("{}", token),
            Err(err) => {
                eprintln!("Error issuing token: {:?}", err);
                std::process::exit(1);
            }
        }
        return;
    }

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let meter_provider = match metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval,
        &config.instance_id(),
    ) {
        Ok(provider) => provider,
        Err(err) => {
            error!("Error setting up metrics: {:?}", err);
            None
        }
    };

    let root_span = info_span!(
        "artifact-server",
        env = config.env,
        "artifacts-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    match Service::new(config) {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("Error shutting down meter provider: {:?}", err);
        }
    }
    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
