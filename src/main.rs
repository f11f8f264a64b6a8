use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use foreman::config::AppConfig;
use foreman::contract::{Environment, PipelineRequest, RunMode};
use foreman::foreman::Foreman;
use foreman::registry::HandlerTable;
use foreman::server::{create_router, AppState};
use foreman::shutdown::{graceful_shutdown, wait_for_shutdown};

#[derive(Parser)]
#[command(name = "foreman", about = "Multi-agent task pipeline orchestrator")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API and, if enabled, the worker host (default)
    Serve,
    /// Run the pipeline once and print the result as JSON
    Run {
        /// Repository the run is about, e.g. `owner/repo`
        #[arg(long)]
        repo: String,
        /// What the workers should do
        #[arg(long)]
        task: String,
        #[arg(long = "environment", alias = "env", default_value = "dev")]
        env: Environment,
        #[arg(long, default_value = "preview")]
        mode: RunMode,
        #[arg(long)]
        max_issues: Option<u32>,
        /// Overall run deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Report whether a run in the given environment and mode would be admitted
    Check {
        #[arg(long = "environment", alias = "env", default_value = "dev")]
        env: Environment,
        #[arg(long, default_value = "preview")]
        mode: RunMode,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Run {
            repo,
            task,
            env,
            mode,
            max_issues,
            deadline,
        } => {
            let mut request = PipelineRequest::new(repo, task, env, mode)?;
            if let Some(max_issues) = max_issues {
                request = request.with_max_issues(max_issues)?;
            }
            if let Some(secs) = deadline {
                request = request.with_deadline(Duration::from_secs(secs));
            }

            let foreman = Foreman::from_config(&config, HandlerTable::new())?;
            match foreman.submit(request).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
                Err(failure) => {
                    println!("{}", serde_json::to_string_pretty(&failure)?);
                    anyhow::bail!("run refused: {failure}")
                }
            }
        }
        Command::Check { env, mode } => {
            let foreman = Foreman::from_config(&config, HandlerTable::new())?;
            match foreman.probe(env, mode) {
                Ok(()) => {
                    println!("ready: {env}/{mode}");
                    Ok(())
                }
                Err(failure) => {
                    for violation in &failure.violations {
                        println!("{:?}: {}", violation.check, violation.message);
                    }
                    anyhow::bail!("not ready for {env}/{mode}")
                }
            }
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        worker_host = config.host.enabled,
        "Starting Foreman server"
    );

    let address = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, HandlerTable::new())?);
    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = wait_for_shutdown() => {}
    }

    let _ = stop_tx.send(true);
    // Open connections hold the server open; stop waiting once the grace period is spent.
    if graceful_shutdown(&state).await > 0 {
        server.abort();
        return Ok(());
    }
    server.await??;

    Ok(())
}
