//! ObsLink - OBS websocket remote control from the command line

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use obslink::config::{self, Config};
use obslink::{lifecycle, BatchOptions, BatchRequest, Session};

/// ObsLink - Remote control for OBS
#[derive(Parser)]
#[command(name = "obslink")]
#[command(author = "ObsLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send requests to OBS and watch its events", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server URL (overrides configuration)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Server password (overrides configuration)
    #[arg(short, long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single request and print its response data
    Call {
        /// Request type, e.g. GetVersion
        request_type: String,

        /// Request data as a JSON object
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Send a batch of requests read from a JSON file
    Batch {
        /// File holding `[{"requestType": ..., "requestData": ...}, ...]`
        file: PathBuf,

        /// Ask the server to stop at the first failure
        #[arg(long)]
        halt_on_failure: bool,

        /// Server-side execution type (-1, 0, 1 or 2)
        #[arg(long)]
        execution_type: Option<i32>,
    },

    /// Print events as they arrive, redialing after abnormal closures
    Watch {
        /// Event types to print (lifecycle events are always printed)
        #[arg(short, long)]
        event: Vec<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchFileEntry {
    request_type: String,
    #[serde(default)]
    request_data: Option<Value>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    if let Some(url) = cli.url {
        config.connection.url = url;
    }
    if let Some(password) = cli.password {
        config.connection.password = Some(password);
    }

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Call { request_type, data } => {
            let data = data
                .map(|d| serde_json::from_str::<Value>(&d))
                .transpose()
                .context("--data is not valid JSON")?;
            run_call(&config, &request_type, data).await?;
        }
        Commands::Batch {
            file,
            halt_on_failure,
            execution_type,
        } => {
            let options = BatchOptions {
                halt_on_failure: Some(halt_on_failure),
                execution_type,
            };
            run_batch(&config, &file, options).await?;
        }
        Commands::Watch { event } => {
            run_watch(&config, event).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<Session> {
    let session = Session::new(config.session_config());
    session
        .connect(&config.connection.url, config.connection.password.as_deref())
        .await
        .with_context(|| format!("failed to connect to {}", config.connection.url))?;
    Ok(session)
}

/// Send one request
async fn run_call(config: &Config, request_type: &str, data: Option<Value>) -> anyhow::Result<()> {
    let session = connect(config).await?;
    let result = session.call(request_type, data).await;
    session.disconnect();

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response.unwrap_or(Value::Null))?);
    Ok(())
}

/// Send a batch read from `file`
async fn run_batch(config: &Config, file: &Path, options: BatchOptions) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let entries: Vec<BatchFileEntry> = serde_json::from_str(&contents)?;
    let requests = entries
        .into_iter()
        .map(|e| BatchRequest::new(e.request_type, e.request_data))
        .collect();

    let session = connect(config).await?;
    let result = session.call_batch(requests, options).await;
    session.disconnect();

    let responses: Vec<Value> = result?
        .into_iter()
        .map(|r| r.unwrap_or(Value::Null))
        .collect();
    println!("{}", serde_json::to_string_pretty(&responses)?);
    Ok(())
}

/// Print events until Ctrl+C
async fn run_watch(config: &Config, events: Vec<String>) -> anyhow::Result<()> {
    let session = connect(config).await?;

    let lifecycle_events = [
        lifecycle::CONNECTION_CLOSED,
        lifecycle::CONNECTION_ERROR,
        lifecycle::IDENTIFIED,
        lifecycle::PARSE_ERROR,
    ];
    for name in lifecycle_events.iter().map(|n| n.to_string()).chain(events) {
        let label = name.clone();
        session.on(name, move |data| {
            let data = data.map(Value::to_string).unwrap_or_default();
            println!("{} {}", label, data);
            Ok(())
        });
    }

    let (redial_tx, mut redial_rx) = mpsc::unbounded_channel();
    if config.reconnect.enabled {
        session.on(lifecycle::RECONNECT_REQUESTED, move |_| {
            let _ = redial_tx.send(());
            Ok(())
        });
    }

    println!("Watching {} (press Ctrl+C to stop)", config.connection.url);

    loop {
        tokio::select! {
            Some(()) = redial_rx.recv() => {
                tracing::info!("Redialing {}", config.connection.url);
                if let Err(e) = session
                    .connect(&config.connection.url, config.connection.password.as_deref())
                    .await
                {
                    tracing::warn!("Redial failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    session.disconnect();
    tracing::info!("Watch stopped");

    Ok(())
}
