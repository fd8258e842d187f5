// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ComDeX Action Handler CLI
//!
//! Command-line tool driving a broker-emulated context store.
//!
//! # Usage
//!
//! ```bash
//! # Create an entity from a file
//! comdex -c POST/entities -f entity.json -b localhost -p 1026
//!
//! # Query with a filter and a geoquery
//! comdex -c "GET/entities/?type=Sensor&q=temp>10&georel=near;maxDistance==50&geometry=Point&coordinates=[2,2]"
//!
//! # Subscribe until expiry or Ctrl+C
//! comdex -c POST/Subscriptions -f subscription.json
//!
//! # Per-entity advertisements
//! comdex -A 1 -c POST/entities -f entity.json
//!
//! # Generate example configuration
//! comdex gen-config --output comdex.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use comdex::{
    BatchOutcome, Command, ContextNode, CredentialStore, Granularity, LocationAwareness,
    MqttConnector, NodeConfig, Notification, Outcome, SubscriptionHandle,
};
use comdex::config::CredentialsConfig;
use comdex::entity::decode_payload;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// ComDeX context store action handler
#[derive(Parser, Debug)]
#[command(name = "comdex")]
#[command(about = "Context entity store over MQTT retained messages")]
#[command(version)]
struct Args {
    /// Command, e.g. POST/entities or "GET/entities/?type=Sensor"
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Input JSON file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Broker address
    #[arg(short = 'b', long)]
    broker_address: Option<String>,

    /// Broker port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// MQTT QoS for attribute writes (0, 1 or 2)
    #[arg(short = 'q', long)]
    qos: Option<u8>,

    /// Context link used when documents carry none
    #[arg(short = 'H', long)]
    hlink: Option<String>,

    /// Advertise per entity id ("1") instead of per type
    #[arg(short = 'A', long)]
    single_id_advertisement: Option<String>,

    /// Broker username
    #[arg(short = 'N', long)]
    username: Option<String>,

    /// Broker password
    #[arg(short = 'S', long)]
    password: Option<String>,

    /// Routing area (overrides the location awareness file)
    #[arg(long)]
    area: Option<String>,

    /// Location tag carried by advertisements
    #[arg(long)]
    location: Option<String>,

    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Location awareness file
    #[arg(long, default_value = "broker_location_awareness.txt")]
    location_file: PathBuf,

    /// Credentials for discovered remote brokers
    #[arg(long, default_value = "passwd_mapping.txt")]
    credentials_file: PathBuf,

    /// Query the local broker only, ignoring advertisements
    #[arg(long)]
    no_forwarding: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "comdex.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match args.subcommand {
        Some(Commands::GenConfig { ref output }) => cmd_gen_config(output),
        None => run(&args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn build_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    if let Some(host) = &args.broker_address {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(qos) = args.qos {
        config.qos = qos;
    }
    if let Some(flag) = &args.single_id_advertisement {
        config.advertisement.granularity = if flag == "1" {
            Granularity::PerEntity
        } else {
            Granularity::Coarse
        };
    }
    match (&args.username, &args.password) {
        (Some(username), Some(password)) => {
            config.credentials = Some(CredentialsConfig {
                username: username.clone(),
                password: password.clone(),
            });
        }
        (None, None) => {}
        _ => anyhow::bail!("--username and --password must be given together"),
    }
    if args.no_forwarding {
        config.forwarding = false;
    }

    config.apply_location_awareness(&LocationAwareness::load(&args.location_file));
    if let Some(area) = &args.area {
        config.area = area.clone();
    }
    if let Some(location) = &args.location {
        config.location = location.clone();
    }

    config.validate()?;
    Ok(config)
}

fn read_input(path: Option<&Path>, command: &Command) -> anyhow::Result<Option<Value>> {
    if !command.needs_input() {
        return Ok(None);
    }
    let path = path.with_context(|| format!("{command} requires an input file (-f)"))?;
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value = decode_payload(&path.display().to_string(), content.as_bytes())
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(Some(value))
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let text = args.command.as_deref().context("no command given (-c)")?;
    let command = Command::parse(text)?;
    let config = build_config(args)?;
    let input = read_input(args.file.as_deref(), &command)?;

    tracing::info!(
        "Area {} on broker {}:{}",
        config.area,
        config.broker.host,
        config.broker.port
    );
    let credentials = CredentialStore::load(&args.credentials_file);
    let node = ContextNode::new(MqttConnector::new(), config, credentials);

    let outcome = node
        .execute(&command, input.as_ref(), args.hlink.as_deref())
        .await?;
    match outcome {
        Outcome::Created(id) => println!("Entity {id} created"),
        Outcome::Updated(what) => println!("Updated {what}"),
        Outcome::Deleted(what) => println!("Deleted {what}"),
        Outcome::Entities(entities) => {
            for entity in &entities {
                println!("{}", serde_json::to_string_pretty(&entity.to_json())?);
            }
            println!("{} entities", entities.len());
        }
        Outcome::Batch(outcome) => print_batch(&outcome)?,
        Outcome::Subscribed(handle) => follow(handle).await?,
    }
    Ok(())
}

fn print_batch(outcome: &BatchOutcome) -> anyhow::Result<()> {
    println!("Succeeded: {}", outcome.succeeded.len());
    for (id, reason) in &outcome.failed {
        println!("  {id}: {reason}");
    }
    if !outcome.is_complete() {
        anyhow::bail!("{} of the batch entries failed", outcome.failed.len());
    }
    Ok(())
}

async fn follow(mut handle: SubscriptionHandle) -> anyhow::Result<()> {
    println!("Subscribed; press Ctrl+C to stop...");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                println!("\nShutting down...");
                handle.cancel().await;
                return Ok(());
            }
            notification = handle.recv() => match notification {
                Some(Notification::Entity(entity)) => {
                    println!("{}", serde_json::to_string_pretty(&entity.to_json())?);
                }
                Some(Notification::Retracted { topic }) => println!("Message on {topic} was deleted"),
                Some(Notification::SourceAdded(key)) => println!("Following {key}"),
                Some(Notification::SourceRemoved(key)) => println!("Stopped following {key}"),
                Some(Notification::SourceFailed { key, reason }) => {
                    eprintln!("Cannot follow {key}: {reason}");
                }
                None => {
                    println!("Subscription expired");
                    return Ok(());
                }
            },
        }
    }
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let content = format!(
        r#"# ComDeX Node Configuration
# Generated by comdex gen-config

{}
"#,
        NodeConfig::example_toml()
    );
    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}
