//! mqtt-loadpub - Main Entry Point

use clap::{Parser, Subcommand};
use mqtt_loadpub::config::{ConfigOverrides, PublisherConfig};
use mqtt_loadpub::observability::{init_default_logging, DeliveryStats};
use mqtt_loadpub::observer::{CompositeObserver, DeliveryObserver, LoggingObserver};
use mqtt_loadpub::publisher::{DeliveryPolicy, PublishLoop};
use mqtt_loadpub::transport::mqtt::MqttClient;
use mqtt_loadpub::PublisherError;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Instrument};

/// Publish a fixed number of messages to an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-loadpub")]
#[command(about = "Fixed-rate MQTT publisher with last will and delivery tracking")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Broker URI (tcp://, mqtt://, ssl://, mqtts://)
    #[arg(long, env = "MQTT_BROKER_URL", global = true)]
    broker_url: Option<String>,

    #[arg(long, env = "MQTT_CLIENT_ID", global = true)]
    client_id: Option<String>,

    #[arg(long, value_name = "DIR", global = true)]
    persist_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    topic: Option<String>,

    /// Number of messages to publish
    #[arg(long, global = true)]
    count: Option<u64>,

    /// Pause between messages in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// QoS level for published messages (0, 1 or 2)
    #[arg(long, global = true)]
    qos: Option<u8>,

    /// Delivery policy: sync waits on every token, async does not
    #[arg(long, global = true)]
    policy: Option<DeliveryPolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, publish and disconnect
    Run,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            broker_url: self.broker_url.clone(),
            client_id: self.client_id.clone(),
            persist_dir: self.persist_dir.clone(),
            topic: self.topic.clone(),
            count: self.count,
            interval_ms: self.interval_ms,
            qos: self.qos,
            policy: self.policy,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(cli.verbose > 0);

    info!("Starting mqtt-loadpub v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref(), &cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => {
            run_publisher(config)
                .instrument(mqtt_loadpub::lifecycle_span!(command = "run"))
                .await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            PublisherConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["mqtt-loadpub.toml", "config/mqtt-loadpub.toml"];

            match default_paths.iter().map(Path::new).find(|path| path.exists()) {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    PublisherConfig::load_from_file(path)?
                }
                None => {
                    info!("No configuration file found, using defaults");
                    PublisherConfig::default()
                }
            }
        }
    };

    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run_publisher(config: PublisherConfig) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.connection_config()?;
    let settings = config.publish_settings()?;

    let stats = Arc::new(DeliveryStats::new());
    let observers: Vec<Arc<dyn DeliveryObserver>> = vec![Arc::new(LoggingObserver), stats.clone()];
    let session_observer: Arc<dyn DeliveryObserver> = Arc::new(CompositeObserver::new(observers));

    info!(
        broker = %connection.broker_url(),
        client_id = %connection.client_id(),
        topic = %settings.topic,
        count = settings.count,
        "Publisher configured"
    );

    let client = MqttClient::new(connection, session_observer);
    let mut publish_loop = PublishLoop::new(client, settings).with_listener(stats.clone());

    let outcome: Result<_, PublisherError> = tokio::select! {
        result = publish_loop.run() => result,
        _ = signal::ctrl_c() => {
            // Dropping the client without DISCONNECT lets the broker publish the will.
            warn!("Interrupted, abandoning the run without a clean disconnect");
            return Err("interrupted".into());
        }
    };

    let snapshot = stats.snapshot();
    info!(
        delivered = snapshot.delivered,
        failed = snapshot.failed,
        connections_lost = snapshot.connections_lost,
        elapsed_ms = snapshot.elapsed_ms,
        delivered_per_sec = snapshot.delivered_per_sec,
        "Delivery statistics"
    );

    let report = outcome?;
    info!(
        submitted = report.submitted,
        confirmed = report.confirmed,
        failed = report.failed,
        abandoned = report.abandoned,
        state = %report.final_state,
        "Run complete"
    );
    Ok(())
}

fn handle_config_command(
    config: &PublisherConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
