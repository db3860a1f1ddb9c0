use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mq_client::{MqttConnector, MqttConnectorOptions};
use tokio::signal;
use tracing::{error, info, warn};
use vehicle::config::DEFAULT_CONFIG_PATH;
use vehicle::sink::DEFAULT_WORKDIR;
use vehicle::{ConfigWatcher, Lifecycle, LoggingMode, PropertiesFile, Sinks, Vehicle};

/// Onboard data provisioner
///
/// Keeps the vehicle connected to its message broker, stores content packages
/// in the work directory and restarts whenever the configuration file changes.
#[derive(Parser, Debug)]
#[command(name = "onboard-provisioner")]
#[command(about = "Onboard data provisioner - broker connection and content provisioning")]
#[command(version)]
pub struct Args {
    /// Configuration properties file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Directory receiving persisted content
    #[arg(short, long, default_value = DEFAULT_WORKDIR)]
    pub workdir: PathBuf,

    /// Prefix for the broker client id
    #[arg(long, default_value = "onboard-provisioner")]
    pub client_id: String,

    /// Quiet period in milliseconds before a configuration change applies
    #[arg(long, default_value = "500")]
    pub debounce_ms: u64,

    /// Logging mode (silent, development, debug, json). Overrides PROVISIONER_LOG_MODE
    #[arg(long)]
    pub log_mode: Option<LoggingMode>,
}

impl Args {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(anyhow::anyhow!("Debounce interval must be positive"));
        }
        if self.client_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Client id prefix must not be empty"));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    let logging = match args.log_mode {
        Some(mode) => vehicle::init_logging(mode),
        None => vehicle::init_logging_from_env(),
    };
    logging.context("Failed to initialize logging")?;

    run(args).await
}

async fn run(args: Args) -> Result<()> {
    info!(
        "Onboard provisioner starting (config {}, workdir {})",
        args.config.display(),
        args.workdir.display()
    );

    let source = PropertiesFile::new(&args.config);
    let connector = MqttConnector::new(
        MqttConnectorOptions::default().with_client_id_prefix(args.client_id.clone()),
    );
    let vehicle = Arc::new(Vehicle::new(
        Arc::new(source.clone()),
        Arc::new(connector),
        Sinks::filesystem(&args.workdir),
    ));

    let watcher = ConfigWatcher::spawn(source.path(), vehicle.clone(), args.debounce())
        .context("Failed to watch configuration file")?;

    // start() blocks until the broker is reachable; keep it off the signal path
    let starter = {
        let vehicle = Arc::clone(&vehicle);
        tokio::spawn(async move {
            if let Err(e) = vehicle.start().await {
                error!("Vehicle failed to start: {}", e);
                warn!("Waiting for a configuration change");
            }
        })
    };

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    watcher.shutdown();
    vehicle.stop().await;
    if let Err(e) = starter.await {
        warn!("Start task ended abnormally: {}", e);
    }

    info!("Onboard provisioner stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_args() {
        let args = Args::try_parse_from(["onboard-provisioner"]).unwrap();
        assert_eq!(args.config, PathBuf::from("conf/provisioning.properties"));
        assert_eq!(args.workdir, PathBuf::from("workdir"));
        assert_eq!(args.debounce(), Duration::from_millis(500));
        assert!(args.log_mode.is_none());
        assert!(args.validate().is_ok());
    }

    #[rstest]
    #[case("json", LoggingMode::Json)]
    #[case("silent", LoggingMode::Silent)]
    #[case("debug", LoggingMode::Debug)]
    fn test_log_mode_flag(#[case] value: &str, #[case] expected: LoggingMode) {
        let args = Args::try_parse_from(["onboard-provisioner", "--log-mode", value]).unwrap();
        assert_eq!(args.log_mode, Some(expected));
    }

    #[test]
    fn test_unknown_log_mode_rejected() {
        assert!(Args::try_parse_from(["onboard-provisioner", "--log-mode", "loud"]).is_err());
    }

    #[rstest]
    #[case(&["onboard-provisioner", "--debounce-ms", "0"])]
    #[case(&["onboard-provisioner", "--client-id", " "])]
    fn test_validate_rejects(#[case] argv: &[&str]) {
        let args = Args::try_parse_from(argv).unwrap();
        assert!(args.validate().is_err());
    }
}
