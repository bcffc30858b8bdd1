use clap::{Parser, ValueEnum};
use nodecheck_runtime::{ApiClient, Credentials, NodeProber, ProbeSettings, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "nodecheck",
    about = "Probe every ready node with a short-lived pod and flag nodes that cannot start or stop it in time"
)]
struct Cli {
    /// Max time a probe may stay Pending before its node is flagged
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration, env = "NODECHECK_CREATE")]
    create: Duration,
    /// Max time a probe may stay Terminating before its node is flagged
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration, env = "NODECHECK_TERMINATE")]
    terminate: Duration,
    /// Target interval between reconcile passes
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, env = "NODECHECK_EVERY")]
    every: Duration,
    /// Namespace probe pods are created in
    #[arg(long, default_value = "default", env = "NODECHECK_NAMESPACE")]
    namespace: String,
    /// Image of the probe container
    #[arg(long, default_value = "ghcr.io/matti/bause:user", env = "NODECHECK_IMAGE")]
    image: String,
    /// Node condition raised on nodes that fail a probe
    #[arg(long, default_value = "PIDPressure", env = "NODECHECK_SIGNAL_CONDITION")]
    signal_condition: String,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "NODECHECK_LOG_FORMAT")]
    log_format: LogFormat,
}

impl Cli {
    fn settings(&self) -> ProbeSettings {
        ProbeSettings {
            create_threshold: self.create,
            terminate_threshold: self.terminate,
            tick_interval: self.every,
            namespace: self.namespace.clone(),
            image: self.image.clone(),
            signal_condition: self.signal_condition.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let credentials = Credentials::discover()?;
    let api_client = ApiClient::from_credentials(&credentials)?;
    info!("Using API server {}", api_client.base_url());

    let prober = NodeProber::new(Arc::new(api_client), Arc::new(SystemClock), cli.settings());

    let token = CancellationToken::new();
    let prober_token = token.clone();
    let prober_handle = tokio::spawn(async move {
        prober.run(prober_token).await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    // A tick in flight is allowed to finish, within reason
    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, prober_handle)
        .await
        .is_err()
    {
        error!("Prober did not stop within {:?}", shutdown_timeout);
    }

    info!("Shutdown complete");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_probe_settings() {
        let cli = Cli::try_parse_from(["nodecheck"]).unwrap();
        let settings = cli.settings();

        assert_eq!(settings.create_threshold, Duration::from_secs(10));
        assert_eq!(settings.terminate_threshold, Duration::from_secs(15));
        assert_eq!(settings.tick_interval, Duration::from_secs(5));
        assert_eq!(settings.namespace, "default");
        assert_eq!(settings.signal_condition, "PIDPressure");
    }

    #[test]
    fn test_durations_accept_humantime_syntax() {
        let cli = Cli::try_parse_from([
            "nodecheck",
            "--create",
            "1m30s",
            "--terminate",
            "500ms",
            "--every",
            "2s",
        ])
        .unwrap();

        assert_eq!(cli.create, Duration::from_secs(90));
        assert_eq!(cli.terminate, Duration::from_millis(500));
        assert_eq!(cli.every, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(Cli::try_parse_from(["nodecheck", "--every", "soon"]).is_err());
    }
}
