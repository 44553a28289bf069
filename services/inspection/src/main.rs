use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use inspection_service::{
    db, diagnose, Config, EventStore, InspectionRepository, PgEventStore, PgInspectionRepository,
    Pipeline, PipelineOptions, RunLoop,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "inspection-service", version, about = "Derive inspections from the PLC event log")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run passes on the configured poll interval until SIGINT/SIGTERM
    Run,
    /// Run a single pass and print its summary as JSON
    Once,
    /// Explain why a cycle has or has not become an inspection
    Diagnose {
        /// Cycle name (NombreCiclo)
        #[arg(long = "cycle")]
        cycle_name: String,
        /// Execution center id (ID_EC)
        #[arg(long = "ec")]
        execution_center_id: String,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        worker_id = %config.service.worker_id,
        "Starting Fuel Inspection Service"
    );

    let pool = db::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let command = cli.command.unwrap_or(Command::Run);

    if matches!(command, Command::Migrate) || config.database.run_migrations {
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
    }

    let events: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let inspections: Arc<dyn InspectionRepository> = Arc::new(PgInspectionRepository::new(pool));
    let pipeline = Arc::new(Pipeline::new(
        events,
        inspections,
        PipelineOptions::from_config(&config),
    ));

    match command {
        Command::Migrate => {}
        Command::Once => {
            let summary = pipeline.run_once(Utc::now()).await.context("Pass failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Diagnose {
            cycle_name,
            execution_center_id,
        } => {
            let report = diagnose(&pipeline, &cycle_name, &execution_center_id, Utc::now())
                .await
                .context("Diagnostics failed")?;
            print!("{report}");
        }
        Command::Run => {
            // Initialize metrics
            if config.service.metrics_port != 0 {
                init_metrics(config.service.metrics_port)?;
            }

            let handle = RunLoop::new(pipeline, config.processing.poll_interval()).spawn();

            info!("Inspection service started successfully");

            // Wait for shutdown signal
            shutdown_signal().await;

            info!("Shutting down inspection service");
            handle.stop().await;
            info!("Inspection service stopped");
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["inspection-service"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parses_diagnose() {
        let cli =
            Cli::try_parse_from(["inspection-service", "diagnose", "--cycle", "CNA2", "--ec", "E3742"])
                .unwrap();
        match cli.command {
            Some(Command::Diagnose {
                cycle_name,
                execution_center_id,
            }) => {
                assert_eq!(cycle_name, "CNA2");
                assert_eq!(execution_center_id, "E3742");
            }
            other => panic!("Expected diagnose command, got {other:?}"),
        }
    }
}
