mod config;
mod web;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use eas::{Clock, EasModel, NoHistory};
use eas_protocol::udp::{TelemetryListener, UdpCommandSender};
use eas_protocol::TelemetryBus;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DaemonConfig;
use crate::web::WebState;

/// Observatory environmental automation daemon.
#[derive(Debug, Parser)]
#[command(name = "eas-server", version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, default_value = "eas.yaml")]
    config: PathBuf,

    /// Wait for `POST /api/monitoring` instead of starting right away.
    #[arg(long)]
    disabled: bool,
}

fn task_ended(name: &str, result: Result<Result<()>, JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow!("{name} stopped"),
        Ok(Err(err)) => err.context(format!("{name} failed")),
        Err(err) => anyhow!("{name} panicked: {err}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let daemon = DaemonConfig::load(&cli.config)?;

    let bus = Arc::new(TelemetryBus::new());
    let sender = Arc::new(UdpCommandSender::new(daemon.transport.endpoints.clone()));
    let model = Arc::new(EasModel::new(
        daemon.eas,
        Clock::system(),
        Arc::clone(&bus),
        sender,
        Arc::new(NoHistory),
    )?);

    let listener = TelemetryListener::bind(&daemon.transport.telemetry_bind).await?;
    info!(addr = %listener.local_addr()?, "listening for telemetry");
    let telemetry = tokio::spawn({
        let bus = Arc::clone(&bus);
        async move { listener.run(&bus).await }
    });

    let http = tokio::net::TcpListener::bind(&daemon.transport.http_bind)
        .await
        .with_context(|| format!("binding {}", daemon.transport.http_bind))?;
    let web = tokio::spawn(web::serve(
        http,
        WebState {
            model: Arc::clone(&model),
            config_path: cli.config.clone(),
        },
    ));

    if !cli.disabled {
        model.start_monitoring().await?;
    }

    let outcome = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("interrupted, shutting down");
            Ok(())
        }
        message = model.wait_for_fault() => Err(anyhow!("automation fault: {message}")),
        result = telemetry => Err(task_ended("telemetry listener", result)),
        result = web => Err(task_ended("web server", result)),
    };
    model.stop_monitoring().await;
    if let Err(err) = &outcome {
        error!("{err:#}");
    }
    outcome
}
