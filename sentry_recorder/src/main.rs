// THEORY:
// `sentry_recorder` is the deployable process around the `garden_sentry` engine. It
// only does the things a library should not: read configuration from the command
// line and environment, install logging, configure FFmpeg, plug the OpenCV and HTTP
// adapters into the supervisor, and turn SIGINT/SIGTERM into a cooperative
// shutdown. Everything that can fail at runtime is handled inside the supervisor;
// the only non-zero exits happen before it starts.

mod capture;
mod cli;
mod encoder;

use anyhow::{Context, Result};
use clap::Parser;
use garden_sentry::{HttpClassifier, SentryConfig, Supervisor};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::capture::OpenCvConnector;
use crate::cli::Cli;
use crate::encoder::OpenCvEncoder;

fn main() -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "garden_sentry=info,sentry_recorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config().context("invalid configuration")?;

    // FFmpeg reads its capture options once, before the first capture is created.
    // SAFETY: no other threads exist yet.
    unsafe {
        std::env::set_var(
            "OPENCV_FFMPEG_CAPTURE_OPTIONS",
            format!("rtsp_transport;{}", config.transport),
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(run(Arc::new(config)))
}

async fn run(config: Arc<SentryConfig>) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        output_dir = %config.output_dir.display(),
        codecs = ?config.codecs.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
        "starting sentry recorder"
    );

    let classifier = HttpClassifier::new(config.classifier_url.clone(), config.classifier_timeout)
        .context("failed to set up the classifier client")?;
    tracing::info!(endpoint = classifier.endpoint(), "classifier ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive until the supervisor has observed the flag.
        std::future::pending::<()>().await;
    });

    let mut supervisor = Supervisor::new(config, OpenCvConnector::new(), classifier, OpenCvEncoder);
    let report = supervisor.run(shutdown_rx).await;

    tracing::info!(
        sessions = report.sessions,
        frames = report.frames,
        episodes = report.episodes_finalized,
        "sentry recorder stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
