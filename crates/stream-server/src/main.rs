//! IRRV Streaming Server - Main Entry Point

use anyhow::Context;
use dump_writer::RuntimeDumpWriter;
use std::sync::Arc;
use stream_server::{
    init_logging, install_metrics, stream_channel, ClientTracker, CredentialSource,
    EncoderControl, EncoderSettings, ServerConfig, ServerOptions, ServerRole, StaticCredentials,
    StreamServer, Streamer, SyntheticPipeline,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    init_logging(&config.log_level, config.log_format)?;

    info!("=== IRRV Streaming Server v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Instance {}, accelerator {}",
        config.instance_id,
        config.vaapi_device.display()
    );

    if let Some(addr) = config.metrics_listen {
        install_metrics(addr)?;
    }

    let tracker = ClientTracker::new();
    let (handle, queues) = stream_channel(config.frame_queue_depth, tracker.clone());
    let dump = Arc::new(RuntimeDumpWriter::new(&config.dump_dir, config.codec));
    let pipeline = Arc::new(SyntheticPipeline::new(
        EncoderSettings::from_config(&config),
        dump,
        handle,
    ));

    let encoder: Arc<dyn EncoderControl> = pipeline.clone();
    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredentials::new(config.credentials));
    let options = ServerOptions::from_config(&config);

    let primary = StreamServer::bind(
        ServerRole::Primary,
        &config.primary_endpoint(),
        options.clone(),
        Arc::clone(&encoder),
        Arc::clone(&credentials),
        tracker.clone(),
    )
    .await?;

    let auxiliary = if config.auxiliary_server {
        Some(
            StreamServer::bind(
                ServerRole::Auxiliary,
                &config.auxiliary_endpoint(),
                options,
                encoder,
                credentials,
                tracker,
            )
            .await?,
        )
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let streamer = Streamer::new(primary, auxiliary, queues, config.poll_interval);
    let streamer = tokio::spawn(streamer.run(shutdown_rx.clone()));
    let producer = tokio::spawn(pipeline.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down...");
    shutdown_tx.send_replace(true);

    streamer.await?;
    if let Err(e) = producer.await? {
        error!("Pipeline failed: {}", e);
    }

    Ok(())
}
