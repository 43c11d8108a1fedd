use crate::config::Config;
use crate::custom_vision::CustomVisionClient;
use crate::overlay::OverlayRenderer;
use crate::prediction_service::PredictionService;
use crate::server::HttpServer;
use crate::storage::OutputStorage;

use std::{error::Error, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let prediction_service: Arc<dyn PredictionService> =
        match CustomVisionClient::new(&config.custom_vision) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::error!("Failed to initialize prediction service: {:?}", e);
                return Err(Box::new(e));
            }
        };

    let renderer = match OverlayRenderer::from_config(&config.overlay) {
        Ok(renderer) => renderer,
        Err(e) => {
            tracing::error!("Failed to initialize overlay renderer: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let storage = match OutputStorage::new(&config.storage).await {
        Ok(storage) => storage,
        Err(e) => {
            tracing::error!("Failed to prepare storage: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let retention_handle = config.storage.retention_secs.map(|secs| {
        tokio::spawn(
            storage
                .clone()
                .run_retention(Duration::from_secs(secs), shutdown_tx.subscribe()),
        )
    });

    let server = HttpServer::new(prediction_service, renderer, storage, &config).await?;
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;
    if let Some(handle) = retention_handle {
        handle.await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
