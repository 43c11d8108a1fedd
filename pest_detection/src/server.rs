use crate::{
    config::Config, overlay::OverlayRenderer, prediction_service::PredictionService,
    routes::api_routes, storage::OutputStorage, telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct SharedState {
    pub prediction_service: Arc<dyn PredictionService>,
    pub renderer: OverlayRenderer,
    pub storage: Arc<OutputStorage>,
    pub metrics: Arc<Metrics>,
}

/// Routes of the service: the upload page, the API and the annotated images.
pub fn build_router(state: SharedState, static_dir: &Path, max_upload_bytes: usize) -> Router {
    let output_dir = ServeDir::new(state.storage.output_dir());

    Router::new()
        .merge(api_routes())
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/output", output_dir)
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(
        prediction_service: Arc<dyn PredictionService>,
        renderer: OverlayRenderer,
        storage: OutputStorage,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState {
            prediction_service,
            renderer,
            storage: Arc::new(storage),
            metrics,
        };

        let router = build_router(
            app_state,
            &config.storage.static_dir,
            config.server.max_upload_bytes,
        )
        .layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                tracing::info!("Server stopped");
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
