mod config;
mod errors;
mod events;
mod media;
mod registry;
mod routes;
mod telemetry;
mod ws;

use axum::Router;
use config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub media: Arc<media::MediaService>,
    pub registry: registry::Registry,
    pub telemetry: Arc<telemetry::Telemetry>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camlink_server=debug,tower_http=debug".parse().unwrap()),
        )
        .init();

    let config = Arc::new(AppConfig::load());
    let telemetry = Arc::new(telemetry::Telemetry::default());

    let (media_service, closed_rx) = media::MediaService::new(&config.media).await;
    media_service.init_router().await;
    let media_service = Arc::new(media_service);

    let registry = registry::Registry::new(
        Duration::from_secs(config.registry.removal_grace_seconds),
        telemetry.clone(),
    );

    tokio::spawn(media::run_transport_watchdog(
        media_service.clone(),
        registry.clone(),
        closed_rx,
    ));

    let state = AppState {
        media: media_service,
        registry,
        telemetry,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::admin_routes::router())
        .route("/ws", axum::routing::get(ws::ws_upgrade))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(
        "Camlink server started: admin http://{addr} | signaling ws://{addr}/ws | egress {}:{}-{}",
        config.media.egress_listen_ip,
        config.media.egress_min_port,
        config.media.egress_max_port
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
