use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeDir,
    trace::TraceLayer,
};

use crate::config::Config;
use crate::handlers::{health_check, init_upload, session_status, upload_chunk};
use crate::middleware::{add_security_headers, no_store};
use crate::state::AppState;
use crate::utils::shutdown_signal;

// static ui, every path the upload api does not claim
pub fn build_static_router(static_dir: &Path) -> Router {
    tracing::debug!("Building static router for directory: {:?}", static_dir);
    Router::new()
        .fallback_service(
            ServeDir::new(static_dir)
                .append_index_html_on_directories(true)
                .precompressed_gzip()
                .precompressed_br(),
        )
        .layer(axum::middleware::from_fn(add_security_headers))
        .layer(CompressionLayer::new().gzip(true).br(true).zstd(true))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    cors.allow_origin(AllowOrigin::list(origins))
}

/// upload api plus static fallback
pub fn build_router(state: Arc<AppState>, config: &Config) -> Router {
    tracing::debug!(
        "Building router with max chunk size: {} bytes",
        config.max_chunk_size
    );

    let upload_api = Router::new()
        .route("/upload/init", post(init_upload))
        .route("/upload", post(upload_chunk))
        .route("/upload/session/:id", get(session_status))
        .route("/health", get(health_check))
        .layer(axum::middleware::from_fn(no_store))
        .layer(RequestBodyLimitLayer::new(config.max_chunk_size))
        .with_state(state)
        .fallback_service(build_static_router(&config.static_dir));

    let router = if config.rate_limit_burst > 0 {
        // keyed by peer ip, needs connect info on the make service
        match GovernorConfigBuilder::default()
            .per_millisecond(config.rate_limit_replenish_ms.max(1))
            .burst_size(config.rate_limit_burst)
            .finish()
        {
            Some(governor_conf) => upload_api.layer(GovernorLayer {
                config: Arc::new(governor_conf),
            }),
            None => {
                tracing::warn!("Invalid rate limit settings, rate limiting disabled");
                upload_api
            }
        }
    } else {
        upload_api
    };

    router
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// serve `app` on `listener` until `shutdown` resolves
pub async fn serve<F>(app: Router, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .tcp_nodelay(true)
    .await
}

/// bind `addr` and run until ctrl-c / SIGTERM
pub async fn start_server(app: Router, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!("Listener bound to {}", addr);

    tracing::info!("Server running and ready to accept connections");
    serve(app, listener, shutdown_signal()).await
}

/// print startup banner with server info
pub fn print_startup_banner(config: &Config) {
    tracing::info!("chunkferry starting...");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("📡 UPLOAD SERVER: http://{}:{}", config.host, config.port);
    tracing::info!(
        "📁 Storing uploads in: {:?}",
        config
            .files_dir
            .canonicalize()
            .unwrap_or(config.files_dir.clone())
    );
    tracing::info!("🗂️  Serving ui from: {:?}", config.static_dir);
    tracing::info!(
        "⌛ Sessions expire after {}s idle",
        config.session_ttl.as_secs()
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
