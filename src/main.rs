use std::net::SocketAddr;
use std::sync::Arc;

use chunkferry::config::Config;
use chunkferry::server::{build_router, print_startup_banner, start_server};
use chunkferry::state::AppState;
use chunkferry::utils::init_tracing;

// use mimalloc as the global allocator
// chunk buffers churn through the allocator constantly
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    // load .env file if it exists (fails silently if not found)
    let _ = dotenvy::dotenv();

    // load configuration from environment variables
    let config = Config::from_env();

    // build tokio runtime with configured worker threads
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    runtime.block_on(async {
        init_tracing("info");

        // create the storage directory if it doesn't exist
        if !config.files_dir.exists() {
            std::fs::create_dir_all(&config.files_dir).expect("Failed to create files directory");
            tracing::info!("Created files directory at: {:?}", config.files_dir);
        }

        let state = Arc::new(AppState::new(&config));

        // abandoned uploads would otherwise live forever
        let sweeper = state
            .registry
            .spawn_expiry_task(config.session_sweep_interval);

        let app = build_router(state, &config);

        let addr = SocketAddr::from((
            config
                .host
                .parse::<std::net::IpAddr>()
                .expect("Invalid HOST"),
            config.port,
        ));

        print_startup_banner(&config);

        if let Err(e) = start_server(app, addr).await {
            tracing::error!("Server error: {}", e);
        }

        sweeper.abort();
    });
}
