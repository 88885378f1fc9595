use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chunkferry::client::{FileSource, HttpTransport, Progress, UploadError, UploadOptions, Uploader};
use chunkferry::config::ClientConfig;
use chunkferry::utils::init_tracing;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing("info");

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: chunkferry-upload <file>");
        std::process::exit(2);
    };

    let config = ClientConfig::from_env();

    let source = match FileSource::open(&path).await {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("Can't open {}: {}", path, e);
            std::process::exit(1);
        }
    };

    let transport = match HttpTransport::new(config.server_url.clone()) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            tracing::error!("Can't build http client: {}", e);
            std::process::exit(1);
        }
    };

    // log whole percents only
    let last_percent = AtomicU64::new(u64::MAX);
    let mut uploader = Uploader::new(transport, UploadOptions::from(&config)).with_listener(
        move |progress: Progress| {
            let percent = progress.percent() as u64;
            if last_percent.swap(percent, Ordering::Relaxed) != percent {
                tracing::info!("{}% ({}/{} bytes)", percent, progress.loaded, progress.total);
            }
        },
    );

    let abort = uploader.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, aborting upload");
            abort.abort();
        }
    });

    let started = Instant::now();
    let mut result = uploader.start(source).await;
    let mut attempts = 0;

    // the uploader never retries on its own, resuming is our call
    while let Err(e) = &result {
        if !e.is_resumable() || attempts >= config.resume_attempts {
            break;
        }
        attempts += 1;
        tracing::warn!("{}, resuming (attempt {}/{})", e, attempts, config.resume_attempts);
        result = uploader.resume().await;
    }

    match result {
        Ok(report) => {
            tracing::info!(
                "Uploaded {} ({} bytes, {} chunks) in {:.2}s",
                path,
                report.total_size,
                report.chunk_count,
                started.elapsed().as_secs_f64()
            );
        }
        Err(UploadError::Aborted) => {
            tracing::warn!("Upload of {} aborted", path);
            std::process::exit(130);
        }
        Err(e @ UploadError::SessionLost { .. }) => {
            tracing::error!("Upload of {} failed: {}, run the upload again", path, e);
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Upload of {} failed: {}", path, e);
            std::process::exit(1);
        }
    }
}
