use chunkferry::client::UploadOptions;
use chunkferry::config::{ClientConfig, Config};
use std::env;
use std::time::Duration;

// helper to clear env vars
fn clear_env() {
    for key in [
        "FILES_DIR",
        "STATIC_DIR",
        "HOST",
        "PORT",
        "MAX_CHUNK_SIZE",
        "WORKER_THREADS",
        "CORS_ORIGINS",
        "RATE_LIMIT_BURST",
        "RATE_LIMIT_REPLENISH_MS",
        "SESSION_TTL_SECS",
        "SESSION_SWEEP_SECS",
        "UPLOAD_URL",
        "CHUNK_SIZE",
        "CONCURRENCY",
        "CHUNK_TIMEOUT_SECS",
        "RESUME_ATTEMPTS",
    ] {
        env::remove_var(key);
    }
}

#[test]
fn test_config_behavior() {
    // Run these sequentially to avoid race conditions with environment variables

    // 1. Server defaults
    clear_env();

    let config = Config::from_env();

    assert_eq!(config.files_dir.to_str().unwrap(), "./files");
    assert_eq!(config.static_dir.to_str().unwrap(), "./public");
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 3000);
    assert_eq!(config.max_chunk_size, 64 * 1024 * 1024);
    assert_eq!(config.worker_threads, 8);
    assert_eq!(config.rate_limit_burst, 128);
    assert_eq!(config.session_ttl, Duration::from_secs(3600));
    assert_eq!(config.cors_origins.len(), 2);

    // 2. Server from env, garbage falls back to the default
    clear_env();

    env::set_var("FILES_DIR", "/tmp/test_files");
    env::set_var("PORT", "9090");
    env::set_var("WORKER_THREADS", "four");
    env::set_var("CORS_ORIGINS", " * , ");
    env::set_var("SESSION_TTL_SECS", "5");

    let config = Config::from_env();

    assert_eq!(config.files_dir.to_str().unwrap(), "/tmp/test_files");
    assert_eq!(config.port, 9090);
    assert_eq!(config.worker_threads, 8);
    assert_eq!(config.cors_origins, vec!["*".to_string()]);
    assert_eq!(config.session_ttl, Duration::from_secs(5));

    // 3. Client defaults and overrides
    clear_env();

    let client = ClientConfig::from_env();
    assert_eq!(client.server_url, "http://127.0.0.1:3000");
    assert_eq!(client.chunk_size, 1024 * 1024);
    assert_eq!(client.concurrency, 2);
    assert_eq!(client.resume_attempts, 3);

    env::set_var("CHUNK_SIZE", "4096");
    env::set_var("CONCURRENCY", "6");
    env::set_var("CHUNK_TIMEOUT_SECS", "3");

    let client = ClientConfig::from_env();
    let options = UploadOptions::from(&client);
    assert_eq!(options.chunk_size, 4096);
    assert_eq!(options.concurrency, 6);
    assert_eq!(options.chunk_timeout, Some(Duration::from_secs(3)));

    // Cleanup
    clear_env();
}
