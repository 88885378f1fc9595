use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// directory assembled uploads are written to
    pub files_dir: PathBuf,
    /// directory the client ui is served from
    pub static_dir: PathBuf,
    /// listen address
    pub host: String,
    /// listen port
    pub port: u16,
    /// largest single chunk body accepted, in bytes
    pub max_chunk_size: usize,
    /// number of tokio worker threads
    pub worker_threads: usize,
    /// cors allowed origins (comma-separated, "*" for any)
    pub cors_origins: Vec<String>,
    /// rate limit burst per client ip, 0 disables rate limiting
    pub rate_limit_burst: u32,
    /// milliseconds to replenish one request of the burst
    pub rate_limit_replenish_ms: u64,
    /// idle time after which an unfinished upload session is dropped
    pub session_ttl: Duration,
    /// how often expired sessions are swept
    pub session_sweep_interval: Duration,
}

impl Config {
    /// load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        // parse cors origins
        let cors_origins = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            files_dir: std::env::var("FILES_DIR")
                .unwrap_or_else(|_| "./files".to_string())
                .into(),
            static_dir: std::env::var("STATIC_DIR")
                .unwrap_or_else(|_| "./public".to_string())
                .into(),
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("PORT", 3000),
            max_chunk_size: env_or("MAX_CHUNK_SIZE", 64 * 1024 * 1024), // 64MB default
            worker_threads: env_or("WORKER_THREADS", 8),
            cors_origins,
            rate_limit_burst: env_or("RATE_LIMIT_BURST", 128),
            rate_limit_replenish_ms: env_or("RATE_LIMIT_REPLENISH_MS", 10),
            session_ttl: Duration::from_secs(env_or("SESSION_TTL_SECS", 3600)),
            session_sweep_interval: Duration::from_secs(env_or("SESSION_SWEEP_SECS", 60)),
        }
    }
}

/// uploader configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// base url of the upload server
    pub server_url: String,
    /// bytes per chunk
    pub chunk_size: u64,
    /// max parallel chunk transfers
    pub concurrency: usize,
    /// per chunk transfer timeout
    pub chunk_timeout: Duration,
    /// how many times the cli resumes after a chunk failure
    pub resume_attempts: u32,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self {
            server_url: std::env::var("UPLOAD_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            chunk_size: env_or("CHUNK_SIZE", 1024 * 1024),
            concurrency: env_or("CONCURRENCY", 2),
            chunk_timeout: Duration::from_secs(env_or("CHUNK_TIMEOUT_SECS", 60)),
            resume_attempts: env_or("RESUME_ATTEMPTS", 3),
        }
    }
}

// read and parse an env var, falling back on absence or garbage
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
