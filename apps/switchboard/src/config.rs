use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub turn_ttl_seconds: u64,
    /// Minimum gap between store writes while a turn streams.
    pub flush_interval_ms: u64,
    /// Minimum gap between observer fan-outs while a turn streams.
    pub publish_interval_ms: u64,
    /// Delay before retrying a failed store flush.
    pub flush_retry_backoff_ms: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SWITCHBOARD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            turn_ttl_seconds: env::var("TURN_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(604_800), // default 7 days
            flush_interval_ms: env::var("FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(200),
            publish_interval_ms: env::var("PUBLISH_INTERVAL_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(50),
            flush_retry_backoff_ms: env::var("FLUSH_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(1_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            turn_ttl_seconds: 604_800,
            flush_interval_ms: 200,
            publish_interval_ms: 50,
            flush_retry_backoff_ms: 1_000,
        }
    }
}
