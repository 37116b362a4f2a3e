use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub duckdb_memory_limit: String,
    pub cors_origins: Vec<String>,
    /// Inactivity after which a session is closed (its `ended_at` is set).
    pub session_timeout_minutes: u32,
    pub session_sweep_interval_secs: u64,
    /// Upper bound on an analytics computation before a cached snapshot is served.
    pub analytics_timeout_ms: u64,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_ms: u64,
    pub path_cache_max_entries: usize,
    /// Distinct (funnel, range) analytics snapshots kept for stale fallback.
    pub snapshot_max_entries: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let storage_retry_attempts = env_or("CONVERTLY_STORAGE_RETRY_ATTEMPTS", 3u32);
        if storage_retry_attempts == 0 {
            return Err("CONVERTLY_STORAGE_RETRY_ATTEMPTS must be at least 1".to_string());
        }

        Ok(Self {
            port: std::env::var("CONVERTLY_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("CONVERTLY_DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string()),
            duckdb_memory_limit: std::env::var("CONVERTLY_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "1GB".to_string()),
            cors_origins: std::env::var("CONVERTLY_CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            session_timeout_minutes: env_or("CONVERTLY_SESSION_TIMEOUT_MINUTES", 30),
            session_sweep_interval_secs: env_or("CONVERTLY_SESSION_SWEEP_INTERVAL_SECS", 60),
            analytics_timeout_ms: env_or("CONVERTLY_ANALYTICS_TIMEOUT_MS", 5000),
            storage_retry_attempts,
            storage_retry_base_ms: env_or("CONVERTLY_STORAGE_RETRY_BASE_MS", 50),
            path_cache_max_entries: env_or("CONVERTLY_PATH_CACHE_MAX_ENTRIES", 10_000),
            snapshot_max_entries: env_or("CONVERTLY_SNAPSHOT_MAX_ENTRIES", 1_000),
        })
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.session_timeout_minutes))
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.max(1))
    }

    pub fn analytics_timeout(&self) -> Duration {
        Duration::from_millis(self.analytics_timeout_ms)
    }
}
