use std::sync::Arc;

use chrono::Utc;
use tracing::error;

use convertly_core::config::Config;
use convertly_core::store::ConversionStore;
use convertly_duckdb::DuckDbBackend;

use crate::engine::ConversionEngine;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    pub engine: Arc<ConversionEngine>,

    /// Parsed configuration, loaded once at startup from environment variables.
    pub config: Arc<Config>,
}

impl AppState {
    /// Construct a new `AppState` over the DuckDB backend.
    pub fn new(db: DuckDbBackend, config: Config) -> Self {
        Self::with_store(Arc::new(db), config)
    }

    /// Construct over any store implementation.
    pub fn with_store(store: Arc<dyn ConversionStore>, config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            engine: Arc::new(ConversionEngine::new(store, Arc::clone(&config))),
            config,
        }
    }

    /// Background loop: close sessions that have been idle past the timeout.
    ///
    /// A failed sweep is logged and retried on the next tick.
    pub async fn run_session_sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.session_sweep_interval());
        loop {
            ticker.tick().await;
            if let Err(e) = self.engine.close_idle_sessions(Utc::now()).await {
                error!(error = %e, "Idle session sweep failed");
            }
        }
    }
}
