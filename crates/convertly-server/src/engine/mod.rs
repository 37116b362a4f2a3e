//! The conversion engine service object.
//!
//! Built once at startup and shared through [`crate::state::AppState`]. It owns
//! the store handle, the identity resolver, per-session ingestion locks, the
//! path cache and the last good analytics snapshot per (funnel, range).

pub mod cache;
pub mod reports;
pub mod retry;
pub mod tracker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use convertly_core::config::Config;
use convertly_core::funnel::{build_funnel, ConversionFunnel, CreateFunnelRequest, FunnelStatus};
use convertly_core::identity::{DeterministicResolver, IdentityResolver};
use convertly_core::session::VisitorSession;
use convertly_core::store::{ConversionStore, TimeRange};
use convertly_core::ConversionError;

use self::cache::{BoundedCache, PathCache};
use self::reports::AnalyticsSnapshot;
use self::retry::{with_retry, RetryPolicy};

pub struct ConversionEngine {
    store: Arc<dyn ConversionStore>,
    config: Arc<Config>,
    resolver: Arc<dyn IdentityResolver>,
    retry: RetryPolicy,
    /// One async mutex per session id with ingestion in flight.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
    path_cache: PathCache,
    snapshots: BoundedCache<(String, Option<TimeRange>), AnalyticsSnapshot>,
}

impl ConversionEngine {
    pub fn new(store: Arc<dyn ConversionStore>, config: Arc<Config>) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            path_cache: PathCache::new(config.path_cache_max_entries),
            snapshots: BoundedCache::new(config.snapshot_max_entries),
            store,
            config,
            resolver: Arc::new(DeterministicResolver),
            session_locks: DashMap::new(),
        }
    }

    /// Swap the cross-device identity resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the lock entry once no other task holds or awaits it.
    pub(crate) fn release_session_lock(&self, session_id: &str) {
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub async fn create_funnel(&self, req: CreateFunnelRequest) -> Result<ConversionFunnel, ConversionError> {
        let funnel = build_funnel(req, Utc::now())?;
        with_retry(&self.retry, "insert_funnel", || self.store.insert_funnel(&funnel)).await?;
        info!(
            funnel_id = %funnel.id,
            user_id = %funnel.user_id,
            steps = funnel.steps.len(),
            goals = funnel.goals.len(),
            "funnel created"
        );
        Ok(funnel)
    }

    pub async fn list_funnels(&self, user_id: &str) -> Result<Vec<ConversionFunnel>, ConversionError> {
        if user_id.trim().is_empty() {
            return Err(ConversionError::validation("user_id", "must not be empty"));
        }
        with_retry(&self.retry, "list_funnels", || self.store.list_funnels(user_id)).await
    }

    pub async fn get_funnel(&self, funnel_id: &str) -> Result<ConversionFunnel, ConversionError> {
        with_retry(&self.retry, "get_funnel", || self.store.get_funnel(funnel_id))
            .await?
            .ok_or_else(|| ConversionError::FunnelNotFound(funnel_id.to_string()))
    }

    pub async fn set_funnel_status(
        &self,
        funnel_id: &str,
        status: FunnelStatus,
    ) -> Result<ConversionFunnel, ConversionError> {
        let now = Utc::now();
        let updated = with_retry(&self.retry, "update_funnel_status", || {
            self.store.update_funnel_status(funnel_id, status, now)
        })
        .await?;
        if !updated {
            return Err(ConversionError::FunnelNotFound(funnel_id.to_string()));
        }
        info!(funnel_id, status = status.as_str(), "funnel status changed");
        self.get_funnel(funnel_id).await
    }

    /// Delete a funnel and everything recorded against it.
    pub async fn delete_funnel(&self, funnel_id: &str) -> Result<(), ConversionError> {
        let deleted = with_retry(&self.retry, "delete_funnel", || self.store.delete_funnel(funnel_id)).await?;
        if !deleted {
            return Err(ConversionError::FunnelNotFound(funnel_id.to_string()));
        }
        self.snapshots.retain(|(id, _)| id != funnel_id).await;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<VisitorSession, ConversionError> {
        with_retry(&self.retry, "get_session", || self.store.get_session(session_id))
            .await?
            .ok_or_else(|| ConversionError::SessionNotFound(session_id.to_string()))
    }

    /// Close sessions idle for longer than the configured timeout.
    pub async fn close_idle_sessions(&self, now: DateTime<Utc>) -> Result<u64, ConversionError> {
        let cutoff = now - self.config.session_timeout();
        let closed = with_retry(&self.retry, "close_idle_sessions", || {
            self.store.close_idle_sessions(cutoff, now)
        })
        .await?;
        if closed > 0 {
            info!(closed, "idle sessions closed");
        }
        Ok(closed)
    }

    /// Single-shot store liveness check, no retry.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.store.ping().await
    }
}
