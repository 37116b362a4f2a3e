use async_trait::async_trait;
use chrono::{DateTime, Utc};

use convertly_core::event::ConversionEvent;
use convertly_core::funnel::{ConversionFunnel, FunnelStatus};
use convertly_core::session::VisitorSession;
use convertly_core::store::{ConversionStore, RecordOutcome, TimeRange};

use crate::queries::{events, funnels};
use crate::{session, DuckDbBackend};

#[async_trait]
impl ConversionStore for DuckDbBackend {
    async fn insert_funnel(&self, funnel: &ConversionFunnel) -> anyhow::Result<()> {
        funnels::insert_funnel_inner(self, funnel).await
    }

    async fn get_funnel(&self, funnel_id: &str) -> anyhow::Result<Option<ConversionFunnel>> {
        funnels::get_funnel_inner(self, funnel_id).await
    }

    async fn list_funnels(&self, user_id: &str) -> anyhow::Result<Vec<ConversionFunnel>> {
        funnels::list_funnels_inner(self, user_id).await
    }

    async fn update_funnel_status(
        &self,
        funnel_id: &str,
        status: FunnelStatus,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        funnels::update_funnel_status_inner(self, funnel_id, status, updated_at).await
    }

    async fn delete_funnel(&self, funnel_id: &str) -> anyhow::Result<bool> {
        funnels::delete_funnel_inner(self, funnel_id).await
    }

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<VisitorSession>> {
        session::get_session_inner(self, session_id).await
    }

    async fn record_event(
        &self,
        session: &VisitorSession,
        expected_version: u64,
        event: &ConversionEvent,
    ) -> anyhow::Result<RecordOutcome> {
        session::record_event_inner(self, session, expected_version, event).await
    }

    async fn get_event(&self, event_id: &str) -> anyhow::Result<Option<ConversionEvent>> {
        events::get_event_inner(self, event_id).await
    }

    async fn list_sessions(&self, funnel_id: &str) -> anyhow::Result<Vec<VisitorSession>> {
        session::list_sessions_inner(self, funnel_id).await
    }

    async fn close_idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        session::close_idle_sessions_inner(self, cutoff, closed_at).await
    }

    async fn list_events(
        &self,
        funnel_id: &str,
        range: Option<&TimeRange>,
    ) -> anyhow::Result<Vec<ConversionEvent>> {
        events::list_events_inner(self, funnel_id, range).await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        DuckDbBackend::ping(self).await
    }
}
