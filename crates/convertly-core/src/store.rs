use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ConversionEvent;
use crate::funnel::{ConversionFunnel, FunnelStatus};
use crate::session::VisitorSession;

/// Half-open UTC interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Calendar-day range, inclusive of `end_date`.
    pub fn from_dates(start_date: NaiveDate, end_date: NaiveDate) -> Option<Self> {
        if end_date < start_date {
            return None;
        }
        let start = start_date.and_hms_opt(0, 0, 0)?.and_utc();
        let end = end_date.succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
        Some(Self { start, end })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Result of writing a session together with the event that changed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// The stored session version moved; nothing was written.
    VersionConflict,
    /// An event with this id is already stored; nothing was written.
    DuplicateEvent,
}

/// Persistence seam for funnels, sessions and events.
///
/// Implementations report failures as `anyhow` errors; the engine decides
/// which are retried. Sessions are written with an optimistic version check.
#[async_trait]
pub trait ConversionStore: Send + Sync + 'static {
    async fn insert_funnel(&self, funnel: &ConversionFunnel) -> anyhow::Result<()>;

    async fn get_funnel(&self, funnel_id: &str) -> anyhow::Result<Option<ConversionFunnel>>;

    async fn list_funnels(&self, user_id: &str) -> anyhow::Result<Vec<ConversionFunnel>>;

    /// Returns `false` when no funnel has this id.
    async fn update_funnel_status(
        &self,
        funnel_id: &str,
        status: FunnelStatus,
        updated_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Delete a funnel together with its sessions and events.
    async fn delete_funnel(&self, funnel_id: &str) -> anyhow::Result<bool>;

    async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<VisitorSession>>;

    /// Write `session` and append `event` in one transaction.
    ///
    /// The session is written only if the stored version still equals
    /// `expected_version` (0 means "must not exist yet"); the stored row takes
    /// `session.version`. Either both rows are written or neither is.
    async fn record_event(
        &self,
        session: &VisitorSession,
        expected_version: u64,
        event: &ConversionEvent,
    ) -> anyhow::Result<RecordOutcome>;

    async fn get_event(&self, event_id: &str) -> anyhow::Result<Option<ConversionEvent>>;

    async fn list_sessions(&self, funnel_id: &str) -> anyhow::Result<Vec<VisitorSession>>;

    /// Set `ended_at` on open sessions idle since before `cutoff`. Returns the count closed.
    async fn close_idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Events of a funnel ordered by `(timestamp, id)`.
    async fn list_events(
        &self,
        funnel_id: &str,
        range: Option<&TimeRange>,
    ) -> anyhow::Result<Vec<ConversionEvent>>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_includes_whole_end_day() {
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date");
        let end = NaiveDate::from_ymd_opt(2026, 3, 31).expect("valid date");
        let range = TimeRange::from_dates(start, end).expect("valid range");

        let last_moment = DateTime::parse_from_rfc3339("2026-03-31T23:59:59Z")
            .expect("valid ts")
            .with_timezone(&Utc);
        let next_day = DateTime::parse_from_rfc3339("2026-04-01T00:00:00Z")
            .expect("valid ts")
            .with_timezone(&Utc);
        assert!(range.contains(range.start));
        assert!(range.contains(last_moment));
        assert!(!range.contains(next_day));
    }

    #[test]
    fn inverted_dates_are_rejected() {
        let start = NaiveDate::from_ymd_opt(2026, 3, 2).expect("valid date");
        let end = NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date");
        assert!(TimeRange::from_dates(start, end).is_none());
    }
}
