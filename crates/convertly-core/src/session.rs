use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Touchpoint;

/// Per-visitor session state. The only mutable record in the system; every
/// mutation bumps `version` so stores can detect lost updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorSession {
    pub id: String,
    pub funnel_id: String,
    pub visitor_id: String,
    pub device_id: String,
    pub device_type: String,
    pub user_id: Option<String>,
    pub sync_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub touchpoints: Vec<Touchpoint>,
    pub page_views: u32,
    pub event_count: u32,
    pub converted: bool,
    pub conversion_value: f64,
    pub version: u64,
}

impl VisitorSession {
    /// A fresh, unpersisted session (`version` 0).
    pub fn start(
        id: &str,
        funnel_id: &str,
        visitor_id: &str,
        device_id: Option<&str>,
        device_type: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            funnel_id: funnel_id.to_string(),
            visitor_id: visitor_id.to_string(),
            // Without an explicit device id the visitor cookie is the best device signal.
            device_id: device_id
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(visitor_id)
                .to_string(),
            device_type: device_type.to_string(),
            user_id: None,
            sync_id: None,
            started_at: at,
            last_activity_at: at,
            ended_at: None,
            touchpoints: Vec::new(),
            page_views: 0,
            event_count: 0,
            converted: false,
            conversion_value: 0.0,
            version: 0,
        }
    }

    /// Append a touchpoint unless one with the same id is already recorded.
    ///
    /// Returns the stored touchpoint (new or existing). A repeat keeps its
    /// first sighting; conversion paths place the converting touchpoint last.
    pub fn append_touchpoint(&mut self, mut touchpoint: Touchpoint) -> Touchpoint {
        if let Some(existing) = self.touchpoints.iter().find(|t| t.id == touchpoint.id) {
            return existing.clone();
        }
        touchpoint.position = self.touchpoints.len() as u32 + 1;
        self.touchpoints.push(touchpoint.clone());
        touchpoint
    }

    /// Record activity for one event. Reopens a closed session.
    pub fn record_activity(&mut self, event_type: &str, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
        if at < self.started_at {
            self.started_at = at;
        }
        self.ended_at = None;
        self.event_count += 1;
        if event_type == "page_view" {
            self.page_views += 1;
        }
    }

    /// Fill in identity signals the session did not have yet.
    pub fn learn_identity(&mut self, user_id: Option<&str>, sync_id: Option<&str>) {
        let known = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
        if self.user_id.is_none() {
            self.user_id = known(user_id);
        }
        if self.sync_id.is_none() {
            self.sync_id = known(sync_id);
        }
    }

    pub fn record_conversion(&mut self, value: f64) {
        self.converted = true;
        self.conversion_value += value;
    }

    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// True when the session has seen no activity for at least `timeout`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_activity_at >= timeout
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        if self.ended_at.is_none() {
            self.ended_at = Some(at);
        }
    }
}
