use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::attribution::AttributionData;
use crate::error::ConversionError;

/// Marketing channel a touchpoint arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OrganicSearch,
    PaidSearch,
    Social,
    Email,
    Direct,
    Referral,
    Display,
    Affiliate,
}

impl ChannelType {
    pub const ALL: [ChannelType; 8] = [
        ChannelType::OrganicSearch,
        ChannelType::PaidSearch,
        ChannelType::Social,
        ChannelType::Email,
        ChannelType::Direct,
        ChannelType::Referral,
        ChannelType::Display,
        ChannelType::Affiliate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OrganicSearch => "organic_search",
            ChannelType::PaidSearch => "paid_search",
            ChannelType::Social => "social",
            ChannelType::Email => "email",
            ChannelType::Direct => "direct",
            ChannelType::Referral => "referral",
            ChannelType::Display => "display",
            ChannelType::Affiliate => "affiliate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single marketing exposure recorded on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touchpoint {
    pub id: String,
    pub channel: ChannelType,
    pub source: String,
    pub medium: String,
    pub campaign: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// 1-based index: within the session's touchpoint list as stored,
    /// renumbered in path order whenever a path is built.
    pub position: u32,
}

/// Touchpoint as the client describes it on every tracked event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchpointDescriptor {
    pub id: Option<String>,
    pub channel: ChannelType,
    pub source: String,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub value: Option<f64>,
}

impl TouchpointDescriptor {
    /// Resolve the descriptor into a touchpoint first seen at `at`.
    ///
    /// `position` is left at 0; the session assigns it on append.
    pub fn resolve(&self, session_id: &str, at: DateTime<Utc>) -> Touchpoint {
        let medium = self
            .medium
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.channel.as_str())
            .to_string();
        let campaign = self
            .campaign
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let id = self
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                derive_touchpoint_id(
                    session_id,
                    self.channel,
                    self.source.trim(),
                    &medium,
                    campaign.as_deref(),
                )
            });
        Touchpoint {
            id,
            channel: self.channel,
            source: self.source.trim().to_string(),
            medium,
            campaign,
            timestamp: at,
            value: self.value.filter(|v| v.is_finite()).unwrap_or(0.0),
            position: 0,
        }
    }
}

/// Compute a deterministic touchpoint identity for clients that do not send one.
///
/// `tp_` + sha256(session_id | channel | source | medium | campaign)[0..8] as hex,
/// so a repeated beacon for the same exposure maps onto the same touchpoint.
pub fn derive_touchpoint_id(
    session_id: &str,
    channel: ChannelType,
    source: &str,
    medium: &str,
    campaign: Option<&str>,
) -> String {
    let input = format!(
        "{}|{}|{}|{}|{}",
        session_id,
        channel.as_str(),
        source,
        medium,
        campaign.unwrap_or("")
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("tp_{}", hex::encode(&hash[..8]))
}

/// The payload accepted by `POST /api/track`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackEventRequest {
    /// Client-assigned event id. Resending a beacon with the same id is a no-op.
    pub event_id: Option<String>,
    pub session_id: String,
    pub visitor_id: String,
    pub funnel_id: String,
    pub event_type: String,
    pub event_name: Option<String>,
    pub value: Option<f64>,
    pub page_url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub touchpoint: Option<TouchpointDescriptor>,
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub user_agent: Option<String>,
    /// Authenticated user id, when the visitor is logged in.
    pub user_id: Option<String>,
    /// Cookie-sync / device-fingerprint identifier shared across devices.
    pub sync_id: Option<String>,
}

fn require(field: &str, value: &str) -> Result<(), ConversionError> {
    if value.trim().is_empty() {
        return Err(ConversionError::invalid_event(format!("{field} is required")));
    }
    Ok(())
}

impl TrackEventRequest {
    /// Check the fields ingestion cannot proceed without.
    pub fn validate(&self) -> Result<(), ConversionError> {
        require("session_id", &self.session_id)?;
        require("visitor_id", &self.visitor_id)?;
        require("funnel_id", &self.funnel_id)?;
        require("event_type", &self.event_type)?;
        if self.timestamp.is_none() {
            return Err(ConversionError::invalid_event("timestamp is required"));
        }
        let Some(touchpoint) = &self.touchpoint else {
            return Err(ConversionError::invalid_event("touchpoint is required"));
        };
        require("touchpoint.source", &touchpoint.source)?;
        if let Some(value) = self.value {
            if !value.is_finite() {
                return Err(ConversionError::invalid_event("value must be a finite number"));
            }
        }
        Ok(())
    }

    /// The id the event is stored under: the client's `event_id`, else one
    /// derived from what the beacon reports so a resent beacon maps onto the
    /// event already recorded.
    pub fn resolve_event_id(&self, timestamp: DateTime<Utc>, touchpoint_id: &str) -> String {
        if let Some(id) = self.event_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let input = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.session_id.trim(),
            self.event_type.trim(),
            self.event_name.as_deref().unwrap_or(""),
            timestamp.timestamp_millis(),
            touchpoint_id,
            self.value.map(f64::to_bits).unwrap_or(0),
            self.page_url.as_deref().unwrap_or("")
        );
        let hash = Sha256::digest(input.as_bytes());
        format!("evt_{}", hex::encode(&hash[..12]))
    }
}

/// A stored behavioral event. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: String,
    pub funnel_id: String,
    pub session_id: String,
    pub visitor_id: String,
    pub event_type: String,
    pub event_name: Option<String>,
    pub value: f64,
    pub page_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub device_type: String,
    pub user_id: Option<String>,
    pub touchpoint: Touchpoint,
    pub is_conversion: bool,
    pub goal_id: Option<String>,
    pub attribution: Option<AttributionData>,
}

impl ConversionEvent {
    /// Build the not-yet-evaluated event for a validated request.
    pub fn from_request(
        id: String,
        req: &TrackEventRequest,
        timestamp: DateTime<Utc>,
        touchpoint: Touchpoint,
        device_type: String,
    ) -> Self {
        Self {
            id,
            funnel_id: req.funnel_id.clone(),
            session_id: req.session_id.clone(),
            visitor_id: req.visitor_id.clone(),
            event_type: req.event_type.trim().to_string(),
            event_name: req
                .event_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            value: req.value.unwrap_or(0.0),
            page_url: req.page_url.clone(),
            timestamp,
            properties: req.properties.clone().unwrap_or_default(),
            device_type,
            user_id: req.user_id.clone(),
            touchpoint,
            is_conversion: false,
            goal_id: None,
            attribution: None,
        }
    }
}
