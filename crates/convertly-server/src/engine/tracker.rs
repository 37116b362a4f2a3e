use chrono::{DateTime, Utc};
use tracing::{debug, info};

use convertly_core::attribution::{attribute, Conversion};
use convertly_core::event::{ConversionEvent, Touchpoint, TrackEventRequest};
use convertly_core::funnel::ConversionFunnel;
use convertly_core::goals::matching_goal;
use convertly_core::identity::resolve_profile;
use convertly_core::path::{build_conversion_path, build_session_conversion_path, ConversionPath};
use convertly_core::session::VisitorSession;
use convertly_core::store::RecordOutcome;
use convertly_core::ConversionError;

use super::retry::with_retry;
use super::ConversionEngine;
use crate::device::resolve_device_type;

/// Reload-and-reapply rounds allowed when the stored session version moves
/// underneath an ingestion (e.g. the idle sweep closed it).
const MAX_VERSION_CONFLICTS: u32 = 5;

impl ConversionEngine {
    /// Ingest one behavioral event and return it enriched with conversion
    /// and attribution data.
    #[tracing::instrument(skip(self, req), fields(session_id = %req.session_id, funnel_id = %req.funnel_id))]
    pub async fn track_event(&self, req: TrackEventRequest) -> Result<ConversionEvent, ConversionError> {
        req.validate()?;
        let funnel = self.get_funnel(&req.funnel_id).await?;
        if !funnel.is_active() {
            return Err(ConversionError::FunnelInactive(funnel.id));
        }

        let lock = self.session_lock(&req.session_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_event(&funnel, &req).await
        };
        drop(lock);
        self.release_session_lock(&req.session_id);
        result
    }

    async fn apply_event(
        &self,
        funnel: &ConversionFunnel,
        req: &TrackEventRequest,
    ) -> Result<ConversionEvent, ConversionError> {
        let timestamp = req
            .timestamp
            .ok_or_else(|| ConversionError::invalid_event("timestamp is required"))?;
        let descriptor = req
            .touchpoint
            .as_ref()
            .ok_or_else(|| ConversionError::invalid_event("touchpoint is required"))?;

        let touchpoint_id = descriptor.resolve(&req.session_id, timestamp).id;
        let event_id = req.resolve_event_id(timestamp, &touchpoint_id);
        if let Some(stored) = self.recorded_event(&event_id).await? {
            return Ok(stored);
        }

        for attempt in 1..=MAX_VERSION_CONFLICTS {
            let stored = with_retry(&self.retry, "get_session", || {
                self.store.get_session(&req.session_id)
            })
            .await?;
            let mut session = match stored {
                Some(existing) if existing.funnel_id != funnel.id => {
                    return Err(ConversionError::invalid_event(format!(
                        "session {} belongs to another funnel",
                        existing.id
                    )));
                }
                Some(existing) => existing,
                None => {
                    let device_type =
                        resolve_device_type(req.device_type.as_deref(), req.user_agent.as_deref());
                    VisitorSession::start(
                        &req.session_id,
                        &funnel.id,
                        &req.visitor_id,
                        req.device_id.as_deref(),
                        &device_type,
                        timestamp,
                    )
                }
            };
            let expected_version = session.version;

            let touchpoint = session.append_touchpoint(descriptor.resolve(&session.id, timestamp));
            session.record_activity(&req.event_type, timestamp);
            session.learn_identity(req.user_id.as_deref(), req.sync_id.as_deref());

            let mut event = ConversionEvent::from_request(
                event_id.clone(),
                req,
                timestamp,
                touchpoint,
                session.device_type.clone(),
            );

            if let Some(goal) = matching_goal(&event, funnel) {
                let value = if event.value > 0.0 { event.value } else { goal.value };
                session.record_conversion(value);
                let model = funnel.model_for_goal(goal);
                let linked = if model.cross_device {
                    Some(
                        with_retry(&self.retry, "list_sessions", || {
                            self.store.list_sessions(&session.funnel_id)
                        })
                        .await?,
                    )
                } else {
                    None
                };
                let path = self.conversion_path(&session, linked.as_deref(), &event.touchpoint, timestamp);
                let attribution = attribute(
                    &path,
                    &Conversion {
                        at: timestamp,
                        value,
                        touchpoint: &event.touchpoint,
                    },
                    model,
                );
                event.value = value;
                event.is_conversion = true;
                event.goal_id = Some(goal.id.clone());
                event.attribution = Some(attribution);
            }

            session.version = expected_version + 1;
            let outcome = with_retry(&self.retry, "record_event", || {
                self.store.record_event(&session, expected_version, &event)
            })
            .await?;
            match outcome {
                RecordOutcome::Recorded => {
                    info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        is_conversion = event.is_conversion,
                        value = event.value,
                        "event tracked"
                    );
                    return Ok(event);
                }
                RecordOutcome::VersionConflict => {
                    debug!(attempt, expected_version, "session version conflict, reapplying event");
                }
                RecordOutcome::DuplicateEvent => {
                    if let Some(stored) = self.recorded_event(&event_id).await? {
                        return Ok(stored);
                    }
                }
            }
        }

        Err(ConversionError::StorageUnavailable {
            operation: "record_event".to_string(),
            attempts: MAX_VERSION_CONFLICTS,
            message: "session version kept changing".to_string(),
        })
    }

    async fn recorded_event(&self, event_id: &str) -> Result<Option<ConversionEvent>, ConversionError> {
        let stored = with_retry(&self.retry, "get_event", || self.store.get_event(event_id)).await?;
        if stored.is_some() {
            debug!(event_id, "event already recorded, ignoring resend");
        }
        Ok(stored)
    }

    /// The path credited for a conversion that arrived on `converting`: this
    /// session's touchpoints, or, when `linked` candidates are given, the
    /// merged touchpoints of every session linked to it.
    pub(crate) fn conversion_path(
        &self,
        session: &VisitorSession,
        linked: Option<&[VisitorSession]>,
        converting: &Touchpoint,
        upto: DateTime<Utc>,
    ) -> ConversionPath {
        let Some(candidates) = linked else {
            return build_session_conversion_path(session, converting, upto);
        };
        let profile = resolve_profile(self.resolver.as_ref(), session, candidates);
        debug!(
            profile_id = %profile.id,
            sessions = profile.session_ids.len(),
            touchpoints = profile.touchpoints.len(),
            "cross-device path"
        );
        build_conversion_path(
            &session.id,
            &session.visitor_id,
            &profile.touchpoints,
            converting,
            upto,
        )
    }
}
