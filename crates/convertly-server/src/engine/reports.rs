//! Read-side reporting: funnel analytics, path patterns and model comparison.
//!
//! Everything here is recomputed from stored events and sessions. Nothing
//! stored is modified.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use convertly_core::aggregate::{aggregate, analyze_paths, FunnelAnalytics, PathPattern};
use convertly_core::attribution::{compare_models, AttributedConversion, AttributionModel, ModelComparison};
use convertly_core::event::ConversionEvent;
use convertly_core::path::{build_conversion_path, build_session_conversion_path, ConversionPath};
use convertly_core::session::VisitorSession;
use convertly_core::store::TimeRange;
use convertly_core::ConversionError;

use super::cache::PathKey;
use super::retry::with_retry;
use super::ConversionEngine;

/// Label given to the funnel's default model when no models are requested.
const DEFAULT_LABEL: &str = "default";

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub analytics: FunnelAnalytics,
    pub computed_at: DateTime<Utc>,
    /// Served from the last good computation because the store was unavailable.
    pub stale: bool,
}

/// A model offered for comparison. Without a label the model type name is used.
#[derive(Debug, Clone, Deserialize)]
pub struct LabeledModel {
    pub label: Option<String>,
    #[serde(flatten)]
    pub model: AttributionModel,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompareModelsRequest {
    /// Empty means the funnel's default model plus its configured alternates.
    #[serde(default)]
    pub models: Vec<LabeledModel>,
    /// Label of the baseline model; the first model when absent.
    pub baseline: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub funnel_id: String,
    pub range: Option<TimeRange>,
    pub baseline: String,
    pub conversions: usize,
    pub models: Vec<ModelComparison>,
}

impl ConversionEngine {
    async fn within_timeout<T, F>(&self, work: F) -> Result<T, ConversionError>
    where
        F: Future<Output = Result<T, ConversionError>>,
    {
        let limit = self.config.analytics_timeout();
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(ConversionError::AnalyticsTimeout(limit.as_millis() as u64)),
        }
    }

    /// Funnel analytics for `range` (all time when `None`).
    ///
    /// When the store is unavailable or the computation times out, the last
    /// successful snapshot for the same funnel and range is returned marked stale.
    pub async fn funnel_analytics(
        &self,
        funnel_id: &str,
        range: Option<TimeRange>,
    ) -> Result<AnalyticsSnapshot, ConversionError> {
        let key = (funnel_id.to_string(), range);
        match self.within_timeout(self.compute_analytics(funnel_id, range)).await {
            Ok(analytics) => {
                let snapshot = AnalyticsSnapshot {
                    analytics,
                    computed_at: Utc::now(),
                    stale: false,
                };
                self.snapshots.insert(key, snapshot.clone()).await;
                Ok(snapshot)
            }
            Err(err @ (ConversionError::StorageUnavailable { .. } | ConversionError::AnalyticsTimeout(_))) => {
                match self.snapshots.get(&key).await {
                    Some(mut snapshot) => {
                        warn!(funnel_id, error = %err, computed_at = %snapshot.computed_at, "serving stale analytics");
                        snapshot.stale = true;
                        Ok(snapshot)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn compute_analytics(
        &self,
        funnel_id: &str,
        range: Option<TimeRange>,
    ) -> Result<FunnelAnalytics, ConversionError> {
        let funnel = self.get_funnel(funnel_id).await?;
        let events = with_retry(&self.retry, "list_events", || {
            self.store.list_events(funnel_id, range.as_ref())
        })
        .await?;
        Ok(aggregate(&funnel, &events, range))
    }

    /// Channel-sequence patterns of the funnel's conversions, over linked
    /// devices when the funnel's default model attributes across them.
    pub async fn analyze_conversion_paths(
        &self,
        funnel_id: &str,
        range: Option<TimeRange>,
        min_frequency: u64,
    ) -> Result<Vec<PathPattern>, ConversionError> {
        let funnel = self.get_funnel(funnel_id).await?;
        let cross_device = funnel.attribution.default_model.cross_device;
        let mut conversions = self
            .within_timeout(self.load_conversions(funnel_id, range, cross_device))
            .await?;
        for conversion in &mut conversions {
            if let Some(linked) = conversion.linked_path.take() {
                conversion.path = linked;
            }
        }
        Ok(analyze_paths(&conversions, min_frequency))
    }

    /// Re-attribute stored conversions under several models side by side.
    pub async fn compare_attribution_models(
        &self,
        funnel_id: &str,
        request: CompareModelsRequest,
        range: Option<TimeRange>,
    ) -> Result<ComparisonReport, ConversionError> {
        let funnel = self.get_funnel(funnel_id).await?;

        let models: Vec<(String, AttributionModel)> = if request.models.is_empty() {
            std::iter::once((DEFAULT_LABEL.to_string(), funnel.attribution.default_model.clone()))
                .chain(
                    funnel
                        .attribution
                        .alternates
                        .iter()
                        .map(|(label, model)| (label.clone(), model.clone())),
                )
                .collect()
        } else {
            request
                .models
                .into_iter()
                .map(|m| {
                    let label = m
                        .label
                        .filter(|l| !l.trim().is_empty())
                        .unwrap_or_else(|| m.model.model_type.as_str().to_string());
                    (label, m.model)
                })
                .collect()
        };

        let mut seen = BTreeSet::new();
        for (label, _) in &models {
            if !seen.insert(label.as_str()) {
                return Err(ConversionError::validation(
                    "models",
                    format!("duplicate model label '{label}'"),
                ));
            }
        }

        let baseline = match &request.baseline {
            None => 0,
            Some(name) => models
                .iter()
                .position(|(label, _)| label == name)
                .ok_or_else(|| {
                    ConversionError::validation("baseline", format!("no model labelled '{name}'"))
                })?,
        };

        let cross_device = models.iter().any(|(_, model)| model.cross_device);
        let conversions = self
            .within_timeout(self.load_conversions(funnel_id, range, cross_device))
            .await?;
        let comparisons = compare_models(&conversions, &models, baseline);
        Ok(ComparisonReport {
            funnel_id: funnel.id,
            range,
            baseline: models[baseline].0.clone(),
            conversions: conversions.len(),
            models: comparisons,
        })
    }

    /// Stored conversions with their reconstructed paths, built the same way
    /// ingestion built them. `cross_device` adds the path merged over linked
    /// sessions.
    async fn load_conversions(
        &self,
        funnel_id: &str,
        range: Option<TimeRange>,
        cross_device: bool,
    ) -> Result<Vec<AttributedConversion>, ConversionError> {
        self.get_funnel(funnel_id).await?;
        let events = with_retry(&self.retry, "list_events", || {
            self.store.list_events(funnel_id, range.as_ref())
        })
        .await?;
        let sessions: Vec<VisitorSession> =
            with_retry(&self.retry, "list_sessions", || self.store.list_sessions(funnel_id)).await?;
        let by_id: HashMap<&str, &VisitorSession> = sessions.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut conversions = Vec::new();
        for event in events.iter().filter(|e| e.is_conversion) {
            let (path, linked_path) = match by_id.get(event.session_id.as_str()) {
                Some(session) => {
                    let path = self.cached_path(session, event).await;
                    let linked = cross_device.then(|| {
                        self.conversion_path(session, Some(sessions.as_slice()), &event.touchpoint, event.timestamp)
                    });
                    (path, linked)
                }
                None => (
                    build_conversion_path(
                        &event.session_id,
                        &event.visitor_id,
                        &[],
                        &event.touchpoint,
                        event.timestamp,
                    ),
                    None,
                ),
            };
            conversions.push(AttributedConversion {
                path,
                linked_path,
                value: event.value,
                at: event.timestamp,
                touchpoint: event.touchpoint.clone(),
            });
        }
        Ok(conversions)
    }

    async fn cached_path(&self, session: &VisitorSession, event: &ConversionEvent) -> ConversionPath {
        let key = PathKey::new(&session.id, session.version, event.timestamp, &event.touchpoint.id);
        if let Some(path) = self.path_cache.get(&key).await {
            return path;
        }
        let path = build_session_conversion_path(session, &event.touchpoint, event.timestamp);
        self.path_cache.insert(key, path.clone()).await;
        path
    }
}
