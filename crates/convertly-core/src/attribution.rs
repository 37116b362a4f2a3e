//! Multi-touch attribution.
//!
//! Every model distributes exactly one unit of credit over the touchpoints
//! that survive the lookback filter. Models that cannot be applied as
//! configured degrade to a simpler rule and report a [`FallbackReason`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::event::{ChannelType, Touchpoint};
use crate::path::ConversionPath;

const RULE_CONFIDENCE: f64 = 0.8;
const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModelType {
    FirstTouch,
    LastTouch,
    Linear,
    TimeDecay,
    PositionBased,
    DataDriven,
    Custom,
    /// Any model name this build does not know.
    #[serde(other)]
    Unrecognized,
}

impl AttributionModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributionModelType::FirstTouch => "first_touch",
            AttributionModelType::LastTouch => "last_touch",
            AttributionModelType::Linear => "linear",
            AttributionModelType::TimeDecay => "time_decay",
            AttributionModelType::PositionBased => "position_based",
            AttributionModelType::DataDriven => "data_driven",
            AttributionModelType::Custom => "custom",
            AttributionModelType::Unrecognized => "unrecognized",
        }
    }
}

fn default_half_life_days() -> f64 {
    7.0
}

fn default_edge_weight() -> f64 {
    0.4
}

fn default_confidence_threshold() -> u32 {
    5
}

fn default_lookback_days() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_edge_weight")]
    pub first_touch_weight: f64,
    #[serde(default = "default_edge_weight")]
    pub last_touch_weight: f64,
    /// Relative weight per channel name; channels not listed weigh 1.0.
    #[serde(default)]
    pub custom_weights: BTreeMap<String, f64>,
    /// Touchpoints with an explicit weight needed for full confidence.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u32,
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            first_touch_weight: default_edge_weight(),
            last_touch_weight: default_edge_weight(),
            custom_weights: BTreeMap::new(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionModel {
    pub model_type: AttributionModelType,
    #[serde(default = "default_lookback_days")]
    pub lookback_window_days: u32,
    /// Attribute over the merged touchpoints of every linked device.
    #[serde(default)]
    pub cross_device: bool,
    #[serde(default)]
    pub parameters: ModelParameters,
}

impl AttributionModel {
    pub fn new(model_type: AttributionModelType) -> Self {
        Self {
            model_type,
            lookback_window_days: default_lookback_days(),
            cross_device: false,
            parameters: ModelParameters::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    EmptyAfterLookback,
    UnknownModel,
    InvalidHalfLife,
    InvalidPositionWeights,
    ZeroCustomWeights,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::EmptyAfterLookback => "empty_after_lookback",
            FallbackReason::UnknownModel => "unknown_model",
            FallbackReason::InvalidHalfLife => "invalid_half_life",
            FallbackReason::InvalidPositionWeights => "invalid_position_weights",
            FallbackReason::ZeroCustomWeights => "zero_custom_weights",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchpointWeight {
    pub touchpoint_id: String,
    pub channel: ChannelType,
    pub source: String,
    pub campaign: Option<String>,
    pub weight: f64,
    pub attributed_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionData {
    pub model: AttributionModelType,
    pub first_touch: Touchpoint,
    pub last_touch: Touchpoint,
    pub touchpoint_weights: Vec<TouchpointWeight>,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackReason>,
}

/// The conversion being credited.
#[derive(Debug, Clone, Copy)]
pub struct Conversion<'a> {
    pub at: DateTime<Utc>,
    pub value: f64,
    /// Touchpoint of the converting event; credited alone when nothing else is eligible.
    pub touchpoint: &'a Touchpoint,
}

fn within_lookback(path: &ConversionPath, conversion: &Conversion<'_>, days: u32) -> Vec<Touchpoint> {
    let window = Duration::days(i64::from(days));
    path.touchpoints()
        .filter(|t| t.timestamp <= conversion.at && conversion.at - t.timestamp <= window)
        .cloned()
        .collect()
}

fn single(n: usize, index: usize) -> Vec<f64> {
    (0..n).map(|i| if i == index { 1.0 } else { 0.0 }).collect()
}

fn linear(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}

fn normalize(raw: Vec<f64>) -> Vec<f64> {
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

fn time_decay(
    touchpoints: &[Touchpoint],
    at: DateTime<Utc>,
    half_life_days: f64,
) -> (Vec<f64>, Option<FallbackReason>) {
    let (half_life, fallback) = if half_life_days.is_finite() && half_life_days > 0.0 {
        (half_life_days, None)
    } else {
        (default_half_life_days(), Some(FallbackReason::InvalidHalfLife))
    };
    let ages: Vec<f64> = touchpoints
        .iter()
        .map(|t| (at - t.timestamp).num_milliseconds() as f64 / MS_PER_DAY)
        .collect();
    // Exponents are taken relative to the freshest touchpoint so that very old
    // paths do not underflow to all-zero weights.
    let freshest = ages.iter().copied().fold(f64::INFINITY, f64::min);
    let raw = ages
        .iter()
        .map(|age| 2f64.powf(-(age - freshest) / half_life))
        .collect();
    (normalize(raw), fallback)
}

fn valid_position_weights(first: f64, last: f64) -> bool {
    first.is_finite() && last.is_finite() && first >= 0.0 && last >= 0.0 && first + last <= 1.0
}

fn position_based(n: usize, params: &ModelParameters) -> (Vec<f64>, Option<FallbackReason>) {
    let (first, last, fallback) =
        if valid_position_weights(params.first_touch_weight, params.last_touch_weight) {
            (params.first_touch_weight, params.last_touch_weight, None)
        } else {
            (
                default_edge_weight(),
                default_edge_weight(),
                Some(FallbackReason::InvalidPositionWeights),
            )
        };
    if n <= 2 {
        return (linear(n), fallback);
    }
    let interior = (1.0 - first - last) / (n - 2) as f64;
    let raw: Vec<f64> = (0..n)
        .map(|i| match i {
            0 => first,
            i if i == n - 1 => last,
            _ => interior,
        })
        .collect();
    (normalize(raw), fallback)
}

struct CustomWeights {
    weights: Vec<f64>,
    confidence: f64,
    fallback: Option<FallbackReason>,
}

fn custom(touchpoints: &[Touchpoint], params: &ModelParameters) -> CustomWeights {
    let mut explicit = 0usize;
    let raw: Vec<f64> = touchpoints
        .iter()
        .map(|t| match params.custom_weights.get(t.channel.as_str()) {
            Some(w) => {
                explicit += 1;
                if w.is_finite() && *w > 0.0 {
                    *w
                } else {
                    0.0
                }
            }
            None => 1.0,
        })
        .collect();
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return CustomWeights {
            weights: single(touchpoints.len(), touchpoints.len() - 1),
            confidence: RULE_CONFIDENCE,
            fallback: Some(FallbackReason::ZeroCustomWeights),
        };
    }
    let confidence = if params.confidence_threshold == 0 {
        1.0
    } else {
        (explicit as f64 / f64::from(params.confidence_threshold)).min(1.0)
    };
    CustomWeights {
        weights: normalize(raw),
        confidence,
        fallback: None,
    }
}

/// Distribute credit for `conversion` over the touchpoints of `path`.
///
/// Deterministic: identical inputs give bit-identical weights.
pub fn attribute(
    path: &ConversionPath,
    conversion: &Conversion<'_>,
    model: &AttributionModel,
) -> AttributionData {
    let mut touchpoints = within_lookback(path, conversion, model.lookback_window_days);
    let mut confidence = RULE_CONFIDENCE;

    let (weights, fallback) = if touchpoints.is_empty() {
        let mut own = conversion.touchpoint.clone();
        own.position = own.position.max(1);
        touchpoints.push(own);
        (vec![1.0], Some(FallbackReason::EmptyAfterLookback))
    } else {
        let n = touchpoints.len();
        match model.model_type {
            AttributionModelType::FirstTouch => (single(n, 0), None),
            AttributionModelType::LastTouch => (single(n, n - 1), None),
            AttributionModelType::Linear => (linear(n), None),
            AttributionModelType::TimeDecay => {
                time_decay(&touchpoints, conversion.at, model.parameters.half_life_days)
            }
            AttributionModelType::PositionBased => position_based(n, &model.parameters),
            AttributionModelType::Custom | AttributionModelType::DataDriven => {
                let result = custom(&touchpoints, &model.parameters);
                confidence = result.confidence;
                (result.weights, result.fallback)
            }
            AttributionModelType::Unrecognized => {
                (single(n, n - 1), Some(FallbackReason::UnknownModel))
            }
        }
    };

    if let Some(reason) = fallback {
        tracing::warn!(
            reason = %reason,
            model = model.model_type.as_str(),
            session_id = %path.session_id,
            touchpoints = touchpoints.len(),
            "attribution fell back to a simpler rule"
        );
    }

    let touchpoint_weights = touchpoints
        .iter()
        .zip(weights)
        .map(|(t, weight)| TouchpointWeight {
            touchpoint_id: t.id.clone(),
            channel: t.channel,
            source: t.source.clone(),
            campaign: t.campaign.clone(),
            weight,
            attributed_value: weight * conversion.value,
        })
        .collect();

    let first_touch = touchpoints.first().cloned().unwrap_or_else(|| conversion.touchpoint.clone());
    let last_touch = touchpoints.last().cloned().unwrap_or_else(|| conversion.touchpoint.clone());

    AttributionData {
        model: model.model_type,
        first_touch,
        last_touch,
        touchpoint_weights,
        confidence,
        fallback,
    }
}

/// Reject model configurations that would only ever fall back.
pub fn validate_model(field: &str, model: &AttributionModel) -> Result<(), ConversionError> {
    if model.model_type == AttributionModelType::Unrecognized {
        return Err(ConversionError::validation(field, "unknown attribution model type"));
    }
    if model.lookback_window_days == 0 {
        return Err(ConversionError::validation(
            format!("{field}.lookback_window_days"),
            "must be greater than zero",
        ));
    }
    let params = &model.parameters;
    match model.model_type {
        AttributionModelType::TimeDecay => {
            if !(params.half_life_days.is_finite() && params.half_life_days > 0.0) {
                return Err(ConversionError::validation(
                    format!("{field}.parameters.half_life_days"),
                    "must be a positive number of days",
                ));
            }
        }
        AttributionModelType::PositionBased => {
            if !valid_position_weights(params.first_touch_weight, params.last_touch_weight) {
                return Err(ConversionError::validation(
                    format!("{field}.parameters"),
                    "first/last touch weights must be in [0, 1] and sum to at most 1",
                ));
            }
        }
        AttributionModelType::Custom | AttributionModelType::DataDriven => {
            for (channel, weight) in &params.custom_weights {
                if ChannelType::parse(channel).is_none() {
                    return Err(ConversionError::validation(
                        format!("{field}.parameters.custom_weights"),
                        format!("unknown channel '{channel}'"),
                    ));
                }
                if !weight.is_finite() || *weight < 0.0 {
                    return Err(ConversionError::validation(
                        format!("{field}.parameters.custom_weights.{channel}"),
                        "must be a finite, non-negative number",
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// A stored conversion, ready to be re-attributed under another model.
#[derive(Debug, Clone)]
pub struct AttributedConversion {
    pub path: ConversionPath,
    /// Path merged over every session linked to the converting one; only
    /// present when some model in play attributes across devices.
    pub linked_path: Option<ConversionPath>,
    pub value: f64,
    pub at: DateTime<Utc>,
    pub touchpoint: Touchpoint,
}

impl AttributedConversion {
    /// The path a model credits: the linked one for cross-device models.
    pub fn path_for(&self, model: &AttributionModel) -> &ConversionPath {
        match &self.linked_path {
            Some(linked) if model.cross_device => linked,
            _ => &self.path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelCredit {
    pub channel: ChannelType,
    pub conversions: f64,
    pub value: f64,
    /// Attributed value minus the baseline model's value for this channel.
    pub value_delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelComparison {
    pub label: String,
    pub model: AttributionModel,
    pub attributed_conversions: u64,
    pub attributed_value: f64,
    pub channels: Vec<ChannelCredit>,
    pub delta_conversions: i64,
    pub delta_value: f64,
    pub is_baseline: bool,
    /// Conversions whose attribution degraded under this model.
    pub fallbacks: u64,
}

struct ModelTotals {
    conversions: u64,
    value: f64,
    fallbacks: u64,
    by_channel: BTreeMap<ChannelType, (f64, f64)>,
}

fn totals_for(conversions: &[AttributedConversion], model: &AttributionModel) -> ModelTotals {
    let mut totals = ModelTotals {
        conversions: 0,
        value: 0.0,
        fallbacks: 0,
        by_channel: BTreeMap::new(),
    };
    for c in conversions {
        let data = attribute(
            c.path_for(model),
            &Conversion {
                at: c.at,
                value: c.value,
                touchpoint: &c.touchpoint,
            },
            model,
        );
        if data.touchpoint_weights.is_empty() {
            continue;
        }
        totals.conversions += 1;
        if data.fallback.is_some() {
            totals.fallbacks += 1;
        }
        for w in &data.touchpoint_weights {
            totals.value += w.attributed_value;
            let entry = totals.by_channel.entry(w.channel).or_insert((0.0, 0.0));
            entry.0 += w.weight;
            entry.1 += w.attributed_value;
        }
    }
    totals
}

/// Re-attribute the same conversions under each model and report deltas
/// against `models[baseline]`. Nothing stored is touched.
pub fn compare_models(
    conversions: &[AttributedConversion],
    models: &[(String, AttributionModel)],
    baseline: usize,
) -> Vec<ModelComparison> {
    let totals: Vec<ModelTotals> = models
        .iter()
        .map(|(_, model)| totals_for(conversions, model))
        .collect();
    let Some(base) = totals.get(baseline) else {
        return Vec::new();
    };
    let channels: BTreeSet<ChannelType> = totals
        .iter()
        .flat_map(|t| t.by_channel.keys().copied())
        .collect();

    models
        .iter()
        .zip(&totals)
        .enumerate()
        .map(|(i, ((label, model), t))| ModelComparison {
            label: label.clone(),
            model: model.clone(),
            attributed_conversions: t.conversions,
            attributed_value: t.value,
            channels: channels
                .iter()
                .map(|channel| {
                    let (conversions, value) = t.by_channel.get(channel).copied().unwrap_or((0.0, 0.0));
                    let base_value = base.by_channel.get(channel).map(|c| c.1).unwrap_or(0.0);
                    ChannelCredit {
                        channel: *channel,
                        conversions,
                        value,
                        value_delta: value - base_value,
                    }
                })
                .collect(),
            delta_conversions: t.conversions as i64 - base.conversions as i64,
            delta_value: t.value - base.value,
            is_baseline: i == baseline,
            fallbacks: t.fallbacks,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::build_path_from_touchpoints;

    const EPS: f64 = 1e-9;

    fn at(minute: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + minute * 60, 0).expect("valid timestamp")
    }

    fn tp(id: &str, channel: ChannelType, minute: i64) -> Touchpoint {
        Touchpoint {
            id: id.to_string(),
            channel,
            source: channel.as_str().to_string(),
            medium: channel.as_str().to_string(),
            campaign: None,
            timestamp: at(minute),
            value: 0.0,
            position: 0,
        }
    }

    fn abc() -> Vec<Touchpoint> {
        vec![
            tp("a", ChannelType::OrganicSearch, 0),
            tp("b", ChannelType::Email, 60),
            tp("c", ChannelType::PaidSearch, 24 * 60),
        ]
    }

    fn run(touchpoints: &[Touchpoint], model: &AttributionModel, conversion_minute: i64) -> AttributionData {
        let path = build_path_from_touchpoints("s1", "v1", touchpoints, at(conversion_minute));
        let own = touchpoints.last().cloned().unwrap_or_else(|| tp("own", ChannelType::Direct, conversion_minute));
        attribute(
            &path,
            &Conversion {
                at: at(conversion_minute),
                value: 100.0,
                touchpoint: &own,
            },
            model,
        )
    }

    fn weights(data: &AttributionData) -> Vec<f64> {
        data.touchpoint_weights.iter().map(|w| w.weight).collect()
    }

    fn all_models() -> Vec<AttributionModel> {
        let mut custom = AttributionModel::new(AttributionModelType::Custom);
        custom.parameters.custom_weights.insert("email".to_string(), 3.0);
        vec![
            AttributionModel::new(AttributionModelType::FirstTouch),
            AttributionModel::new(AttributionModelType::LastTouch),
            AttributionModel::new(AttributionModelType::Linear),
            AttributionModel::new(AttributionModelType::TimeDecay),
            AttributionModel::new(AttributionModelType::PositionBased),
            AttributionModel::new(AttributionModelType::DataDriven),
            custom,
            AttributionModel::new(AttributionModelType::Unrecognized),
        ]
    }

    #[test]
    fn weights_sum_to_one_for_every_model() {
        let paths = [abc(), abc()[..1].to_vec(), abc()[..2].to_vec()];
        for model in all_models() {
            for path in &paths {
                let data = run(path, &model, 2 * 24 * 60);
                let total: f64 = weights(&data).iter().sum();
                assert!((total - 1.0).abs() < EPS, "{:?}: {total}", model.model_type);
                let value: f64 = data.touchpoint_weights.iter().map(|w| w.attributed_value).sum();
                assert!((value - 100.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn first_last_and_linear() {
        let first = run(&abc(), &AttributionModel::new(AttributionModelType::FirstTouch), 2000);
        assert_eq!(weights(&first), vec![1.0, 0.0, 0.0]);

        let last = run(&abc(), &AttributionModel::new(AttributionModelType::LastTouch), 2000);
        assert_eq!(weights(&last), vec![0.0, 0.0, 1.0]);

        let linear = run(&abc(), &AttributionModel::new(AttributionModelType::Linear), 2000);
        for w in weights(&linear) {
            assert!((w - 1.0 / 3.0).abs() < EPS);
        }
        assert!((linear.confidence - 0.8).abs() < EPS);
        assert_eq!(linear.first_touch.id, "a");
        assert_eq!(linear.last_touch.id, "c");
    }

    #[test]
    fn position_based_defaults() {
        let data = run(&abc(), &AttributionModel::new(AttributionModelType::PositionBased), 2000);
        let w = weights(&data);
        assert!((w[0] - 0.4).abs() < EPS);
        assert!((w[1] - 0.2).abs() < EPS);
        assert!((w[2] - 0.4).abs() < EPS);

        let two = run(&abc()[..2], &AttributionModel::new(AttributionModelType::PositionBased), 2000);
        assert_eq!(weights(&two), vec![0.5, 0.5]);
    }

    #[test]
    fn invalid_position_weights_fall_back_to_defaults() {
        let mut model = AttributionModel::new(AttributionModelType::PositionBased);
        model.parameters.first_touch_weight = 0.7;
        model.parameters.last_touch_weight = 0.6;
        let data = run(&abc(), &model, 2000);
        assert_eq!(data.fallback, Some(FallbackReason::InvalidPositionWeights));
        assert!((weights(&data)[1] - 0.2).abs() < EPS);
    }

    #[test]
    fn time_decay_favours_recent_touchpoints() {
        let model = AttributionModel::new(AttributionModelType::TimeDecay);
        let data = run(&abc(), &model, 3 * 24 * 60);
        let w = weights(&data);
        assert!(w[0] <= w[1] && w[1] <= w[2], "{w:?}");
        // a is one day older than c.
        let ratio = w[0] / w[2];
        assert!((ratio - 2f64.powf(-1.0 / 7.0)).abs() < 1e-9);
    }

    #[test]
    fn non_positive_half_life_uses_default() {
        let mut model = AttributionModel::new(AttributionModelType::TimeDecay);
        model.parameters.half_life_days = 0.0;
        let data = run(&abc(), &model, 3 * 24 * 60);
        assert_eq!(data.fallback, Some(FallbackReason::InvalidHalfLife));
        let expected = run(&abc(), &AttributionModel::new(AttributionModelType::TimeDecay), 3 * 24 * 60);
        assert_eq!(weights(&data), weights(&expected));
    }

    #[test]
    fn shorter_half_life_decays_faster() {
        let mut model = AttributionModel::new(AttributionModelType::TimeDecay);
        model.parameters.half_life_days = 1.0;
        let data = run(&abc(), &model, 3 * 24 * 60);
        assert_eq!(data.fallback, None);
        let w = weights(&data);
        // a is exactly one half-life older than c.
        assert!((w[0] / w[2] - 0.5).abs() < 1e-9);
        let total: f64 = w.iter().sum();
        assert!((total - 1.0).abs() < EPS);
    }

    #[test]
    fn nan_and_negative_half_life_use_seven_days() {
        let expected = run(&abc(), &AttributionModel::new(AttributionModelType::TimeDecay), 3 * 24 * 60);
        for half_life in [f64::NAN, -3.0, f64::INFINITY] {
            let mut model = AttributionModel::new(AttributionModelType::TimeDecay);
            model.parameters.half_life_days = half_life;
            let data = run(&abc(), &model, 3 * 24 * 60);
            assert_eq!(data.fallback, Some(FallbackReason::InvalidHalfLife), "{half_life}");
            assert_eq!(weights(&data), weights(&expected));
        }
    }

    #[test]
    fn lookback_excludes_old_touchpoints() {
        let mut model = AttributionModel::new(AttributionModelType::Linear);
        model.lookback_window_days = 1;
        // Conversion at day 1 + 30 min: only b and c are within one day.
        let data = run(&abc(), &model, 24 * 60 + 30);
        let ids: Vec<&str> = data.touchpoint_weights.iter().map(|w| w.touchpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn empty_after_lookback_credits_conversion_touchpoint() {
        let own = tp("own", ChannelType::Direct, 100 * 24 * 60);
        let path = build_path_from_touchpoints("s1", "v1", &abc(), at(100 * 24 * 60));
        let data = attribute(
            &path,
            &Conversion {
                at: at(100 * 24 * 60),
                value: 40.0,
                touchpoint: &own,
            },
            &AttributionModel::new(AttributionModelType::Linear),
        );
        assert_eq!(data.fallback, Some(FallbackReason::EmptyAfterLookback));
        assert_eq!(data.touchpoint_weights.len(), 1);
        assert_eq!(data.touchpoint_weights[0].touchpoint_id, "own");
        assert!((data.touchpoint_weights[0].attributed_value - 40.0).abs() < EPS);
    }

    #[test]
    fn custom_weights_and_confidence() {
        let mut model = AttributionModel::new(AttributionModelType::Custom);
        model.parameters.custom_weights.insert("email".to_string(), 2.0);
        model.parameters.confidence_threshold = 2;
        let data = run(&abc(), &model, 2000);
        let w = weights(&data);
        assert!((w[0] - 0.25).abs() < EPS);
        assert!((w[1] - 0.5).abs() < EPS);
        assert!((w[2] - 0.25).abs() < EPS);
        assert!((data.confidence - 0.5).abs() < EPS);
    }

    #[test]
    fn zero_custom_weights_fall_back_to_last_touch() {
        let mut model = AttributionModel::new(AttributionModelType::DataDriven);
        for channel in ["organic_search", "email", "paid_search"] {
            model.parameters.custom_weights.insert(channel.to_string(), 0.0);
        }
        let data = run(&abc(), &model, 2000);
        assert_eq!(data.fallback, Some(FallbackReason::ZeroCustomWeights));
        assert_eq!(weights(&data), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn unknown_model_name_degrades_to_last_touch() {
        let model: AttributionModel =
            serde_json::from_value(serde_json::json!({"model_type": "markov_chain"})).expect("parses");
        assert_eq!(model.model_type, AttributionModelType::Unrecognized);
        assert_eq!(model.lookback_window_days, 30);
        let data = run(&abc(), &model, 2000);
        assert_eq!(data.fallback, Some(FallbackReason::UnknownModel));
        assert_eq!(weights(&data), vec![0.0, 0.0, 1.0]);
        assert!(validate_model("model", &model).is_err());
    }

    #[test]
    fn attribution_is_deterministic() {
        for model in all_models() {
            let a = run(&abc(), &model, 4000);
            let b = run(&abc(), &model, 4000);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn compare_first_and_last_touch() {
        let touchpoints = abc();
        let conversion = AttributedConversion {
            path: build_path_from_touchpoints("s1", "v1", &touchpoints, at(2000)),
            linked_path: None,
            value: 100.0,
            at: at(2000),
            touchpoint: touchpoints[2].clone(),
        };
        let models = vec![
            ("first".to_string(), AttributionModel::new(AttributionModelType::FirstTouch)),
            ("last".to_string(), AttributionModel::new(AttributionModelType::LastTouch)),
        ];
        let report = compare_models(&[conversion], &models, 0);
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].attributed_conversions, report[1].attributed_conversions);
        assert!((report[0].attributed_value - report[1].attributed_value).abs() < EPS);
        assert!(report[0].is_baseline && !report[1].is_baseline);

        let organic = |r: &ModelComparison| {
            r.channels
                .iter()
                .find(|c| c.channel == ChannelType::OrganicSearch)
                .map(|c| c.value)
                .unwrap_or(0.0)
        };
        assert!((organic(&report[0]) - 100.0).abs() < EPS);
        assert!(organic(&report[1]).abs() < EPS);
        let delta = report[1]
            .channels
            .iter()
            .find(|c| c.channel == ChannelType::OrganicSearch)
            .map(|c| c.value_delta)
            .unwrap_or(0.0);
        assert!((delta + 100.0).abs() < EPS);
    }

    #[test]
    fn cross_device_models_credit_the_linked_path() {
        let phone = tp("social", ChannelType::Social, 0);
        let desktop = tp("email", ChannelType::Email, 60);
        let conversion = AttributedConversion {
            path: build_path_from_touchpoints("desktop", "v2", std::slice::from_ref(&desktop), at(90)),
            linked_path: Some(build_path_from_touchpoints(
                "desktop",
                "v2",
                &[phone, desktop.clone()],
                at(90),
            )),
            value: 80.0,
            at: at(90),
            touchpoint: desktop,
        };
        let mut linked = AttributionModel::new(AttributionModelType::Linear);
        linked.cross_device = true;
        let models = vec![
            ("session".to_string(), AttributionModel::new(AttributionModelType::Linear)),
            ("linked".to_string(), linked),
        ];
        let report = compare_models(&[conversion], &models, 0);
        let value_of = |r: &ModelComparison, channel: ChannelType| {
            r.channels
                .iter()
                .find(|c| c.channel == channel)
                .map(|c| c.value)
                .unwrap_or(0.0)
        };
        assert!((value_of(&report[0], ChannelType::Email) - 80.0).abs() < EPS);
        assert!(value_of(&report[0], ChannelType::Social).abs() < EPS);
        assert!((value_of(&report[1], ChannelType::Email) - 40.0).abs() < EPS);
        assert!((value_of(&report[1], ChannelType::Social) - 40.0).abs() < EPS);
    }

    #[test]
    fn validate_rejects_bad_parameters() {
        let mut model = AttributionModel::new(AttributionModelType::TimeDecay);
        model.parameters.half_life_days = -1.0;
        assert!(validate_model("m", &model).is_err());

        let mut model = AttributionModel::new(AttributionModelType::Custom);
        model.parameters.custom_weights.insert("fax".to_string(), 1.0);
        assert!(validate_model("m", &model).is_err());

        let mut model = AttributionModel::new(AttributionModelType::Linear);
        model.lookback_window_days = 0;
        assert!(validate_model("m", &model).is_err());

        assert!(validate_model("m", &AttributionModel::new(AttributionModelType::Linear)).is_ok());
    }
}
