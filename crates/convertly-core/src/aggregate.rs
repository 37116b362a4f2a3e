//! Funnel analytics and conversion path analysis.
//!
//! Both entry points are pure over their inputs. Grouping goes through
//! ordered maps and every sort has a total tie-break, so recomputing over
//! the same events yields the same report.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attribution::AttributedConversion;
use crate::event::{ChannelType, ConversionEvent};
use crate::funnel::ConversionFunnel;
use crate::goals::matches_step_conditions;
use crate::store::TimeRange;

const NO_CAMPAIGN: &str = "(none)";

#[derive(Debug, Clone, Serialize)]
pub struct StepMetric {
    pub step_id: String,
    pub name: String,
    pub order: u32,
    pub visitors: u64,
    /// Share of all visitors in range that reached this step.
    pub reach_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DropOffPoint {
    pub from_step: String,
    pub to_step: String,
    pub from_order: u32,
    pub from_visitors: u64,
    pub to_visitors: u64,
    pub drop_off_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakdownEntry {
    pub key: String,
    /// Fractional conversions credited to this key.
    pub conversions: f64,
    pub value: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttributionBreakdown {
    pub by_channel: Vec<BreakdownEntry>,
    pub by_campaign: Vec<BreakdownEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceMetrics {
    pub device_type: String,
    pub visitors: u64,
    pub converting_visitors: u64,
    pub conversions: u64,
    pub value: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelPerformance {
    pub source: String,
    pub exposed_visitors: u64,
    pub converting_visitors: u64,
    pub attributed_conversions: f64,
    pub attributed_value: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelAnalytics {
    pub funnel_id: String,
    pub range: Option<TimeRange>,
    pub total_visitors: u64,
    pub converting_visitors: u64,
    pub total_conversions: u64,
    pub total_value: f64,
    pub conversion_rate: f64,
    pub average_time_to_convert_ms: Option<f64>,
    pub step_metrics: Vec<StepMetric>,
    pub drop_off_points: Vec<DropOffPoint>,
    pub attribution_breakdown: AttributionBreakdown,
    pub device_breakdown: Vec<DeviceMetrics>,
    pub channel_performance: Vec<ChannelPerformance>,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Value credited for a conversion event: the sum of its attributed values,
/// or the raw event value when it carries no attribution.
pub fn conversion_value(event: &ConversionEvent) -> f64 {
    match &event.attribution {
        Some(data) if !data.touchpoint_weights.is_empty() => data
            .touchpoint_weights
            .iter()
            .map(|w| w.attributed_value)
            .sum(),
        _ => event.value,
    }
}

#[derive(Default)]
struct Credit {
    conversions: f64,
    value: f64,
}

fn breakdown(
    credits: BTreeMap<String, Credit>,
    total_value: f64,
    total_conversions: f64,
) -> Vec<BreakdownEntry> {
    let mut entries: Vec<BreakdownEntry> = credits
        .into_iter()
        .map(|(key, credit)| {
            let percentage = if total_value > 0.0 {
                ratio(credit.value, total_value) * 100.0
            } else {
                ratio(credit.conversions, total_conversions) * 100.0
            };
            BreakdownEntry {
                key,
                conversions: credit.conversions,
                value: credit.value,
                percentage,
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        b.value
            .total_cmp(&a.value)
            .then_with(|| b.conversions.total_cmp(&a.conversions))
            .then_with(|| a.key.cmp(&b.key))
    });
    entries
}

fn step_metrics(funnel: &ConversionFunnel, events: &[ConversionEvent], total_visitors: u64) -> Vec<StepMetric> {
    funnel
        .steps
        .iter()
        .map(|step| {
            let visitors: BTreeSet<&str> = events
                .iter()
                .filter(|e| matches_step_conditions(e, step))
                .map(|e| e.visitor_id.as_str())
                .collect();
            StepMetric {
                step_id: step.id.clone(),
                name: step.name.clone(),
                order: step.order,
                visitors: visitors.len() as u64,
                reach_rate: ratio(visitors.len() as f64, total_visitors as f64),
            }
        })
        .collect()
}

fn drop_off_points(steps: &[StepMetric]) -> Vec<DropOffPoint> {
    steps
        .windows(2)
        .filter(|pair| pair[0].visitors > 0 && pair[0].visitors > pair[1].visitors)
        .map(|pair| DropOffPoint {
            from_step: pair[0].name.clone(),
            to_step: pair[1].name.clone(),
            from_order: pair[0].order,
            from_visitors: pair[0].visitors,
            to_visitors: pair[1].visitors,
            drop_off_rate: (pair[0].visitors - pair[1].visitors) as f64 / pair[0].visitors as f64,
        })
        .collect()
}

fn average_time_to_convert(events: &[ConversionEvent]) -> Option<f64> {
    let mut first_seen: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    for event in events {
        first_seen
            .entry(event.visitor_id.as_str())
            .and_modify(|t| {
                if event.timestamp < *t {
                    *t = event.timestamp;
                }
            })
            .or_insert(event.timestamp);
    }
    let durations: Vec<f64> = events
        .iter()
        .filter(|e| e.is_conversion)
        .filter_map(|e| {
            first_seen
                .get(e.visitor_id.as_str())
                .map(|first| (e.timestamp - *first).num_milliseconds() as f64)
        })
        .collect();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<f64>() / durations.len() as f64)
}

#[derive(Default)]
struct DeviceAcc<'a> {
    visitors: BTreeSet<&'a str>,
    converting: BTreeSet<&'a str>,
    conversions: u64,
    value: f64,
}

fn device_breakdown(events: &[ConversionEvent]) -> Vec<DeviceMetrics> {
    let mut by_device: BTreeMap<&str, DeviceAcc<'_>> = BTreeMap::new();
    for event in events {
        let acc = by_device.entry(event.device_type.as_str()).or_default();
        acc.visitors.insert(event.visitor_id.as_str());
        if event.is_conversion {
            acc.converting.insert(event.visitor_id.as_str());
            acc.conversions += 1;
            acc.value += conversion_value(event);
        }
    }
    by_device
        .into_iter()
        .map(|(device, acc)| DeviceMetrics {
            device_type: device.to_string(),
            visitors: acc.visitors.len() as u64,
            converting_visitors: acc.converting.len() as u64,
            conversions: acc.conversions,
            value: acc.value,
            conversion_rate: ratio(acc.converting.len() as f64, acc.visitors.len() as f64),
        })
        .collect()
}

#[derive(Default)]
struct SourceAcc<'a> {
    exposed: BTreeSet<&'a str>,
    conversions: f64,
    value: f64,
}

fn channel_performance(events: &[ConversionEvent], converting: &BTreeSet<&str>) -> Vec<ChannelPerformance> {
    let mut by_source: BTreeMap<&str, SourceAcc<'_>> = BTreeMap::new();
    for event in events {
        by_source
            .entry(event.touchpoint.source.as_str())
            .or_default()
            .exposed
            .insert(event.visitor_id.as_str());
        if let Some(data) = event.attribution.as_ref().filter(|_| event.is_conversion) {
            for w in &data.touchpoint_weights {
                let acc = by_source.entry(w.source.as_str()).or_default();
                acc.conversions += w.weight;
                acc.value += w.attributed_value;
            }
        }
    }
    let mut rows: Vec<ChannelPerformance> = by_source
        .into_iter()
        .map(|(source, acc)| {
            let converting_visitors = acc.exposed.iter().filter(|v| converting.contains(*v)).count();
            ChannelPerformance {
                source: source.to_string(),
                exposed_visitors: acc.exposed.len() as u64,
                converting_visitors: converting_visitors as u64,
                attributed_conversions: acc.conversions,
                attributed_value: acc.value,
                conversion_rate: ratio(converting_visitors as f64, acc.exposed.len() as f64),
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        b.attributed_value
            .total_cmp(&a.attributed_value)
            .then_with(|| a.source.cmp(&b.source))
    });
    rows
}

/// Roll up the funnel's events (already restricted to `range`) into a report.
pub fn aggregate(
    funnel: &ConversionFunnel,
    events: &[ConversionEvent],
    range: Option<TimeRange>,
) -> FunnelAnalytics {
    let visitors: BTreeSet<&str> = events.iter().map(|e| e.visitor_id.as_str()).collect();
    let converting: BTreeSet<&str> = events
        .iter()
        .filter(|e| e.is_conversion)
        .map(|e| e.visitor_id.as_str())
        .collect();
    let conversions: Vec<&ConversionEvent> = events.iter().filter(|e| e.is_conversion).collect();
    let total_value: f64 = conversions.iter().map(|e| conversion_value(e)).sum();

    let mut by_channel: BTreeMap<String, Credit> = BTreeMap::new();
    let mut by_campaign: BTreeMap<String, Credit> = BTreeMap::new();
    for event in &conversions {
        let mut credit = |channel: ChannelType, campaign: Option<&str>, weight: f64, value: f64| {
            let c = by_channel.entry(channel.as_str().to_string()).or_default();
            c.conversions += weight;
            c.value += value;
            let c = by_campaign
                .entry(campaign.unwrap_or(NO_CAMPAIGN).to_string())
                .or_default();
            c.conversions += weight;
            c.value += value;
        };
        match &event.attribution {
            Some(data) if !data.touchpoint_weights.is_empty() => {
                for w in &data.touchpoint_weights {
                    credit(w.channel, w.campaign.as_deref(), w.weight, w.attributed_value);
                }
            }
            _ => credit(
                event.touchpoint.channel,
                event.touchpoint.campaign.as_deref(),
                1.0,
                event.value,
            ),
        }
    }

    let total_visitors = visitors.len() as u64;
    let steps = step_metrics(funnel, events, total_visitors);
    let drop_offs = drop_off_points(&steps);

    FunnelAnalytics {
        funnel_id: funnel.id.clone(),
        range,
        total_visitors,
        converting_visitors: converting.len() as u64,
        total_conversions: conversions.len() as u64,
        total_value,
        conversion_rate: ratio(converting.len() as f64, total_visitors as f64),
        average_time_to_convert_ms: average_time_to_convert(events),
        step_metrics: steps,
        drop_off_points: drop_offs,
        attribution_breakdown: AttributionBreakdown {
            by_channel: breakdown(by_channel, total_value, conversions.len() as f64),
            by_campaign: breakdown(by_campaign, total_value, conversions.len() as f64),
        },
        device_breakdown: device_breakdown(events),
        channel_performance: channel_performance(events, &converting),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathPattern {
    pub signature: Vec<ChannelType>,
    /// `signature` joined with `" > "`.
    pub signature_key: String,
    /// Distinct sessions that converted through this channel sequence.
    pub frequency: u64,
    pub conversions: u64,
    pub total_value: f64,
    pub average_value: f64,
    pub average_length: f64,
    pub average_time_to_convert_ms: Option<f64>,
}

#[derive(Default)]
struct PatternAcc<'a> {
    sessions: BTreeSet<&'a str>,
    conversions: u64,
    value: f64,
    length: u64,
    times: Vec<f64>,
}

/// Group conversion paths by channel sequence, keeping patterns seen in at
/// least `min_frequency` sessions. Most frequent first.
pub fn analyze_paths(conversions: &[AttributedConversion], min_frequency: u64) -> Vec<PathPattern> {
    let mut groups: BTreeMap<Vec<ChannelType>, PatternAcc<'_>> = BTreeMap::new();
    for c in conversions {
        let mut signature: Vec<ChannelType> = c.path.touchpoints().map(|t| t.channel).collect();
        if signature.is_empty() {
            signature.push(c.touchpoint.channel);
        }
        let length = signature.len() as u64;
        let acc = groups.entry(signature).or_default();
        acc.sessions.insert(c.path.session_id.as_str());
        acc.conversions += 1;
        acc.value += c.value;
        acc.length += length;
        if let Some(ms) = c.path.time_to_convert_ms() {
            acc.times.push(ms as f64);
        }
    }

    let mut patterns: Vec<PathPattern> = groups
        .into_iter()
        .filter(|(_, acc)| acc.sessions.len() as u64 >= min_frequency)
        .map(|(signature, acc)| {
            let signature_key = signature
                .iter()
                .map(ChannelType::as_str)
                .collect::<Vec<_>>()
                .join(" > ");
            let n = acc.conversions as f64;
            PathPattern {
                signature_key,
                signature,
                frequency: acc.sessions.len() as u64,
                conversions: acc.conversions,
                total_value: acc.value,
                average_value: ratio(acc.value, n),
                average_length: ratio(acc.length as f64, n),
                average_time_to_convert_ms: if acc.times.is_empty() {
                    None
                } else {
                    Some(acc.times.iter().sum::<f64>() / acc.times.len() as f64)
                },
            }
        })
        .collect();
    patterns.sort_by(|a, b| {
        b.frequency
            .cmp(&a.frequency)
            .then_with(|| a.signature_key.cmp(&b.signature_key))
    });
    patterns
}
