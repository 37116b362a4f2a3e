use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Touchpoint;
use crate::session::VisitorSession;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub touchpoint: Touchpoint,
    pub step_number: u32,
    pub time_from_previous_ms: Option<i64>,
}

/// Ordered touchpoints leading up to a conversion. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionPath {
    pub session_id: String,
    pub visitor_id: String,
    pub steps: Vec<PathStep>,
    pub conversion_at: DateTime<Utc>,
}

impl ConversionPath {
    pub fn touchpoints(&self) -> impl Iterator<Item = &Touchpoint> {
        self.steps.iter().map(|s| &s.touchpoint)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Milliseconds from the first touchpoint to the conversion.
    pub fn time_to_convert_ms(&self) -> Option<i64> {
        self.steps
            .first()
            .map(|s| (self.conversion_at - s.touchpoint.timestamp).num_milliseconds())
    }
}

fn sort_touchpoints(touchpoints: &mut [Touchpoint]) {
    touchpoints.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

fn annotate(
    session_id: &str,
    visitor_id: &str,
    touchpoints: Vec<Touchpoint>,
    upto: DateTime<Utc>,
) -> ConversionPath {
    let mut previous: Option<DateTime<Utc>> = None;
    let steps = touchpoints
        .into_iter()
        .enumerate()
        .map(|(i, mut touchpoint)| {
            let time_from_previous_ms =
                previous.map(|p| (touchpoint.timestamp - p).num_milliseconds());
            previous = Some(touchpoint.timestamp);
            touchpoint.position = i as u32 + 1;
            PathStep {
                touchpoint,
                step_number: i as u32 + 1,
                time_from_previous_ms,
            }
        })
        .collect();

    ConversionPath {
        session_id: session_id.to_string(),
        visitor_id: visitor_id.to_string(),
        steps,
        conversion_at: upto,
    }
}

fn eligible(touchpoints: &[Touchpoint], upto: DateTime<Utc>, skip_id: Option<&str>) -> Vec<Touchpoint> {
    let mut eligible: Vec<Touchpoint> = touchpoints
        .iter()
        .filter(|t| t.timestamp <= upto && Some(t.id.as_str()) != skip_id)
        .cloned()
        .collect();
    sort_touchpoints(&mut eligible);
    eligible
}

/// Build a path from an arbitrary touchpoint list, keeping those at or before `upto`.
///
/// Positions are renumbered in path order.
pub fn build_path_from_touchpoints(
    session_id: &str,
    visitor_id: &str,
    touchpoints: &[Touchpoint],
    upto: DateTime<Utc>,
) -> ConversionPath {
    annotate(session_id, visitor_id, eligible(touchpoints, upto, None), upto)
}

/// Build the path credited for a conversion that arrived on `converting`.
///
/// Touchpoints are stored once per identity with their first sighting, so a
/// returning channel would otherwise sort ahead of everything seen since.
/// The converting touchpoint always closes the path, sighted at `upto`.
pub fn build_conversion_path(
    session_id: &str,
    visitor_id: &str,
    touchpoints: &[Touchpoint],
    converting: &Touchpoint,
    upto: DateTime<Utc>,
) -> ConversionPath {
    let mut path = eligible(touchpoints, upto, Some(&converting.id));
    let mut last = converting.clone();
    last.timestamp = upto;
    path.push(last);
    annotate(session_id, visitor_id, path, upto)
}

pub fn build_path(session: &VisitorSession, upto: DateTime<Utc>) -> ConversionPath {
    build_path_from_touchpoints(&session.id, &session.visitor_id, &session.touchpoints, upto)
}

pub fn build_session_conversion_path(
    session: &VisitorSession,
    converting: &Touchpoint,
    upto: DateTime<Utc>,
) -> ConversionPath {
    build_conversion_path(
        &session.id,
        &session.visitor_id,
        &session.touchpoints,
        converting,
        upto,
    )
}

/// Union of the sessions' touchpoints by id, in path order.
///
/// When the same id shows up on several sessions the earliest sighting wins.
pub fn merge_touchpoints(sessions: &[VisitorSession]) -> Vec<Touchpoint> {
    let mut by_id: BTreeMap<&str, &Touchpoint> = BTreeMap::new();
    for touchpoint in sessions.iter().flat_map(|s| s.touchpoints.iter()) {
        by_id
            .entry(touchpoint.id.as_str())
            .and_modify(|existing| {
                if touchpoint.timestamp < existing.timestamp {
                    *existing = touchpoint;
                }
            })
            .or_insert(touchpoint);
    }
    let mut merged: Vec<Touchpoint> = by_id.into_values().cloned().collect();
    sort_touchpoints(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelType;

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

    fn session(id: &str, touchpoints: Vec<Touchpoint>) -> VisitorSession {
        let mut s = VisitorSession::start(id, "f1", "v1", None, "desktop", at(0));
        for t in touchpoints {
            s.append_touchpoint(t);
        }
        s
    }

    #[test]
    fn path_is_ordered_and_annotated() {
        let s = session(
            "s1",
            vec![
                tp("b", ChannelType::Email, 10),
                tp("a", ChannelType::OrganicSearch, 0),
                tp("c", ChannelType::Direct, 30),
            ],
        );
        let path = build_path(&s, at(20));
        let ids: Vec<&str> = path.touchpoints().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(path.steps[0].step_number, 1);
        assert_eq!(path.steps[0].time_from_previous_ms, None);
        assert_eq!(path.steps[1].time_from_previous_ms, Some(10 * 60 * 1000));
        assert_eq!(path.time_to_convert_ms(), Some(20 * 60 * 1000));
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let s = session(
            "s1",
            vec![tp("z", ChannelType::Email, 5), tp("m", ChannelType::Social, 5)],
        );
        let first = build_path(&s, at(10));
        let second = build_path(&s, at(10));
        assert_eq!(first, second);
        assert_eq!(first.steps[0].touchpoint.id, "m");
    }

    #[test]
    fn merge_deduplicates_across_sessions() {
        let phone = session(
            "s1",
            vec![tp("shared", ChannelType::Email, 3), tp("a", ChannelType::Social, 1)],
        );
        let laptop = session(
            "s2",
            vec![tp("shared", ChannelType::Email, 2), tp("b", ChannelType::Direct, 4)],
        );
        let merged = merge_touchpoints(&[phone, laptop]);
        let ids: Vec<&str> = merged.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "shared", "b"]);
        assert_eq!(merged[1].timestamp, at(2));
    }

    #[test]
    fn positions_follow_path_order() {
        let s = session(
            "s1",
            vec![tp("late", ChannelType::Email, 10), tp("early", ChannelType::Social, 2)],
        );
        assert_eq!(s.touchpoints[0].position, 1);

        let path = build_path(&s, at(20));
        let positions: Vec<(&str, u32)> = path
            .touchpoints()
            .map(|t| (t.id.as_str(), t.position))
            .collect();
        assert_eq!(positions, vec![("early", 1), ("late", 2)]);
    }

    #[test]
    fn returning_channel_closes_the_conversion_path() {
        let mut s = session(
            "s1",
            vec![tp("organic", ChannelType::OrganicSearch, 0), tp("email", ChannelType::Email, 5)],
        );
        let converting = s.append_touchpoint(tp("organic", ChannelType::OrganicSearch, 10));
        assert_eq!(converting.timestamp, at(0));

        let path = build_session_conversion_path(&s, &converting, at(10));
        let ids: Vec<&str> = path.touchpoints().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["email", "organic"]);
        let last = &path.steps[1];
        assert_eq!(last.touchpoint.timestamp, at(10));
        assert_eq!(last.touchpoint.position, 2);
        assert_eq!(last.time_from_previous_ms, Some(5 * 60 * 1000));
    }

    #[test]
    fn conversion_path_without_prior_touchpoints_is_the_converting_one() {
        let s = session("s1", vec![]);
        let converting = tp("direct", ChannelType::Direct, 3);
        let path = build_session_conversion_path(&s, &converting, at(3));
        assert_eq!(path.len(), 1);
        assert_eq!(path.steps[0].touchpoint.id, "direct");
        assert_eq!(path.time_to_convert_ms(), Some(0));
    }
}
