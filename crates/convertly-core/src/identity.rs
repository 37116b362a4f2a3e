//! Cross-device identity resolution.
//!
//! Sessions are linked pairwise by an [`IdentityResolver`]; a profile is the
//! transitive closure of links from one anchor session. Profiles are derived
//! on demand and never stored.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::Touchpoint;
use crate::path::merge_touchpoints;
use crate::session::VisitorSession;

/// Why two sessions are considered the same person. Ordered by strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEvidence {
    AuthenticatedUser,
    CookieSync,
}

pub trait IdentityResolver: Send + Sync {
    fn link(&self, a: &VisitorSession, b: &VisitorSession) -> Option<LinkEvidence>;
}

/// Links on an authenticated user id, else on a shared cookie-sync id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeterministicResolver;

fn same(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if !x.is_empty() && x == y)
}

impl IdentityResolver for DeterministicResolver {
    fn link(&self, a: &VisitorSession, b: &VisitorSession) -> Option<LinkEvidence> {
        if same(a.user_id.as_deref(), b.user_id.as_deref()) {
            return Some(LinkEvidence::AuthenticatedUser);
        }
        // Two different authenticated users are never merged by a weaker signal.
        if a.user_id.is_some() && b.user_id.is_some() {
            return None;
        }
        if same(a.sync_id.as_deref(), b.sync_id.as_deref()) {
            return Some(LinkEvidence::CookieSync);
        }
        None
    }
}

fn known_user(session: &VisitorSession) -> Option<&str> {
    session.user_id.as_deref().filter(|u| !u.is_empty())
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossDeviceProfile {
    pub id: String,
    pub visitor_ids: BTreeSet<String>,
    pub device_ids: BTreeSet<String>,
    pub session_ids: BTreeSet<String>,
    pub link_evidence: BTreeSet<LinkEvidence>,
    pub touchpoints: Vec<Touchpoint>,
    pub total_conversions: u64,
    pub total_value: f64,
}

fn profile_id(session_ids: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for id in session_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"|");
    }
    let hash = hasher.finalize();
    format!("xdp_{}", hex::encode(&hash[..8]))
}

/// Build the profile reachable from `anchor` through resolver links.
///
/// A profile holds at most one authenticated user: a candidate whose user id
/// differs from one already in the profile is never added, even when it links
/// through an anonymous member. Candidates are visited in id order so the
/// result does not depend on how the store listed them. A session in
/// `candidates` with the anchor's id is ignored.
pub fn resolve_profile(
    resolver: &dyn IdentityResolver,
    anchor: &VisitorSession,
    candidates: &[VisitorSession],
) -> CrossDeviceProfile {
    let mut members: Vec<VisitorSession> = vec![anchor.clone()];
    let mut user_id: Option<&str> = known_user(anchor);
    let mut evidence = BTreeSet::new();
    let mut remaining: Vec<&VisitorSession> = candidates.iter().filter(|c| c.id != anchor.id).collect();
    remaining.sort_by(|a, b| a.id.cmp(&b.id));
    let mut frontier: VecDeque<&VisitorSession> = VecDeque::from([anchor]);

    while let Some(current) = frontier.pop_front() {
        let mut unlinked = Vec::with_capacity(remaining.len());
        for candidate in remaining {
            let candidate_user = known_user(candidate);
            let conflicts = matches!((user_id, candidate_user), (Some(u), Some(c)) if u != c);
            match resolver.link(current, candidate) {
                Some(found) if !conflicts => {
                    evidence.insert(found);
                    user_id = user_id.or(candidate_user);
                    members.push(candidate.clone());
                    frontier.push_back(candidate);
                }
                _ => unlinked.push(candidate),
            }
        }
        remaining = unlinked;
    }

    let session_ids: BTreeSet<String> = members.iter().map(|s| s.id.clone()).collect();
    CrossDeviceProfile {
        id: profile_id(&session_ids),
        visitor_ids: members.iter().map(|s| s.visitor_id.clone()).collect(),
        device_ids: members.iter().map(|s| s.device_id.clone()).collect(),
        link_evidence: evidence,
        touchpoints: merge_touchpoints(&members),
        total_conversions: members.iter().filter(|s| s.converted).count() as u64,
        total_value: members.iter().map(|s| s.conversion_value).sum(),
        session_ids,
    }
}
