//! Join-burst tracking per community.

use crate::config::{RaidRules, MAX_RAID_WINDOW_SECONDS};
use crate::model::CommunityId;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaidObservation {
    pub suspected: bool,
    pub reasons: Vec<String>,
}

#[derive(Default)]
pub struct RaidMonitor {
    joins: Mutex<HashMap<CommunityId, VecDeque<DateTime<Utc>>>>,
}

impl RaidMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join at `at` and report whether the community is seeing a burst.
    pub fn observe(&self, community: &str, at: DateTime<Utc>, rules: &RaidRules) -> RaidObservation {
        if !rules.enabled {
            return RaidObservation::default();
        }
        let window = Duration::seconds(rules.window_seconds.clamp(0, MAX_RAID_WINDOW_SECONDS));

        let mut joins = match self.joins.lock() {
            Ok(j) => j,
            Err(poisoned) => poisoned.into_inner(),
        };
        let recent = joins.entry(community.to_string()).or_default();
        recent.push_back(at);
        while let Some(oldest) = recent.front() {
            if at - *oldest > window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() >= rules.join_threshold {
            log::warn!(
                "Join burst in {community}: {} joins within {}s",
                recent.len(),
                rules.window_seconds
            );
            RaidObservation {
                suspected: true,
                reasons: vec![format!(
                    "{} joins within {}s (threshold {})",
                    recent.len(),
                    rules.window_seconds,
                    rules.join_threshold
                )],
            }
        } else {
            RaidObservation::default()
        }
    }
}
