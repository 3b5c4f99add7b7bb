//! Core data types shared by the collector, scorer, policy engine and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type IdentityId = String;
pub type CommunityId = String;
pub type RoleId = String;
pub type CaseId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub has_custom_avatar: bool,
    /// Perceptual or content hash of the avatar, when the platform exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_hash: Option<String>,
    pub username: String,
    #[serde(default)]
    pub is_automated: bool,
}

impl Identity {
    /// Whole days between account creation and `at`. Clock skew clamps to zero.
    pub fn age_days(&self, at: DateTime<Utc>) -> u32 {
        let days = (at - self.created_at).num_days();
        if days < 0 {
            0
        } else {
            days as u32
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub identity_id: IdentityId,
    pub community_id: CommunityId,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub roles: BTreeSet<RoleId>,
}

impl Membership {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalFlag {
    pub reason: String,
    pub actor_id: String,
    pub flagged_at: DateTime<Utc>,
}

/// A previously seen identity that looks like the same person as the candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub candidate_id: IdentityId,
    /// 0..=100
    pub similarity: u8,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSet {
    pub age_days: u32,
    pub has_avatar: bool,
    pub role_count: usize,
    pub warnings_count: u32,
    pub global_flag: Option<GlobalFlag>,
    pub cross_community_ban_count: u32,
    pub username_suspicious: bool,
    #[serde(default)]
    pub username_reasons: Vec<String>,
    #[serde(default)]
    pub multi_identity_matches: Vec<IdentityMatch>,
    #[serde(default)]
    pub raid_suspected: bool,
    #[serde(default)]
    pub raid_reasons: Vec<String>,
    #[serde(default)]
    pub is_automated: bool,
    /// Probes that failed or timed out and were replaced by their neutral value
    #[serde(default)]
    pub degraded: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

impl SignalSet {
    /// Neutral evidence for an identity: nothing known against it.
    pub fn neutral(identity: &Identity, membership: &Membership, at: DateTime<Utc>) -> Self {
        Self {
            age_days: identity.age_days(at),
            has_avatar: identity.has_custom_avatar,
            role_count: membership.roles.len(),
            warnings_count: 0,
            global_flag: None,
            cross_community_ban_count: 0,
            username_suspicious: false,
            username_reasons: Vec::new(),
            multi_identity_matches: Vec::new(),
            raid_suspected: false,
            raid_reasons: Vec::new(),
            is_automated: identity.is_automated,
            degraded: Vec::new(),
            collected_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u32,
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl RiskAssessment {
    /// Assessment recorded for exempt identities, which are never scored.
    pub fn exempt(reason: String, at: DateTime<Utc>) -> Self {
        Self {
            score: 0,
            level: RiskLevel::Low,
            reasons: vec![reason],
            computed_at: at,
        }
    }
}

/// Outcome selected by the policy engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Quarantine,
    AdminApproval,
    Kick,
    Ban,
    Alert,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Approve => "approve",
            Verdict::Quarantine => "quarantine",
            Verdict::AdminApproval => "admin_approval",
            Verdict::Kick => "kick",
            Verdict::Ban => "ban",
            Verdict::Alert => "alert",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_age_days() {
        let now = Utc::now();
        let identity = Identity {
            id: "u1".to_string(),
            created_at: now - Duration::days(3) - Duration::hours(5),
            has_custom_avatar: false,
            avatar_hash: None,
            username: "someone".to_string(),
            is_automated: false,
        };
        assert_eq!(identity.age_days(now), 3);

        // Creation timestamp in the future counts as brand new
        let skewed = Identity {
            created_at: now + Duration::hours(2),
            ..identity
        };
        assert_eq!(skewed.age_days(now), 0);
    }

    #[test]
    fn test_verdict_serde_names() {
        let json = serde_json::to_string(&Verdict::AdminApproval).unwrap();
        assert_eq!(json, "\"admin_approval\"");
        let parsed: RiskLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(parsed, RiskLevel::Critical);
    }
}
