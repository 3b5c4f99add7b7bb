//! Policy Engine Component
//!
//! Maps an assessment to exactly one verdict using an ordered rule list. The
//! first rule that fires decides; later rules are not consulted. Operators can
//! always point at the single rule responsible for an outcome.

use crate::config::PolicyConfig;
use crate::model::{RiskAssessment, SignalSet, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    RecentAccount,
    MultiAccount,
    HighRisk,
    SuspiciousUsername,
    RaidPattern,
    Default,
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PolicyRule::RecentAccount => "recent_account",
            PolicyRule::MultiAccount => "multi_account",
            PolicyRule::HighRisk => "high_risk",
            PolicyRule::SuspiciousUsername => "suspicious_username",
            PolicyRule::RaidPattern => "raid_pattern",
            PolicyRule::Default => "default",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: Verdict,
    pub rule: PolicyRule,
    pub reasons: Vec<String>,
}

pub struct PolicyInput<'a> {
    pub signals: &'a SignalSet,
    pub assessment: &'a RiskAssessment,
    /// Aggregated multi-identity confidence, 0..=100
    pub multi_identity_confidence: u8,
}

pub struct PolicyEngine<'a> {
    config: &'a PolicyConfig,
}

impl<'a> PolicyEngine<'a> {
    pub fn new(config: &'a PolicyConfig) -> Self {
        Self { config }
    }

    pub fn decide(&self, input: &PolicyInput<'_>) -> PolicyDecision {
        let config = self.config;
        let signals = input.signals;

        if signals.age_days < config.minimum_account_age_days {
            return PolicyDecision {
                verdict: config.actions.recent_account,
                rule: PolicyRule::RecentAccount,
                reasons: vec![format!(
                    "account age {}d is below the {}d minimum",
                    signals.age_days, config.minimum_account_age_days
                )],
            };
        }

        if input.multi_identity_confidence >= config.multi_identity_threshold
            && !signals.multi_identity_matches.is_empty()
        {
            let mut reasons = vec![format!(
                "multi-identity confidence {} >= {}",
                input.multi_identity_confidence, config.multi_identity_threshold
            )];
            for m in &signals.multi_identity_matches {
                reasons.push(format!(
                    "resembles {} ({}%): {}",
                    m.candidate_id,
                    m.similarity,
                    m.reasons.join(", ")
                ));
            }
            return PolicyDecision {
                verdict: config.actions.multi_account,
                rule: PolicyRule::MultiAccount,
                reasons,
            };
        }

        let limit = config.effective_max_risk_score();
        if input.assessment.score > limit {
            let mut reasons = vec![format!(
                "risk score {} ({}) exceeds {}",
                input.assessment.score, input.assessment.level, limit
            )];
            reasons.extend(input.assessment.reasons.iter().cloned());
            return PolicyDecision {
                verdict: config.actions.high_risk,
                rule: PolicyRule::HighRisk,
                reasons,
            };
        }

        if signals.username_suspicious {
            let mut reasons = vec!["username flagged".to_string()];
            reasons.extend(signals.username_reasons.iter().cloned());
            return PolicyDecision {
                verdict: config.actions.suspicious_username,
                rule: PolicyRule::SuspiciousUsername,
                reasons,
            };
        }

        if signals.raid_suspected {
            let mut reasons = vec!["raid pattern detected".to_string()];
            reasons.extend(signals.raid_reasons.iter().cloned());
            return PolicyDecision {
                verdict: Verdict::AdminApproval,
                rule: PolicyRule::RaidPattern,
                reasons,
            };
        }

        PolicyDecision {
            verdict: Verdict::Approve,
            rule: PolicyRule::Default,
            reasons: vec![format!(
                "no rule triggered (score {}, {})",
                input.assessment.score, input.assessment.level
            )],
        }
    }
}
