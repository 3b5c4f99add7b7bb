//! Risk Scorer Component
//!
//! Turns a signal set into a numeric score and risk level. The score is the
//! sum of per-category contributions; count-based categories are capped
//! before weighting so one noisy signal cannot dominate.

use crate::config::PolicyConfig;
use crate::model::{RiskAssessment, RiskLevel, SignalSet};

pub struct RiskScorer;

impl RiskScorer {
    /// Pure: the same signals and config always give the same assessment.
    pub fn score(signals: &SignalSet, config: &PolicyConfig) -> RiskAssessment {
        let weights = &config.weights;
        let caps = &config.caps;
        let mut total = 0u32;
        let mut reasons = Vec::new();

        let mut add_flag = |present: bool, weight: u32, label: String| {
            if present && weight > 0 {
                total = total.saturating_add(weight);
                reasons.push(format!("{label} (+{weight})"));
            }
        };

        add_flag(
            signals.age_days < config.minimum_account_age_days,
            weights.new_account,
            format!(
                "account is {}d old, minimum {}d",
                signals.age_days, config.minimum_account_age_days
            ),
        );
        add_flag(!signals.has_avatar, weights.no_avatar, "no custom avatar".to_string());
        add_flag(
            signals.global_flag.is_some(),
            weights.global_flag,
            match &signals.global_flag {
                Some(flag) => format!("globally flagged: {}", flag.reason),
                None => String::new(),
            },
        );
        add_flag(
            signals.username_suspicious,
            weights.suspicious_username,
            "suspicious username".to_string(),
        );
        add_flag(signals.raid_suspected, weights.raid, "joined during a join burst".to_string());

        let mut add_count = |count: u32, cap: u32, weight: u32, label: &str| {
            if count == 0 || weight == 0 {
                return;
            }
            let counted = count.min(cap);
            let points = weight.saturating_mul(counted);
            total = total.saturating_add(points);
            if count > cap {
                reasons.push(format!("{count} {label}, capped at {cap} (+{points})"));
            } else {
                reasons.push(format!("{count} {label} (+{points})"));
            }
        };

        add_count(signals.warnings_count, caps.warnings, weights.warnings, "prior warning(s)");
        add_count(
            signals.cross_community_ban_count,
            caps.cross_community_bans,
            weights.cross_community_bans,
            "ban(s) in other communities",
        );
        add_count(
            signals.multi_identity_matches.len() as u32,
            caps.similar_identities,
            weights.similar_identities,
            "similar identit(y/ies)",
        );

        RiskAssessment {
            score: total,
            level: Self::level_for(total, config),
            reasons,
            computed_at: signals.collected_at,
        }
    }

    pub fn level_for(score: u32, config: &PolicyConfig) -> RiskLevel {
        let t = &config.thresholds;
        match score {
            s if s >= t.critical => RiskLevel::Critical,
            s if s >= t.high => RiskLevel::High,
            s if s >= t.medium => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}
