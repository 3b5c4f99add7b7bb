use crate::error::WardenError;
use crate::model::{CaseId, CommunityId, IdentityId, RiskAssessment, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Initial,
    Analyzing,
    Approved,
    Quarantined,
    PendingAdmin,
    Kicked,
    Banned,
    Alerted,
    /// An action failed and a human has to sort it out
    Error,
}

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Approved | CaseState::Kicked | CaseState::Banned)
    }

    /// States that are waiting on a human decision
    pub fn awaits_review(&self) -> bool {
        matches!(
            self,
            CaseState::Quarantined | CaseState::PendingAdmin | CaseState::Alerted | CaseState::Error
        )
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseState::Initial => "INITIAL",
            CaseState::Analyzing => "ANALYZING",
            CaseState::Approved => "APPROVED",
            CaseState::Quarantined => "QUARANTINED",
            CaseState::PendingAdmin => "PENDING_ADMIN",
            CaseState::Kicked => "KICKED",
            CaseState::Banned => "BANNED",
            CaseState::Alerted => "ALERTED",
            CaseState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub actor_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reasons: Vec<String>,
}

pub const SYSTEM_ACTOR: &str = "system";
pub const TIMER_ACTOR: &str = "timer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationCase {
    pub case_id: CaseId,
    pub identity_id: IdentityId,
    pub community_id: CommunityId,
    pub state: CaseState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assessment: Option<RiskAssessment>,
    pub verdict: Option<Verdict>,
    pub pending_timer_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decision_history: Vec<DecisionRecord>,
    #[serde(default)]
    pub error: Option<String>,
}

impl VerificationCase {
    pub fn new(identity_id: &str, community_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            case_id: format!("{}-{}-{}", community_id, identity_id, at.timestamp_millis()),
            identity_id: identity_id.to_string(),
            community_id: community_id.to_string(),
            state: CaseState::Initial,
            created_at: at,
            updated_at: at,
            assessment: None,
            verdict: None,
            pending_timer_deadline: None,
            decision_history: Vec::new(),
            error: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Move to `next`, recording who did it. Terminal cases never change again.
    pub fn transition(
        &mut self,
        next: CaseState,
        actor_id: &str,
        action: &str,
        reasons: Vec<String>,
        at: DateTime<Utc>,
    ) -> Result<(), WardenError> {
        if self.state.is_terminal() {
            return Err(WardenError::TimerRaceLost(self.case_id.clone()));
        }
        log::debug!(
            "Case {}: {} -> {} ({} by {})",
            self.case_id,
            self.state,
            next,
            action,
            actor_id
        );
        self.state = next;
        self.updated_at = at;
        if next != CaseState::PendingAdmin {
            self.pending_timer_deadline = None;
        }
        self.decision_history.push(DecisionRecord {
            actor_id: actor_id.to_string(),
            action: action.to_string(),
            timestamp: at,
            reasons,
        });
        Ok(())
    }
}
