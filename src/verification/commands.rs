//! Admin quick-action commands.
//!
//! Notices carry commands as plain strings (`warden:<decision>:<case_id>`) so
//! any front end can round-trip them without knowing our types. Dispatch goes
//! through [`CommandTable`], keyed by decision type and checked against the
//! case's current state.

use super::state::CaseState;
use crate::error::WardenError;
use crate::model::CaseId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const COMMAND_PREFIX: &str = "warden";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Approve,
    Kick,
    Ban,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Approve => "approve",
            DecisionType::Kick => "kick",
            DecisionType::Ban => "ban",
        }
    }

    /// State a case lands in once this decision has been carried out
    pub fn target_state(&self) -> CaseState {
        match self {
            DecisionType::Approve => CaseState::Approved,
            DecisionType::Kick => CaseState::Kicked,
            DecisionType::Ban => CaseState::Banned,
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" => Ok(DecisionType::Approve),
            "kick" => Ok(DecisionType::Kick),
            "ban" => Ok(DecisionType::Ban),
            other => Err(WardenError::InvalidCommand(format!(
                "unknown decision '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub case_id: CaseId,
    pub decision: DecisionType,
}

impl AdminCommand {
    pub fn new(case_id: &str, decision: DecisionType) -> Self {
        Self {
            case_id: case_id.to_string(),
            decision,
        }
    }

    pub fn encode(&self) -> String {
        format!("{COMMAND_PREFIX}:{}:{}", self.decision, self.case_id)
    }

    /// Case ids may themselves contain ':' so only the first two separators count.
    pub fn decode(encoded: &str) -> Result<Self, WardenError> {
        let mut parts = encoded.trim().splitn(3, ':');
        let prefix = parts.next().unwrap_or_default();
        if prefix != COMMAND_PREFIX {
            return Err(WardenError::InvalidCommand(format!(
                "'{encoded}' is not a {COMMAND_PREFIX} command"
            )));
        }
        let decision: DecisionType = parts
            .next()
            .ok_or_else(|| WardenError::InvalidCommand(format!("'{encoded}' has no decision")))?
            .parse()?;
        let case_id = parts.next().unwrap_or_default();
        if case_id.is_empty() {
            return Err(WardenError::InvalidCommand(format!(
                "'{encoded}' has no case id"
            )));
        }
        Ok(Self::new(case_id, decision))
    }

    /// The three quick actions offered on every review notice
    pub fn quick_actions(case_id: &str) -> Vec<String> {
        [DecisionType::Approve, DecisionType::Kick, DecisionType::Ban]
            .into_iter()
            .map(|d| AdminCommand::new(case_id, d).encode())
            .collect()
    }
}

/// What the command table says about a decision against a case in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The case already reached a terminal state; acknowledge and do nothing
    AlreadyResolved,
    Rejected,
}

struct CommandEntry {
    decision: DecisionType,
    from: &'static [CaseState],
}

const REVIEW_STATES: &[CaseState] = &[
    CaseState::Quarantined,
    CaseState::PendingAdmin,
    CaseState::Alerted,
    CaseState::Error,
];

const COMMAND_TABLE: &[CommandEntry] = &[
    CommandEntry {
        decision: DecisionType::Approve,
        from: REVIEW_STATES,
    },
    CommandEntry {
        decision: DecisionType::Kick,
        from: REVIEW_STATES,
    },
    CommandEntry {
        decision: DecisionType::Ban,
        from: REVIEW_STATES,
    },
];

pub struct CommandTable;

impl CommandTable {
    pub fn admit(decision: DecisionType, state: CaseState) -> Admission {
        if state.is_terminal() {
            return Admission::AlreadyResolved;
        }
        let allowed = COMMAND_TABLE
            .iter()
            .find(|entry| entry.decision == decision)
            .map(|entry| entry.from.contains(&state))
            .unwrap_or(false);
        if allowed {
            Admission::Allowed
        } else {
            Admission::Rejected
        }
    }
}
