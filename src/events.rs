//! Newline-delimited JSON events accepted by the `join-warden` binary.

use crate::config::ConfigPatch;
use crate::error::{Result, WardenError};
use crate::model::{CommunityId, IdentityId, Identity, Membership};
use crate::pipeline::{JoinOutcome, Pipeline};
use crate::verification::{DecisionOutcome, DecisionType};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Join {
        identity: Identity,
        membership: Membership,
    },
    Decision {
        case_id: String,
        decision: DecisionType,
        actor_id: String,
    },
    Command {
        command: String,
        actor_id: String,
    },
    Flag {
        identity_id: IdentityId,
        reason: String,
        actor_id: String,
    },
    Unflag {
        identity_id: IdentityId,
    },
    Warn {
        community_id: CommunityId,
        identity_id: IdentityId,
    },
    ClearWarnings {
        community_id: CommunityId,
        identity_id: IdentityId,
    },
    Config {
        community_id: CommunityId,
        patch: ConfigPatch,
    },
}

pub fn parse_event(line: &str) -> Result<Event> {
    serde_json::from_str(line).map_err(|e| WardenError::InvalidCommand(format!("malformed event: {e}")))
}

fn report(outcome: &DecisionOutcome, case_id: &str, actor_id: &str) {
    match outcome {
        DecisionOutcome::Applied(state) => log::info!("Case {case_id} is now {state} ({actor_id})"),
        DecisionOutcome::AlreadyResolved(state) => {
            log::info!("Case {case_id} was already {state}, decision by {actor_id} ignored")
        }
        DecisionOutcome::Rejected(reason) => log::warn!("Decision on case {case_id} rejected: {reason}"),
        DecisionOutcome::Busy => log::warn!("Case {case_id} is busy, retry the decision"),
    }
}

pub async fn apply(pipeline: &Pipeline, event: Event) -> Result<()> {
    match event {
        Event::Join {
            identity,
            membership,
        } => match pipeline.on_identity_join(&identity, &membership).await? {
            JoinOutcome::Processed(case) => {
                log::info!(
                    "Join of {} in {} -> {} (case {})",
                    identity.id,
                    membership.community_id,
                    case.state,
                    case.case_id
                );
            }
            JoinOutcome::Duplicate => log::info!("Duplicate join of {} ignored", identity.id),
            JoinOutcome::Disabled => {
                log::info!("Vetting disabled in {}, join of {} ignored", membership.community_id, identity.id)
            }
        },
        Event::Decision {
            case_id,
            decision,
            actor_id,
        } => {
            let outcome = pipeline.on_admin_decision(&case_id, decision, &actor_id).await?;
            report(&outcome, &case_id, &actor_id);
        }
        Event::Command { command, actor_id } => {
            let outcome = pipeline.on_admin_command(&command, &actor_id).await?;
            report(&outcome, &command, &actor_id);
        }
        Event::Flag {
            identity_id,
            reason,
            actor_id,
        } => pipeline.set_global_flag(&identity_id, &reason, &actor_id)?,
        Event::Unflag { identity_id } => {
            if !pipeline.clear_global_flag(&identity_id)? {
                log::info!("{identity_id} was not flagged");
            }
        }
        Event::Warn {
            community_id,
            identity_id,
        } => {
            pipeline.add_warning(&community_id, &identity_id)?;
        }
        Event::ClearWarnings {
            community_id,
            identity_id,
        } => pipeline.clear_warnings(&community_id, &identity_id)?,
        Event::Config {
            community_id,
            patch,
        } => {
            pipeline.set_config(&community_id, &patch)?;
        }
    }
    Ok(())
}
