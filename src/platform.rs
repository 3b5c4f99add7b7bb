//! Interfaces to the hosting platform: notifications and membership actions.
//!
//! The pipeline never renders messages or talks to a platform API itself; it
//! hands a [`NoticeSpec`] or [`MembershipAction`] to these collaborators.

use crate::error::WardenError;
use crate::model::{CaseId, IdentityId, Membership, RiskLevel, RoleId};
use crate::store::{read_json, write_json};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipAction {
    GrantRole { role_id: RoleId },
    RemoveRole { role_id: RoleId },
    Kick { reason: String },
    Ban { reason: String },
}

impl MembershipAction {
    pub fn name(&self) -> &'static str {
        match self {
            MembershipAction::GrantRole { .. } => "grant_role",
            MembershipAction::RemoveRole { .. } => "remove_role",
            MembershipAction::Kick { .. } => "kick",
            MembershipAction::Ban { .. } => "ban",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Audience {
    Admins { channel: Option<String> },
    Member { identity_id: IdentityId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Quarantined,
    ApprovalRequested,
    Alert,
    Removed,
    Resolved,
    TimedOut,
    ActionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub identity_id: IdentityId,
    pub username: String,
    pub age_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeSpec {
    pub audience: Audience,
    pub kind: NoticeKind,
    pub case_id: CaseId,
    pub message: String,
    pub identity: Option<IdentitySummary>,
    pub score: Option<u32>,
    pub level: Option<RiskLevel>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Encoded admin commands offered as one-click controls
    #[serde(default)]
    pub quick_actions: Vec<String>,
}

impl NoticeSpec {
    /// Generic notice for the affected member. Never carries the score or the
    /// reasons behind it.
    pub fn member(identity_id: &str, case_id: &str, kind: NoticeKind) -> Self {
        let message = match kind {
            NoticeKind::Quarantined | NoticeKind::ApprovalRequested => {
                "Your membership is pending review by the moderators.".to_string()
            }
            NoticeKind::Removed => "You have been removed from the community.".to_string(),
            NoticeKind::Resolved => "Your membership has been approved.".to_string(),
            _ => "Your membership status has changed.".to_string(),
        };
        Self {
            audience: Audience::Member {
                identity_id: identity_id.to_string(),
            },
            kind,
            case_id: case_id.to_string(),
            message,
            identity: None,
            score: None,
            level: None,
            flags: Vec::new(),
            quick_actions: Vec::new(),
        }
    }

    pub fn admins(channel: Option<String>, case_id: &str, kind: NoticeKind, message: String) -> Self {
        Self {
            audience: Audience::Admins { channel },
            kind,
            case_id: case_id.to_string(),
            message,
            identity: None,
            score: None,
            level: None,
            flags: Vec::new(),
            quick_actions: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, community: &str, notice: NoticeSpec) -> Result<(), WardenError>;
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn apply_membership_action(
        &self,
        community: &str,
        identity: &str,
        action: MembershipAction,
    ) -> Result<(), WardenError>;

    /// Current membership, `None` when the identity is no longer a member.
    async fn fetch_membership(
        &self,
        community: &str,
        identity: &str,
    ) -> Result<Option<Membership>, WardenError>;
}

/// Logs notices instead of delivering them
#[derive(Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, community: &str, notice: NoticeSpec) -> Result<(), WardenError> {
        match &notice.audience {
            Audience::Admins { channel } => {
                log::info!(
                    "NOTICE [{community}] to admins ({}): {:?} case {} - {}",
                    channel.as_deref().unwrap_or("default"),
                    notice.kind,
                    notice.case_id,
                    notice.message
                );
                if let Some(score) = notice.score {
                    log::info!(
                        "  score {} ({})",
                        score,
                        notice.level.map(|l| l.to_string()).unwrap_or_default()
                    );
                }
                for flag in &notice.flags {
                    log::info!("  - {flag}");
                }
                for action in &notice.quick_actions {
                    log::info!("  [{action}]");
                }
            }
            Audience::Member { identity_id } => {
                log::info!(
                    "NOTICE [{community}] to member {identity_id}: {}",
                    notice.message
                );
            }
        }
        Ok(())
    }
}

/// File the binary keeps its simulated membership table in
pub const MEMBERS_FILE: &str = "members.json";

/// Simulated platform: logs actions and keeps a membership table so race
/// re-validation has something to read. When opened on a file the table is
/// written through, so timers recovered after a restart see the same members.
#[derive(Default)]
pub struct LoggingExecutor {
    members: Mutex<BTreeMap<String, Membership>>,
    path: Option<PathBuf>,
}

fn member_key(community: &str, identity: &str) -> String {
    format!("{community}/{identity}")
}

impl LoggingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table from `path` (if it exists) and persist every change to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let path = path.as_ref().to_path_buf();
        let stored: Vec<Membership> = read_json(&path)?.unwrap_or_default();
        log::info!("Loaded {} member(s) from {}", stored.len(), path.display());
        Ok(Self {
            members: Mutex::new(
                stored
                    .into_iter()
                    .map(|m| (member_key(&m.community_id, &m.identity_id), m))
                    .collect(),
            ),
            path: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Membership>>, WardenError> {
        self.members
            .lock()
            .map_err(|e| WardenError::ActionExecutionFailed(e.to_string()))
    }

    fn persist(&self, members: &BTreeMap<String, Membership>) -> Result<(), WardenError> {
        match &self.path {
            Some(path) => {
                let rows: Vec<&Membership> = members.values().collect();
                write_json(path, &rows)
            }
            None => Ok(()),
        }
    }

    pub fn register_member(&self, membership: &Membership) -> Result<(), WardenError> {
        let mut members = self.lock()?;
        members.insert(
            member_key(&membership.community_id, &membership.identity_id),
            membership.clone(),
        );
        self.persist(&members)
    }
}

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn apply_membership_action(
        &self,
        community: &str,
        identity: &str,
        action: MembershipAction,
    ) -> Result<(), WardenError> {
        log::info!("ACTION [{community}] {identity}: {action:?}");
        let mut members = self.lock()?;
        let key = member_key(community, identity);
        let changed = match action {
            MembershipAction::GrantRole { role_id } => {
                let member = members.get_mut(&key).ok_or_else(|| {
                    WardenError::ActionExecutionFailed(format!("{identity} is not a member"))
                })?;
                member.roles.insert(role_id)
            }
            MembershipAction::RemoveRole { role_id } => members
                .get_mut(&key)
                .map(|member| member.roles.remove(&role_id))
                .unwrap_or(false),
            MembershipAction::Kick { .. } | MembershipAction::Ban { .. } => members.remove(&key).is_some(),
        };
        if changed {
            self.persist(&members)
                .map_err(|e| WardenError::ActionExecutionFailed(format!("membership table: {e}")))?;
        }
        Ok(())
    }

    async fn fetch_membership(
        &self,
        community: &str,
        identity: &str,
    ) -> Result<Option<Membership>, WardenError> {
        Ok(self.lock()?.get(&member_key(community, identity)).cloned())
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording platform double shared by the state machine and pipeline tests.

    use super::*;
    use chrono::Utc;
    use std::collections::{BTreeSet, HashMap};

    #[derive(Default)]
    pub struct RecordingPlatform {
        pub notices: Mutex<Vec<(String, NoticeSpec)>>,
        pub actions: Mutex<Vec<(String, String, MembershipAction)>>,
        members: Mutex<HashMap<(String, String), BTreeSet<RoleId>>>,
        /// Action names that should fail, e.g. "kick"
        failing: Mutex<Vec<&'static str>>,
    }

    impl RecordingPlatform {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_member(&self, community: &str, identity: &str, roles: &[&str]) {
            self.members.lock().unwrap().insert(
                (community.to_string(), identity.to_string()),
                roles.iter().map(|r| r.to_string()).collect(),
            );
        }

        pub fn fail_action(&self, name: &'static str) {
            self.failing.lock().unwrap().push(name);
        }

        pub fn roles_of(&self, community: &str, identity: &str) -> Option<BTreeSet<RoleId>> {
            self.members
                .lock()
                .unwrap()
                .get(&(community.to_string(), identity.to_string()))
                .cloned()
        }

        pub fn action_names(&self) -> Vec<&'static str> {
            self.actions
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, a)| a.name())
                .collect()
        }

        pub fn terminal_action_count(&self) -> usize {
            self.action_names()
                .into_iter()
                .filter(|n| *n == "kick" || *n == "ban")
                .count()
        }

        pub fn notice_kinds(&self) -> Vec<NoticeKind> {
            self.notices.lock().unwrap().iter().map(|(_, n)| n.kind).collect()
        }

        pub fn member_notices(&self) -> Vec<NoticeSpec> {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, n)| matches!(n.audience, Audience::Member { .. }))
                .map(|(_, n)| n.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingPlatform {
        async fn notify(&self, community: &str, notice: NoticeSpec) -> Result<(), WardenError> {
            self.notices
                .lock()
                .unwrap()
                .push((community.to_string(), notice));
            Ok(())
        }
    }

    #[async_trait]
    impl ActionExecutor for RecordingPlatform {
        async fn apply_membership_action(
            &self,
            community: &str,
            identity: &str,
            action: MembershipAction,
        ) -> Result<(), WardenError> {
            if self.failing.lock().unwrap().contains(&action.name()) {
                return Err(WardenError::ActionExecutionFailed(format!(
                    "{} rejected by platform",
                    action.name()
                )));
            }
            let key = (community.to_string(), identity.to_string());
            {
                let mut members = self.members.lock().unwrap();
                match &action {
                    MembershipAction::GrantRole { role_id } => {
                        members.entry(key).or_default().insert(role_id.clone());
                    }
                    MembershipAction::RemoveRole { role_id } => {
                        if let Some(roles) = members.get_mut(&key) {
                            roles.remove(role_id);
                        }
                    }
                    MembershipAction::Kick { .. } | MembershipAction::Ban { .. } => {
                        members.remove(&key);
                    }
                }
            }
            self.actions
                .lock()
                .unwrap()
                .push((community.to_string(), identity.to_string(), action));
            Ok(())
        }

        async fn fetch_membership(
            &self,
            community: &str,
            identity: &str,
        ) -> Result<Option<Membership>, WardenError> {
            Ok(self
                .roles_of(community, identity)
                .map(|roles| Membership {
                    identity_id: identity.to_string(),
                    community_id: community.to_string(),
                    joined_at: Utc::now(),
                    roles,
                }))
        }
    }
}
