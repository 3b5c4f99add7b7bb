//! Drives a verification case from verdict to a terminal outcome.
//!
//! Every path that resolves a case (the initial verdict, an admin decision,
//! an expired approval timer, recovery after a restart) first claims the case.
//! A claim is exclusive, so a case is resolved by exactly one party and gets
//! at most one terminal membership action.

use super::commands::{Admission, AdminCommand, CommandTable, DecisionType};
use super::state::{CaseState, VerificationCase, SYSTEM_ACTOR, TIMER_ACTOR};
use super::timers::{TimerFired, TimerScheduler};
use crate::audit::AuditSink;
use crate::config::{ConfigStore, PolicyConfig, TimeoutAction};
use crate::error::{Result, WardenError};
use crate::model::{CaseId, RiskAssessment, Verdict};
use crate::platform::{
    ActionExecutor, IdentitySummary, MembershipAction, NoticeKind, NoticeSpec, Notifier,
};
use crate::store::CaseStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// How long an expired timer waits before trying a busy case again
const BUSY_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Everything the machine needs to carry out a policy verdict
#[derive(Debug, Clone)]
pub struct VerdictInput {
    pub identity: IdentitySummary,
    pub assessment: RiskAssessment,
    pub verdict: Verdict,
    /// Name of the rule (or exemption) that produced the verdict
    pub rule: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Applied(CaseState),
    /// The case was already terminal; nothing was done
    AlreadyResolved(CaseState),
    Rejected(String),
    /// Another resolver holds the case right now
    Busy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub rearmed: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Approve,
    Quarantine,
    Kick,
    Ban,
}

impl From<DecisionType> for Resolution {
    fn from(decision: DecisionType) -> Self {
        match decision {
            DecisionType::Approve => Resolution::Approve,
            DecisionType::Kick => Resolution::Kick,
            DecisionType::Ban => Resolution::Ban,
        }
    }
}

impl From<TimeoutAction> for Resolution {
    fn from(action: TimeoutAction) -> Self {
        match action {
            TimeoutAction::Approve => Resolution::Approve,
            TimeoutAction::Quarantine => Resolution::Quarantine,
            TimeoutAction::Kick => Resolution::Kick,
            TimeoutAction::Ban => Resolution::Ban,
        }
    }
}

impl Resolution {
    fn name(&self) -> &'static str {
        match self {
            Resolution::Approve => "approve",
            Resolution::Quarantine => "quarantine",
            Resolution::Kick => "kick",
            Resolution::Ban => "ban",
        }
    }
}

struct Claim<'a> {
    claims: &'a Mutex<HashSet<CaseId>>,
    case_id: CaseId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        match self.claims.lock() {
            Ok(mut c) => c.remove(&self.case_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.case_id),
        };
    }
}

pub struct VerificationStateMachine {
    cases: Arc<dyn CaseStore>,
    configs: Arc<dyn ConfigStore>,
    notifier: Arc<dyn Notifier>,
    executor: Arc<dyn ActionExecutor>,
    audit: Arc<dyn AuditSink>,
    timers: TimerScheduler,
    claims: Mutex<HashSet<CaseId>>,
}

impl VerificationStateMachine {
    pub fn new(
        cases: Arc<dyn CaseStore>,
        configs: Arc<dyn ConfigStore>,
        notifier: Arc<dyn Notifier>,
        executor: Arc<dyn ActionExecutor>,
        audit: Arc<dyn AuditSink>,
        timers: TimerScheduler,
    ) -> Self {
        Self {
            cases,
            configs,
            notifier,
            executor,
            audit,
            timers,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn timers(&self) -> &TimerScheduler {
        &self.timers
    }

    fn claim(&self, case_id: &str) -> Option<Claim<'_>> {
        let mut claims = match self.claims.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if claims.insert(case_id.to_string()) {
            Some(Claim {
                claims: &self.claims,
                case_id: case_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Open a case for a fresh join and move it straight into analysis.
    pub fn begin(&self, identity_id: &str, community: &str, at: DateTime<Utc>) -> Result<VerificationCase> {
        let mut case = VerificationCase::new(identity_id, community, at);
        case.transition(CaseState::Analyzing, SYSTEM_ACTOR, "analyze", Vec::new(), at)?;
        self.cases.put_case(&case)?;
        Ok(case)
    }

    /// Carry out the policy verdict for a case in ANALYZING.
    pub async fn execute_verdict(
        &self,
        mut case: VerificationCase,
        input: VerdictInput,
        at: DateTime<Utc>,
    ) -> Result<VerificationCase> {
        let _claim = self
            .claim(&case.case_id)
            .ok_or_else(|| WardenError::TimerRaceLost(case.case_id.clone()))?;
        let policy = self.configs.get_config(&case.community_id);

        let VerdictInput {
            identity,
            assessment,
            verdict,
            rule,
            reasons,
        } = input;
        log::info!(
            "Case {}: {} in {} scored {} ({}), verdict {} by rule {}",
            case.case_id,
            case.identity_id,
            case.community_id,
            assessment.score,
            assessment.level,
            verdict,
            rule
        );
        case.assessment = Some(assessment);
        case.verdict = Some(verdict);
        let mut history = vec![format!("rule: {rule}")];
        history.extend(reasons);

        match verdict {
            Verdict::Approve => {
                if let Some(role) = &policy.verified_role_id {
                    let grant = MembershipAction::GrantRole {
                        role_id: role.clone(),
                    };
                    if let Err(e) = self.act(&case, grant).await {
                        return self.fail(case, e.to_string(), &policy, at).await;
                    }
                }
                case.transition(CaseState::Approved, SYSTEM_ACTOR, "approve", history, at)?;
                self.close(&case)?;
            }
            Verdict::Quarantine => {
                case = self
                    .quarantine(case, &identity, history, "quarantine", &policy, at)
                    .await?;
            }
            Verdict::AdminApproval if !policy.admin_approval.enabled => {
                history.push("admin approval disabled, holding for manual review".to_string());
                case = self
                    .quarantine(case, &identity, history, "admin_approval", &policy, at)
                    .await?;
            }
            Verdict::AdminApproval => {
                if let Err(e) = self.restrict(&case, &policy).await {
                    return self.fail(case, e.to_string(), &policy, at).await;
                }
                let deadline = at + Duration::minutes(i64::from(policy.admin_approval.timeout_minutes));
                case.transition(CaseState::PendingAdmin, SYSTEM_ACTOR, "admin_approval", history, at)?;
                case.pending_timer_deadline = Some(deadline);
                // Persist the deadline before the timer exists so a crash in
                // between is picked up by recovery.
                self.cases.put_case(&case)?;
                self.timers.arm(&case.case_id, deadline);

                self.send(
                    &case.community_id,
                    NoticeSpec::member(&case.identity_id, &case.case_id, NoticeKind::ApprovalRequested),
                )
                .await;
                let message = format!(
                    "Approval needed for {} ({}). Default action '{}' in {} minutes.",
                    identity.username,
                    identity.identity_id,
                    timeout_action_name(policy.admin_approval.default_action),
                    policy.admin_approval.timeout_minutes
                );
                let notice =
                    self.review_notice(&policy, &case, NoticeKind::ApprovalRequested, message, Some(identity));
                self.send(&case.community_id, notice).await;
            }
            Verdict::Kick | Verdict::Ban => {
                let resolution = if verdict == Verdict::Kick {
                    Resolution::Kick
                } else {
                    Resolution::Ban
                };
                return self
                    .resolve(case, resolution, SYSTEM_ACTOR, resolution.name(), history, &policy, at)
                    .await;
            }
            Verdict::Alert => {
                case.transition(CaseState::Alerted, SYSTEM_ACTOR, "alert", history, at)?;
                self.cases.put_case(&case)?;
                let message = format!(
                    "Suspicious join: {} ({}), no action taken",
                    identity.username, identity.identity_id
                );
                let notice = self.review_notice(&policy, &case, NoticeKind::Alert, message, Some(identity));
                self.send(&case.community_id, notice).await;
            }
        }
        Ok(case)
    }

    async fn quarantine(
        &self,
        mut case: VerificationCase,
        identity: &IdentitySummary,
        history: Vec<String>,
        action: &str,
        policy: &PolicyConfig,
        at: DateTime<Utc>,
    ) -> Result<VerificationCase> {
        if let Err(e) = self.restrict(&case, policy).await {
            return self.fail(case, e.to_string(), policy, at).await;
        }
        case.transition(CaseState::Quarantined, SYSTEM_ACTOR, action, history, at)?;
        self.cases.put_case(&case)?;

        self.send(
            &case.community_id,
            NoticeSpec::member(&case.identity_id, &case.case_id, NoticeKind::Quarantined),
        )
        .await;
        let message = format!(
            "{} ({}) was quarantined pending review",
            identity.username, identity.identity_id
        );
        let notice = self.review_notice(policy, &case, NoticeKind::Quarantined, message, Some(identity.clone()));
        self.send(&case.community_id, notice).await;
        Ok(case)
    }

    /// Idempotent: decisions on cases that already reached a terminal state
    /// are acknowledged and ignored.
    pub async fn on_admin_decision(
        &self,
        case_id: &str,
        decision: DecisionType,
        actor_id: &str,
    ) -> Result<DecisionOutcome> {
        let Some(_claim) = self.claim(case_id) else {
            log::info!("Case {case_id} is being resolved elsewhere, {decision} by {actor_id} not applied");
            return Ok(DecisionOutcome::Busy);
        };
        let case = self
            .cases
            .get_case(case_id)?
            .ok_or_else(|| WardenError::UnknownCase(case_id.to_string()))?;

        match CommandTable::admit(decision, case.state) {
            Admission::AlreadyResolved => {
                log::info!(
                    "Case {case_id} already {}, ignoring late {decision} from {actor_id}",
                    case.state
                );
                return Ok(DecisionOutcome::AlreadyResolved(case.state));
            }
            Admission::Rejected => {
                return Ok(DecisionOutcome::Rejected(format!(
                    "cannot {decision} a case in state {}",
                    case.state
                )));
            }
            Admission::Allowed => {}
        }

        let policy = self.configs.get_config(&case.community_id);
        let case = self
            .resolve(
                case,
                decision.into(),
                actor_id,
                decision.as_str(),
                vec![format!("decided by {actor_id}")],
                &policy,
                Utc::now(),
            )
            .await?;
        Ok(DecisionOutcome::Applied(case.state))
    }

    /// Apply the default action for an expired approval request. Returns
    /// `TimerRaceLost` when the case moved on before the timer got to it.
    pub async fn on_timer_expired(&self, fired: TimerFired) -> Result<VerificationCase> {
        let Some(_claim) = self.claim(&fired.case_id) else {
            // The holder may fail before resolving the case; try again shortly
            // so a PENDING_ADMIN case is never left without a live timer.
            let case_id = fired.case_id.clone();
            self.timers.retry(fired, BUSY_RETRY_DELAY);
            return Err(WardenError::TimerRaceLost(case_id));
        };
        let mut case = self
            .cases
            .get_case(&fired.case_id)?
            .ok_or_else(|| WardenError::UnknownCase(fired.case_id.clone()))?;
        if case.state != CaseState::PendingAdmin || case.pending_timer_deadline != Some(fired.deadline) {
            return Err(WardenError::TimerRaceLost(fired.case_id));
        }

        let policy = self.configs.get_config(&case.community_id);
        let now = Utc::now();
        let membership = self
            .executor
            .fetch_membership(&case.community_id, &case.identity_id)
            .await;
        let still_restricted = match membership {
            Ok(Some(membership)) => policy
                .restriction_role_id
                .as_deref()
                .map(|role| membership.has_role(role))
                .unwrap_or(true),
            Ok(None) => false,
            Err(e) => return self.fail(case, e.to_string(), &policy, now).await,
        };

        if !still_restricted {
            log::info!(
                "Case {}: {} is no longer restricted, skipping timeout action",
                case.case_id,
                case.identity_id
            );
            case.transition(
                CaseState::Alerted,
                TIMER_ACTOR,
                "timeout_skipped",
                vec!["member no longer holds the restriction role".to_string()],
                now,
            )?;
            self.timers.cancel(&case.case_id);
            self.cases.put_case(&case)?;
            let notice = self.review_notice(
                &policy,
                &case,
                NoticeKind::Alert,
                format!(
                    "Approval for {} expired but the member changed meanwhile; please review",
                    case.identity_id
                ),
                None,
            );
            self.send(&case.community_id, notice).await;
            return Err(WardenError::TimerRaceLost(case.case_id));
        }

        let action = policy.admin_approval.default_action;
        log::info!(
            "Case {}: no admin response by {}, applying default action {}",
            case.case_id,
            fired.deadline.to_rfc3339(),
            timeout_action_name(action)
        );
        let community = case.community_id.clone();
        let case_id = case.case_id.clone();
        let resolved = self
            .resolve(
                case,
                action.into(),
                TIMER_ACTOR,
                &format!("timeout_{}", timeout_action_name(action)),
                vec![format!(
                    "no admin response within {} minutes",
                    policy.admin_approval.timeout_minutes
                )],
                &policy,
                now,
            )
            .await?;
        if resolved.state != CaseState::Error {
            let notice = NoticeSpec::admins(
                policy.notification_channel.clone(),
                &case_id,
                NoticeKind::TimedOut,
                format!(
                    "Approval request for {} timed out, applied {}",
                    resolved.identity_id,
                    timeout_action_name(action)
                ),
            );
            self.send(&community, notice).await;
        }
        Ok(resolved)
    }

    /// Reconcile persisted cases after a restart: interrupted analyses go to
    /// ERROR, pending approvals get their timers back, overdue ones resolve now.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for mut case in self.cases.list_open_cases()? {
            let policy = self.configs.get_config(&case.community_id);
            match case.state {
                CaseState::Initial | CaseState::Analyzing => {
                    let Some(_claim) = self.claim(&case.case_id) else {
                        continue;
                    };
                    self.fail(case, "analysis interrupted".to_string(), &policy, now)
                        .await?;
                    report.interrupted += 1;
                }
                CaseState::PendingAdmin => {
                    let deadline = match case.pending_timer_deadline {
                        Some(deadline) => deadline,
                        None => {
                            let deadline = case.created_at
                                + Duration::minutes(i64::from(policy.admin_approval.timeout_minutes));
                            case.pending_timer_deadline = Some(deadline);
                            self.cases.put_case(&case)?;
                            deadline
                        }
                    };
                    if deadline <= now {
                        let fired = TimerFired {
                            case_id: case.case_id.clone(),
                            deadline,
                        };
                        match self.on_timer_expired(fired).await {
                            Ok(_) => {}
                            Err(e) if e.is_informational() => log::debug!("{e}"),
                            Err(e) => log::error!("Recovering case {} failed: {e}", case.case_id),
                        }
                        report.expired += 1;
                    } else {
                        self.timers.arm(&case.case_id, deadline);
                        report.rearmed += 1;
                    }
                }
                _ => {}
            }
        }
        log::info!(
            "Recovery: {} interrupted, {} timers re-armed, {} expired while down",
            report.interrupted,
            report.rearmed,
            report.expired
        );
        Ok(report)
    }

    async fn resolve(
        &self,
        mut case: VerificationCase,
        resolution: Resolution,
        actor_id: &str,
        action: &str,
        reasons: Vec<String>,
        policy: &PolicyConfig,
        at: DateTime<Utc>,
    ) -> Result<VerificationCase> {
        match resolution {
            Resolution::Approve => {
                if let Some(role) = &policy.restriction_role_id {
                    let lift = MembershipAction::RemoveRole {
                        role_id: role.clone(),
                    };
                    if let Err(e) = self.act(&case, lift).await {
                        return self.fail(case, e.to_string(), policy, at).await;
                    }
                }
                if let Some(role) = &policy.verified_role_id {
                    let grant = MembershipAction::GrantRole {
                        role_id: role.clone(),
                    };
                    if let Err(e) = self.act(&case, grant).await {
                        return self.fail(case, e.to_string(), policy, at).await;
                    }
                }
                case.transition(CaseState::Approved, actor_id, action, reasons, at)?;
                self.close(&case)?;
                self.send(
                    &case.community_id,
                    NoticeSpec::member(&case.identity_id, &case.case_id, NoticeKind::Resolved),
                )
                .await;
            }
            Resolution::Kick | Resolution::Ban => {
                let reason = format!("{action} by {actor_id}");
                let (removal, next) = if resolution == Resolution::Kick {
                    (MembershipAction::Kick { reason }, CaseState::Kicked)
                } else {
                    (MembershipAction::Ban { reason }, CaseState::Banned)
                };
                // Tell the member while they can still receive it
                self.send(
                    &case.community_id,
                    NoticeSpec::member(&case.identity_id, &case.case_id, NoticeKind::Removed),
                )
                .await;
                if let Err(e) = self.act(&case, removal).await {
                    return self.fail(case, e.to_string(), policy, at).await;
                }
                case.transition(next, actor_id, action, reasons, at)?;
                self.close(&case)?;
            }
            Resolution::Quarantine => {
                case.transition(CaseState::Quarantined, actor_id, action, reasons, at)?;
                self.timers.cancel(&case.case_id);
                self.cases.put_case(&case)?;
            }
        }

        // Timer expiry announces itself; routine approvals stay quiet
        let announce = match (actor_id, case.state) {
            (TIMER_ACTOR, _) => false,
            (SYSTEM_ACTOR, CaseState::Approved) => false,
            _ => true,
        };
        if announce {
            let kind = match case.state {
                CaseState::Kicked | CaseState::Banned => NoticeKind::Removed,
                _ => NoticeKind::Resolved,
            };
            let message = format!(
                "Case for {} resolved: {} by {}",
                case.identity_id, case.state, actor_id
            );
            let notice = self.review_notice(policy, &case, kind, message, None);
            self.send(&case.community_id, notice).await;
        }
        Ok(case)
    }

    /// Park a case in ERROR after something went wrong and tell the admins.
    async fn fail(
        &self,
        mut case: VerificationCase,
        message: String,
        policy: &PolicyConfig,
        at: DateTime<Utc>,
    ) -> Result<VerificationCase> {
        log::error!("Case {} ({} in {}): {message}", case.case_id, case.identity_id, case.community_id);
        case.transition(CaseState::Error, SYSTEM_ACTOR, "error", vec![message.clone()], at)?;
        case.error = Some(message.clone());
        self.timers.cancel(&case.case_id);
        self.cases.put_case(&case)?;

        let notice = self.review_notice(
            policy,
            &case,
            NoticeKind::ActionFailed,
            format!("Verification of {} needs attention: {message}", case.identity_id),
            None,
        );
        self.send(&case.community_id, notice).await;
        Ok(case)
    }

    async fn restrict(&self, case: &VerificationCase, policy: &PolicyConfig) -> Result<()> {
        match &policy.restriction_role_id {
            Some(role) => {
                self.act(
                    case,
                    MembershipAction::GrantRole {
                        role_id: role.clone(),
                    },
                )
                .await
            }
            None => Err(WardenError::config_invalid(
                &case.community_id,
                "no restriction role configured",
            )),
        }
    }

    async fn act(&self, case: &VerificationCase, action: MembershipAction) -> Result<()> {
        let name = action.name();
        self.executor
            .apply_membership_action(&case.community_id, &case.identity_id, action)
            .await
            .map_err(|e| match e {
                WardenError::ActionExecutionFailed(_) => e,
                other => WardenError::ActionExecutionFailed(format!("{name}: {other}")),
            })
    }

    /// Terminal cases reach the audit log before the store retires them.
    fn close(&self, case: &VerificationCase) -> Result<()> {
        self.timers.cancel(&case.case_id);
        if case.state.is_terminal() {
            self.audit.archive(case);
        }
        self.cases.put_case(case)
    }

    /// Admin-facing notice with the full reasoning trail and, while the case
    /// still awaits a human, the quick actions.
    fn review_notice(
        &self,
        policy: &PolicyConfig,
        case: &VerificationCase,
        kind: NoticeKind,
        message: String,
        identity: Option<IdentitySummary>,
    ) -> NoticeSpec {
        let mut notice = NoticeSpec::admins(policy.notification_channel.clone(), &case.case_id, kind, message);
        notice.identity = identity;
        if let Some(assessment) = &case.assessment {
            notice.score = Some(assessment.score);
            notice.level = Some(assessment.level);
            notice.flags = assessment.reasons.clone();
        }
        if let Some(last) = case.decision_history.last() {
            notice.flags.extend(last.reasons.iter().cloned());
        }
        if case.state.awaits_review() {
            notice.quick_actions = AdminCommand::quick_actions(&case.case_id);
        }
        notice
    }

    /// Notification problems never change the outcome of a case.
    async fn send(&self, community: &str, notice: NoticeSpec) {
        let case_id = notice.case_id.clone();
        if let Err(e) = self.notifier.notify(community, notice).await {
            log::warn!("Notification for case {case_id} failed: {e}");
        }
    }
}

fn timeout_action_name(action: TimeoutAction) -> &'static str {
    Resolution::from(action).name()
}
