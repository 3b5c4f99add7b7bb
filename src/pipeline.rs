//! Join pipeline: signal collection, scoring, policy and verification wired
//! together behind the inbound operations the host calls.

use crate::audit::AuditSink;
use crate::components::{ExemptionRegistry, PolicyEngine, PolicyInput, RiskScorer};
use crate::config::{ConfigPatch, ConfigStore, PolicyConfig, ServiceConfig};
use crate::error::Result;
use crate::model::{CommunityId, GlobalFlag, Identity, IdentityId, Membership, RiskAssessment, Verdict};
use crate::multi_identity::{aggregate_confidence, MultiIdentityDetector};
use crate::platform::{ActionExecutor, IdentitySummary, Notifier};
use crate::raid::RaidMonitor;
use crate::signals::{BanLookup, SignalCollector, UsernameSuspicionStrategy};
use crate::store::{CaseStore, FlagRegistry, WarningStore};
use crate::verification::{
    AdminCommand, CaseState, DecisionOutcome, DecisionType, RecoveryReport, TimerEvents,
    TimerFired, TimerScheduler, VerdictInput, VerificationCase, VerificationStateMachine,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collaborators the pipeline is built from
pub struct Collaborators {
    pub configs: Arc<dyn ConfigStore>,
    pub cases: Arc<dyn CaseStore>,
    pub flags: Arc<dyn FlagRegistry>,
    pub warnings: Arc<dyn WarningStore>,
    pub bans: Arc<dyn BanLookup>,
    pub username: Arc<dyn UsernameSuspicionStrategy>,
    pub notifier: Arc<dyn Notifier>,
    pub executor: Arc<dyn ActionExecutor>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Processed(VerificationCase),
    /// A run for this identity and community is already in flight or open
    Duplicate,
    /// The community has no usable policy
    Disabled,
}

type JoinKey = (CommunityId, IdentityId);

struct InFlight<'a> {
    set: &'a Mutex<HashSet<JoinKey>>,
    key: JoinKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        match self.set.lock() {
            Ok(mut s) => s.remove(&self.key),
            Err(poisoned) => poisoned.into_inner().remove(&self.key),
        };
    }
}

pub struct Pipeline {
    configs: Arc<dyn ConfigStore>,
    cases: Arc<dyn CaseStore>,
    flags: Arc<dyn FlagRegistry>,
    warnings: Arc<dyn WarningStore>,
    collector: SignalCollector,
    detector: MultiIdentityDetector,
    raid: RaidMonitor,
    machine: VerificationStateMachine,
    in_flight: Mutex<HashSet<JoinKey>>,
    analysis_deadline: Duration,
}

impl Pipeline {
    pub fn new(service: &ServiceConfig, deps: Collaborators) -> (Self, TimerEvents) {
        let (timers, events) = TimerScheduler::new();
        let collector = SignalCollector::new(
            deps.warnings.clone(),
            deps.flags.clone(),
            deps.bans,
            deps.username,
            service.ban_lookup.clone(),
        );
        let machine = VerificationStateMachine::new(
            deps.cases.clone(),
            deps.configs.clone(),
            deps.notifier,
            deps.executor,
            deps.audit,
            timers,
        );
        let pipeline = Self {
            configs: deps.configs,
            cases: deps.cases,
            flags: deps.flags,
            warnings: deps.warnings,
            collector,
            detector: MultiIdentityDetector::new(service.detector.clone()),
            raid: RaidMonitor::new(),
            machine,
            in_flight: Mutex::new(HashSet::new()),
            analysis_deadline: Duration::from_millis(service.analysis_deadline_ms),
        };
        (pipeline, events)
    }

    pub fn machine(&self) -> &VerificationStateMachine {
        &self.machine
    }

    fn enter(&self, community: &str, identity: &str) -> Option<InFlight<'_>> {
        let key = (community.to_string(), identity.to_string());
        let mut set = match self.in_flight.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if set.insert(key.clone()) {
            Some(InFlight {
                set: &self.in_flight,
                key,
            })
        } else {
            None
        }
    }

    /// Vet a newly admitted identity and carry the verdict out.
    pub async fn on_identity_join(&self, identity: &Identity, membership: &Membership) -> Result<JoinOutcome> {
        let community = membership.community_id.as_str();
        let policy = self.configs.get_config(community);
        if !policy.enabled {
            log::debug!("Vetting disabled for {community}, ignoring join of {}", identity.id);
            return Ok(JoinOutcome::Disabled);
        }
        if let Err(e) = policy.validate(community) {
            log::error!("{e}; not vetting {} until the policy is fixed", identity.id);
            return Ok(JoinOutcome::Disabled);
        }

        let Some(_guard) = self.enter(community, &identity.id) else {
            log::debug!("Join of {} in {community} already being processed", identity.id);
            return Ok(JoinOutcome::Duplicate);
        };
        if let Some(open) = self.cases.find_open_case(&identity.id, community)? {
            log::info!(
                "Ignoring repeated join of {} in {community}, case {} is {}",
                identity.id,
                open.case_id,
                open.state
            );
            return Ok(JoinOutcome::Duplicate);
        }

        let at = Utc::now();
        let case = self.machine.begin(&identity.id, community, at)?;
        let summary = IdentitySummary {
            identity_id: identity.id.clone(),
            username: identity.username.clone(),
            age_days: identity.age_days(at),
        };
        let raid = self.raid.observe(community, at, &policy.raid);

        if identity.is_automated && policy.ignore_automated_accounts {
            let input = exempt_input(summary, "automated_account", "automated account", at);
            let case = self.machine.execute_verdict(case, input, at).await?;
            return Ok(JoinOutcome::Processed(case));
        }
        if let Some(exemption) = ExemptionRegistry::exemption(identity, membership, &policy) {
            log::info!("{} in {community}: {}", identity.id, exemption.describe());
            let input = exempt_input(summary, "whitelist", &exemption.describe(), at);
            let case = self.machine.execute_verdict(case, input, at).await?;
            return Ok(JoinOutcome::Processed(case));
        }

        let matches = self.detector.detect(identity, community, at);
        self.detector.record(identity, community, at);

        let deadline = tokio::time::Instant::now() + self.analysis_deadline;
        let mut signals = self
            .collector
            .collect(identity, membership, &policy, deadline, at)
            .await;
        signals.multi_identity_matches = matches;
        signals.raid_suspected = raid.suspected;
        signals.raid_reasons = raid.reasons;

        let assessment = RiskScorer::score(&signals, &policy);
        let confidence = aggregate_confidence(&signals.multi_identity_matches);
        let decision = PolicyEngine::new(&policy).decide(&PolicyInput {
            signals: &signals,
            assessment: &assessment,
            multi_identity_confidence: confidence,
        });

        let mut reasons = decision.reasons;
        if !signals.degraded.is_empty() {
            reasons.push(format!("signals unavailable: {}", signals.degraded.join(", ")));
        }
        let input = VerdictInput {
            identity: summary,
            assessment,
            verdict: decision.verdict,
            rule: decision.rule.to_string(),
            reasons,
        };
        let case = self.machine.execute_verdict(case, input, at).await?;
        self.note_removal(&case);
        Ok(JoinOutcome::Processed(case))
    }

    pub async fn on_admin_decision(
        &self,
        case_id: &str,
        decision: DecisionType,
        actor_id: &str,
    ) -> Result<DecisionOutcome> {
        let outcome = self.machine.on_admin_decision(case_id, decision, actor_id).await?;
        if let DecisionOutcome::Applied(CaseState::Kicked | CaseState::Banned) = outcome {
            if let Some(case) = self.cases.get_case(case_id)? {
                self.note_removal(&case);
            }
        }
        Ok(outcome)
    }

    /// Decode a quick-action string from a notice and apply it.
    pub async fn on_admin_command(&self, encoded: &str, actor_id: &str) -> Result<DecisionOutcome> {
        let command = AdminCommand::decode(encoded)?;
        self.on_admin_decision(&command.case_id, command.decision, actor_id)
            .await
    }

    pub async fn on_timer_fired(&self, fired: TimerFired) {
        match self.machine.on_timer_expired(fired).await {
            Ok(case) => self.note_removal(&case),
            Err(e) if e.is_informational() => log::debug!("{e}"),
            Err(e) => log::error!("Approval timeout handling failed: {e}"),
        }
    }

    /// Feed expired approval timers into the machine until the scheduler goes away.
    pub async fn run_timer_loop(&self, mut events: TimerEvents) {
        while let Some(fired) = events.recv().await {
            self.on_timer_fired(fired).await;
        }
        log::debug!("Timer loop finished");
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.machine.recover(Utc::now()).await
    }

    pub fn set_config(&self, community: &str, patch: &ConfigPatch) -> Result<PolicyConfig> {
        self.configs.set_config(community, patch)
    }

    pub fn set_global_flag(&self, identity: &str, reason: &str, actor_id: &str) -> Result<()> {
        log::info!("{actor_id} flagged {identity} globally: {reason}");
        self.flags.set_flag(
            identity,
            GlobalFlag {
                reason: reason.to_string(),
                actor_id: actor_id.to_string(),
                flagged_at: Utc::now(),
            },
        )
    }

    pub fn clear_global_flag(&self, identity: &str) -> Result<bool> {
        let removed = self.flags.delete_flag(identity)?;
        if removed {
            log::info!("Cleared global flag on {identity}");
        }
        Ok(removed)
    }

    pub fn add_warning(&self, community: &str, identity: &str) -> Result<u32> {
        let count = self.warnings.add_warning(community, identity)?;
        log::info!("{identity} in {community} now has {count} warning(s)");
        Ok(count)
    }

    pub fn clear_warnings(&self, community: &str, identity: &str) -> Result<()> {
        self.warnings.clear_warnings(community, identity)
    }

    fn note_removal(&self, case: &VerificationCase) {
        if matches!(case.state, CaseState::Kicked | CaseState::Banned) {
            self.detector.mark_removed(&case.identity_id, &case.community_id);
        }
    }
}

fn exempt_input(identity: IdentitySummary, rule: &str, reason: &str, at: DateTime<Utc>) -> VerdictInput {
    VerdictInput {
        identity,
        assessment: RiskAssessment::exempt(reason.to_string(), at),
        verdict: Verdict::Approve,
        rule: rule.to_string(),
        reasons: vec![reason.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::config::{InMemoryConfigStore, Thresholds};
    use crate::error::WardenError;
    use crate::model::RiskLevel;
    use crate::platform::testing::RecordingPlatform;
    use crate::platform::{ActionExecutor, LoggingExecutor, LoggingNotifier, MembershipAction, MEMBERS_FILE};
    use crate::signals::{BanPage, CaseHistoryBanLookup, KeywordUsernameStrategy};
    use crate::store::{JsonFileStore, MemoryStore};
    use crate::verification::SYSTEM_ACTOR;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeSet;

    struct Fixture {
        pipeline: Pipeline,
        platform: Arc<RecordingPlatform>,
        audit: Arc<MemoryAudit>,
        _events: TimerEvents,
    }

    fn build<S>(policy: PolicyConfig, store: Arc<S>) -> Fixture
    where
        S: CaseStore + FlagRegistry + WarningStore + 'static,
    {
        let platform = Arc::new(RecordingPlatform::new());
        let audit = Arc::new(MemoryAudit::new());
        let (pipeline, events) = Pipeline::new(
            &ServiceConfig::default(),
            Collaborators {
                configs: Arc::new(InMemoryConfigStore::with_policy("c1", policy)),
                cases: store.clone(),
                flags: store.clone(),
                warnings: store.clone(),
                bans: Arc::new(CaseHistoryBanLookup::new(store)),
                username: Arc::new(KeywordUsernameStrategy::new()),
                notifier: platform.clone(),
                executor: platform.clone(),
                audit: audit.clone(),
            },
        );
        Fixture {
            pipeline,
            platform,
            audit,
            _events: events,
        }
    }

    fn fixture(policy: PolicyConfig) -> Fixture {
        build(policy, Arc::new(MemoryStore::new()))
    }

    fn join(id: &str, name: &str, age_days: i64, avatar: Option<&str>) -> (Identity, Membership) {
        let now = Utc::now();
        (
            Identity {
                id: id.to_string(),
                created_at: now - ChronoDuration::days(age_days),
                has_custom_avatar: avatar.is_some(),
                avatar_hash: avatar.map(|a| a.to_string()),
                username: name.to_string(),
                is_automated: false,
            },
            Membership {
                identity_id: id.to_string(),
                community_id: "c1".to_string(),
                joined_at: now,
                roles: BTreeSet::new(),
            },
        )
    }

    async fn processed(f: &Fixture, identity: &Identity, membership: &Membership) -> VerificationCase {
        match f.pipeline.on_identity_join(identity, membership).await.unwrap() {
            JoinOutcome::Processed(case) => case,
            other => panic!("expected a processed join, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_account_quarantined() {
        let f = fixture(PolicyConfig::default());
        let (identity, membership) = join("u1", "quietreader", 1, Some("a1"));
        let case = processed(&f, &identity, &membership).await;

        assert_eq!(case.state, CaseState::Quarantined);
        assert_eq!(case.verdict, Some(Verdict::Quarantine));
        assert!(case.pending_timer_deadline.is_none());
        assert!(f.platform.roles_of("c1", "u1").unwrap().contains("restricted"));
        assert!(case.decision_history.last().unwrap().reasons[0].contains("recent_account"));
    }

    #[tokio::test]
    async fn test_established_account_approved() {
        let f = fixture(PolicyConfig::default());
        let (identity, membership) = join("u1", "quietreader", 30, None);
        let case = processed(&f, &identity, &membership).await;

        let assessment = case.assessment.as_ref().unwrap();
        assert_eq!(assessment.score, 5);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(case.state, CaseState::Approved);
        assert_eq!(f.audit.records().len(), 1);
    }

    #[tokio::test]
    async fn test_lookalike_goes_to_admin_approval() {
        let f = fixture(PolicyConfig::default());
        let (first, first_membership) = join("u0", "stargazer", 30, Some("same-avatar"));
        processed(&f, &first, &first_membership).await;

        let (alt, alt_membership) = join("u1", "stargazer2", 30, Some("same-avatar"));
        let case = processed(&f, &alt, &alt_membership).await;

        assert_eq!(case.state, CaseState::PendingAdmin);
        let deadline = case.pending_timer_deadline.unwrap();
        assert_eq!((deadline - case.updated_at).num_minutes(), 60);
        assert!(f.pipeline.machine().timers().is_armed(&case.case_id));
        assert!(case.decision_history.last().unwrap().reasons[0].contains("multi_account"));
    }

    #[tokio::test]
    async fn test_whitelist_always_approves() {
        let mut policy = PolicyConfig::default();
        policy.whitelist.identity_ids.insert("u1".to_string());
        let f = fixture(policy);
        f.pipeline.set_global_flag("u1", "raider", "admin-1").unwrap();
        f.pipeline.add_warning("c1", "u1").unwrap();

        let (identity, membership) = join("u1", "free nitro giveaway", 0, None);
        let case = processed(&f, &identity, &membership).await;

        assert_eq!(case.state, CaseState::Approved);
        assert_eq!(case.assessment.as_ref().unwrap().score, 0);
        assert!(f.platform.roles_of("c1", "u1").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_join_is_ignored() {
        let f = fixture(PolicyConfig::default());
        let (identity, membership) = join("u1", "quietreader", 1, None);
        processed(&f, &identity, &membership).await;

        let again = f.pipeline.on_identity_join(&identity, &membership).await.unwrap();
        assert_eq!(again, JoinOutcome::Duplicate);
        assert_eq!(
            f.platform
                .action_names()
                .iter()
                .filter(|n| **n == "grant_role")
                .count(),
            1
        );
    }

    /// Holds every ban lookup long enough for a second join to arrive
    struct SlowBans;

    #[async_trait]
    impl BanLookup for SlowBans {
        async fn bans_page(
            &self,
            _identity: &str,
            _exclude_community: &str,
            _cursor: Option<String>,
            _page_size: usize,
        ) -> std::result::Result<BanPage, WardenError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(BanPage::default())
        }
    }

    #[tokio::test]
    async fn test_join_during_analysis_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(RecordingPlatform::new());
        let (pipeline, _events) = Pipeline::new(
            &ServiceConfig::default(),
            Collaborators {
                configs: Arc::new(InMemoryConfigStore::with_policy("c1", PolicyConfig::default())),
                cases: store.clone(),
                flags: store.clone(),
                warnings: store.clone(),
                bans: Arc::new(SlowBans),
                username: Arc::new(KeywordUsernameStrategy::new()),
                notifier: platform.clone(),
                executor: platform.clone(),
                audit: Arc::new(MemoryAudit::new()),
            },
        );
        let (identity, membership) = join("u1", "quietreader", 1, None);

        let (first, second) = tokio::join!(
            pipeline.on_identity_join(&identity, &membership),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pipeline.on_identity_join(&identity, &membership).await
            }
        );

        assert!(matches!(first.unwrap(), JoinOutcome::Processed(_)));
        assert_eq!(second.unwrap(), JoinOutcome::Duplicate);
        assert_eq!(
            platform
                .action_names()
                .iter()
                .filter(|n| **n == "grant_role")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_automated_accounts_skipped() {
        let f = fixture(PolicyConfig::default());
        let (mut identity, membership) = join("bot", "helperbot", 0, None);
        identity.is_automated = true;
        let case = processed(&f, &identity, &membership).await;
        assert_eq!(case.state, CaseState::Approved);
        assert!(f.platform.action_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_policy_disables_community() {
        let mut policy = PolicyConfig::default();
        policy.thresholds = Thresholds {
            medium: 60,
            high: 30,
            critical: 90,
        };
        let f = fixture(policy);
        let (identity, membership) = join("u1", "quietreader", 1, None);
        let outcome = f.pipeline.on_identity_join(&identity, &membership).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Disabled);
        assert!(f.platform.action_names().is_empty());
    }

    #[tokio::test]
    async fn test_ban_command_marks_identity_removed() {
        let f = fixture(PolicyConfig::default());
        let (identity, membership) = join("u1", "spammer_jim", 1, Some("abc"));
        let case = processed(&f, &identity, &membership).await;

        let command = AdminCommand::new(&case.case_id, DecisionType::Ban).encode();
        let outcome = f.pipeline.on_admin_command(&command, "admin-1").await.unwrap();
        assert_eq!(outcome, DecisionOutcome::Applied(CaseState::Banned));

        // The same identity rejoining elsewhere carries the ban with it
        let mut rejoin = membership.clone();
        rejoin.community_id = "c2".to_string();
        let elsewhere = processed(&f, &identity, &rejoin).await;
        let reasons = &elsewhere.assessment.as_ref().unwrap().reasons;
        assert!(reasons.iter().any(|r| r.contains("other communities")));

        // A lookalike in the original community matches a removed identity
        let (alt, alt_membership) = join("u2", "spammer_j1m", 30, Some("abc"));
        let alt_case = processed(&f, &alt, &alt_membership).await;
        assert!(alt_case
            .decision_history
            .last()
            .unwrap()
            .reasons
            .iter()
            .any(|r| r.contains("removed identity")));
    }

    #[tokio::test]
    async fn test_bad_command_is_rejected() {
        let f = fixture(PolicyConfig::default());
        let err = f
            .pipeline
            .on_admin_command("warden:pardon:c1-u1-1", "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_flags_and_warnings() {
        let f = fixture(PolicyConfig::default());
        f.pipeline.set_global_flag("u1", "raider", "admin-1").unwrap();
        assert!(f.pipeline.clear_global_flag("u1").unwrap());
        assert!(!f.pipeline.clear_global_flag("u1").unwrap());

        assert_eq!(f.pipeline.add_warning("c1", "u1").unwrap(), 1);
        assert_eq!(f.pipeline.add_warning("c1", "u1").unwrap(), 2);
        f.pipeline.clear_warnings("c1", "u1").unwrap();
        assert_eq!(f.pipeline.add_warning("c1", "u1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejected_config_patch_keeps_policy() {
        let f = fixture(PolicyConfig::default());
        let patch = ConfigPatch {
            multi_identity_threshold: Some(150),
            ..ConfigPatch::default()
        };
        let err = f.pipeline.set_config("c1", &patch).unwrap_err();
        assert!(matches!(err, WardenError::ConfigInvalid { .. }));
        assert_eq!(f.pipeline.configs.get_config("c1").multi_identity_threshold, 70);
    }

    #[tokio::test]
    async fn test_pending_deadline_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (first, first_membership) = join("u0", "stargazer", 30, Some("same-avatar"));
        let (alt, alt_membership) = join("u1", "stargazer2", 30, Some("same-avatar"));

        let case = {
            let f = build(PolicyConfig::default(), Arc::new(JsonFileStore::open(dir.path()).unwrap()));
            processed(&f, &first, &first_membership).await;
            processed(&f, &alt, &alt_membership).await
        };
        let deadline = case.pending_timer_deadline.unwrap();

        let f = build(PolicyConfig::default(), Arc::new(JsonFileStore::open(dir.path()).unwrap()));
        let report = f.pipeline.recover().await.unwrap();
        assert_eq!(report.rearmed, 1);
        assert_eq!(report.expired, 0);

        let reloaded = f.pipeline.cases.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(reloaded.state, CaseState::PendingAdmin);
        assert!(reloaded.pending_timer_deadline.unwrap() <= deadline);
        assert!(f.pipeline.machine().timers().is_armed(&case.case_id));
    }

    /// Collaborators wired the way the binary wires them, all under `dir`
    fn file_backed(dir: &std::path::Path) -> (Pipeline, TimerEvents, Arc<JsonFileStore>, Arc<LoggingExecutor>) {
        let store = Arc::new(JsonFileStore::open(dir).unwrap());
        let executor = Arc::new(LoggingExecutor::open(dir.join(MEMBERS_FILE)).unwrap());
        let (pipeline, events) = Pipeline::new(
            &ServiceConfig::default(),
            Collaborators {
                configs: Arc::new(InMemoryConfigStore::with_policy("c1", PolicyConfig::default())),
                cases: store.clone(),
                flags: store.clone(),
                warnings: store.clone(),
                bans: Arc::new(CaseHistoryBanLookup::new(store.clone())),
                username: Arc::new(KeywordUsernameStrategy::new()),
                notifier: Arc::new(LoggingNotifier),
                executor: executor.clone(),
                audit: Arc::new(MemoryAudit::new()),
            },
        );
        (pipeline, events, store, executor)
    }

    #[tokio::test]
    async fn test_overdue_approval_resolves_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let case_id = {
            let (_pipeline, _events, store, executor) = file_backed(dir.path());
            let (_, membership) = join("u1", "stargazer2", 30, None);
            executor.register_member(&membership).unwrap();
            executor
                .apply_membership_action(
                    "c1",
                    "u1",
                    MembershipAction::GrantRole {
                        role_id: "restricted".to_string(),
                    },
                )
                .await
                .unwrap();

            let opened = now - ChronoDuration::hours(3);
            let mut case = VerificationCase::new("u1", "c1", opened);
            case.transition(CaseState::PendingAdmin, SYSTEM_ACTOR, "admin_approval", vec![], opened)
                .unwrap();
            case.pending_timer_deadline = Some(now - ChronoDuration::hours(2));
            store.put_case(&case).unwrap();
            case.case_id
        };

        let (pipeline, _events, store, executor) = file_backed(dir.path());
        let report = pipeline.recover().await.unwrap();
        assert_eq!(report.expired, 1);

        let resolved = store.get_case(&case_id).unwrap().unwrap();
        assert_eq!(resolved.state, CaseState::Kicked);
        assert!(executor.fetch_membership("c1", "u1").await.unwrap().is_none());
        assert!(store.list_open_cases().unwrap().is_empty());
    }
}
