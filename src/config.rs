use crate::error::WardenError;
use crate::model::{CommunityId, IdentityId, RoleId, Verdict};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Policy used by communities without an entry in `communities`
    #[serde(default)]
    pub default_policy: PolicyConfig,
    #[serde(default)]
    pub communities: BTreeMap<CommunityId, PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub data_dir: String,
    pub audit_log_path: String,
    /// Upper bound for signal collection of a single case
    pub analysis_deadline_ms: u64,
    pub ban_lookup: BanLookupLimits,
    pub detector: DetectorConfig,
}

/// Longest multi-identity window the detector will keep (one year)
pub const MAX_WINDOW_TTL_HOURS: i64 = 24 * 365;
/// Longest raid window (one day)
pub const MAX_RAID_WINDOW_SECONDS: i64 = 24 * 60 * 60;

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), WardenError> {
        let service = "<service>";
        if self.analysis_deadline_ms == 0 {
            return Err(WardenError::config_invalid(service, "analysis_deadline_ms must be positive"));
        }
        if !(1..=MAX_WINDOW_TTL_HOURS).contains(&self.detector.window_ttl_hours) {
            return Err(WardenError::config_invalid(
                service,
                format!("detector.window_ttl_hours must be within 1..={MAX_WINDOW_TTL_HOURS}"),
            ));
        }
        if !(0..=MAX_WINDOW_TTL_HOURS * 60).contains(&self.detector.creation_cluster_minutes) {
            return Err(WardenError::config_invalid(
                service,
                "detector.creation_cluster_minutes is out of range",
            ));
        }
        if self.detector.min_match_similarity > 100 {
            return Err(WardenError::config_invalid(
                service,
                "detector.min_match_similarity must be within 0..=100",
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/join-warden".to_string(),
            audit_log_path: "/var/lib/join-warden/audit.jsonl".to_string(),
            analysis_deadline_ms: 3000,
            ban_lookup: BanLookupLimits::default(),
            detector: DetectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanLookupLimits {
    pub page_size: usize,
    /// Stop scanning once this many bans were found
    pub max_ban_matches: u32,
    /// Stop scanning once this many communities were checked
    pub max_communities_scanned: usize,
}

impl Default for BanLookupLimits {
    fn default() -> Self {
        Self {
            page_size: 25,
            max_ban_matches: 5,
            max_communities_scanned: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub window_capacity: usize,
    pub window_ttl_hours: i64,
    pub max_comparisons: usize,
    pub max_matches: usize,
    pub min_match_similarity: u8,
    pub creation_cluster_minutes: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 500,
            window_ttl_hours: 72,
            max_comparisons: 200,
            max_matches: 5,
            min_match_similarity: 50,
            creation_cluster_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            medium: 30,
            high: 60,
            critical: 90,
        }
    }
}

impl Thresholds {
    pub fn is_ascending(&self) -> bool {
        self.medium < self.high && self.high < self.critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub new_account: u32,
    pub no_avatar: u32,
    pub global_flag: u32,
    pub suspicious_username: u32,
    pub raid: u32,
    pub warnings: u32,
    pub cross_community_bans: u32,
    pub similar_identities: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            new_account: 20,
            no_avatar: 5,
            global_flag: 50,
            suspicious_username: 15,
            raid: 10,
            warnings: 10,
            cross_community_bans: 15,
            similar_identities: 20,
        }
    }
}

/// Upper bounds on the count used by count-based categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Caps {
    pub warnings: u32,
    pub cross_community_bans: u32,
    pub similar_identities: u32,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            warnings: 3,
            cross_community_bans: 3,
            similar_identities: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub recent_account: Verdict,
    pub multi_account: Verdict,
    pub high_risk: Verdict,
    pub suspicious_username: Verdict,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            recent_account: Verdict::Quarantine,
            multi_account: Verdict::AdminApproval,
            high_risk: Verdict::AdminApproval,
            suspicious_username: Verdict::Alert,
        }
    }
}

impl ActionsConfig {
    fn iter(&self) -> impl Iterator<Item = Verdict> {
        [
            self.recent_account,
            self.multi_account,
            self.high_risk,
            self.suspicious_username,
        ]
        .into_iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Whitelist {
    pub identity_ids: BTreeSet<IdentityId>,
    pub role_ids: BTreeSet<RoleId>,
}

/// What happens when an approval request expires unanswered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    Quarantine,
    Kick,
    Ban,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminApprovalConfig {
    pub enabled: bool,
    pub timeout_minutes: u32,
    pub default_action: TimeoutAction,
}

impl Default for AdminApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_minutes: 60,
            default_action: TimeoutAction::Kick,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsernameRules {
    /// Case-insensitive substrings
    pub keywords: Vec<String>,
    /// Regular expressions matched against the raw username
    pub patterns: Vec<String>,
    pub flag_repeated_symbols: bool,
}

impl Default for UsernameRules {
    fn default() -> Self {
        Self {
            keywords: vec![
                "free nitro".to_string(),
                "airdrop".to_string(),
                "giveaway".to_string(),
                "support team".to_string(),
                "moderator".to_string(),
            ],
            patterns: vec![r"(?i)^(admin|mod)[\W_]*\d{2,}$".to_string()],
            flag_repeated_symbols: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidRules {
    pub enabled: bool,
    pub window_seconds: i64,
    /// Joins within the window (including the current one) that indicate a raid
    pub join_threshold: usize,
}

impl Default for RaidRules {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: 60,
            join_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub minimum_account_age_days: u32,
    pub thresholds: Thresholds,
    /// Rule 3 limit; falls back to the `high` threshold when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_risk_score: Option<u32>,
    /// Rule 2 limit, 0..=100
    pub multi_identity_threshold: u8,
    pub weights: Weights,
    pub caps: Caps,
    pub actions: ActionsConfig,
    pub whitelist: Whitelist,
    pub admin_approval: AdminApprovalConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restriction_role_id: Option<RoleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_role_id: Option<RoleId>,
    pub ignore_automated_accounts: bool,
    pub username: UsernameRules,
    pub raid: RaidRules,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            minimum_account_age_days: 7,
            thresholds: Thresholds::default(),
            max_risk_score: None,
            multi_identity_threshold: 70,
            weights: Weights::default(),
            caps: Caps::default(),
            actions: ActionsConfig::default(),
            whitelist: Whitelist::default(),
            admin_approval: AdminApprovalConfig::default(),
            notification_channel: None,
            restriction_role_id: Some("restricted".to_string()),
            verified_role_id: None,
            ignore_automated_accounts: true,
            username: UsernameRules::default(),
            raid: RaidRules::default(),
        }
    }
}

impl PolicyConfig {
    pub fn effective_max_risk_score(&self) -> u32 {
        self.max_risk_score.unwrap_or(self.thresholds.high)
    }

    fn needs_restriction_role(&self) -> bool {
        self.actions
            .iter()
            .any(|v| matches!(v, Verdict::Quarantine | Verdict::AdminApproval))
            || self.raid.enabled
            || matches!(self.admin_approval.default_action, TimeoutAction::Quarantine)
    }

    /// Reject configurations the pipeline cannot run safely with.
    pub fn validate(&self, community: &str) -> Result<(), WardenError> {
        if !self.thresholds.is_ascending() {
            return Err(WardenError::config_invalid(
                community,
                format!(
                    "thresholds must be strictly ascending (medium {} < high {} < critical {})",
                    self.thresholds.medium, self.thresholds.high, self.thresholds.critical
                ),
            ));
        }
        if self.multi_identity_threshold > 100 {
            return Err(WardenError::config_invalid(
                community,
                "multi_identity_threshold must be within 0..=100",
            ));
        }
        if self.admin_approval.enabled && self.admin_approval.timeout_minutes == 0 {
            return Err(WardenError::config_invalid(
                community,
                "admin_approval.timeout_minutes must be positive",
            ));
        }
        if self.needs_restriction_role() && self.restriction_role_id.is_none() {
            return Err(WardenError::config_invalid(
                community,
                "restriction_role_id is required for quarantine or admin approval",
            ));
        }
        if self.raid.enabled
            && (!(1..=MAX_RAID_WINDOW_SECONDS).contains(&self.raid.window_seconds)
                || self.raid.join_threshold < 2)
        {
            return Err(WardenError::config_invalid(
                community,
                format!(
                    "raid rules need a window within 1..={MAX_RAID_WINDOW_SECONDS}s and a join_threshold of at least 2"
                ),
            ));
        }
        for pattern in &self.username.patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(WardenError::config_invalid(
                    community,
                    format!("invalid username pattern '{pattern}': {e}"),
                ));
            }
        }
        Ok(())
    }

    /// Apply a patch and return the resulting config; `self` is left untouched.
    pub fn patched(&self, patch: &ConfigPatch) -> PolicyConfig {
        let mut next = self.clone();
        if let Some(v) = patch.enabled {
            next.enabled = v;
        }
        if let Some(v) = patch.minimum_account_age_days {
            next.minimum_account_age_days = v;
        }
        if let Some(v) = &patch.thresholds {
            next.thresholds = v.clone();
        }
        if patch.clear_max_risk_score {
            next.max_risk_score = None;
        }
        if let Some(v) = patch.max_risk_score {
            next.max_risk_score = Some(v);
        }
        if let Some(v) = patch.ignore_automated_accounts {
            next.ignore_automated_accounts = v;
        }
        if let Some(v) = patch.multi_identity_threshold {
            next.multi_identity_threshold = v;
        }
        if let Some(v) = &patch.weights {
            next.weights = v.clone();
        }
        if let Some(v) = &patch.caps {
            next.caps = v.clone();
        }
        if let Some(v) = &patch.actions {
            next.actions = v.clone();
        }
        if let Some(v) = &patch.admin_approval {
            next.admin_approval = v.clone();
        }
        if let Some(v) = &patch.notification_channel {
            next.notification_channel = Some(v.clone());
        }
        if let Some(v) = &patch.restriction_role_id {
            next.restriction_role_id = Some(v.clone());
        }
        if let Some(v) = &patch.verified_role_id {
            next.verified_role_id = Some(v.clone());
        }
        if let Some(v) = &patch.username {
            next.username = v.clone();
        }
        if let Some(v) = &patch.raid {
            next.raid = v.clone();
        }
        for id in &patch.whitelist_add_identities {
            next.whitelist.identity_ids.insert(id.clone());
        }
        for id in &patch.whitelist_remove_identities {
            next.whitelist.identity_ids.remove(id);
        }
        for role in &patch.whitelist_add_roles {
            next.whitelist.role_ids.insert(role.clone());
        }
        for role in &patch.whitelist_remove_roles {
            next.whitelist.role_ids.remove(role);
        }
        next
    }
}

/// Partial update accepted by [`ConfigStore::set_config`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub minimum_account_age_days: Option<u32>,
    pub thresholds: Option<Thresholds>,
    pub max_risk_score: Option<u32>,
    /// Fall back to the `high` threshold again
    pub clear_max_risk_score: bool,
    pub multi_identity_threshold: Option<u8>,
    pub weights: Option<Weights>,
    pub caps: Option<Caps>,
    pub actions: Option<ActionsConfig>,
    pub admin_approval: Option<AdminApprovalConfig>,
    pub notification_channel: Option<String>,
    pub restriction_role_id: Option<RoleId>,
    pub verified_role_id: Option<RoleId>,
    pub ignore_automated_accounts: Option<bool>,
    pub username: Option<UsernameRules>,
    pub raid: Option<RaidRules>,
    pub whitelist_add_identities: Vec<IdentityId>,
    pub whitelist_remove_identities: Vec<IdentityId>,
    pub whitelist_add_roles: Vec<RoleId>,
    pub whitelist_remove_roles: Vec<RoleId>,
}

impl AppConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn policy_for(&self, community: &str) -> &PolicyConfig {
        self.communities
            .get(community)
            .unwrap_or(&self.default_policy)
    }

    /// Validate the service section and every policy; returns one error per
    /// invalid section.
    pub fn invalid_policies(&self) -> Vec<WardenError> {
        let mut errors = Vec::new();
        if let Err(e) = self.service.validate() {
            errors.push(e);
        }
        if let Err(e) = self.default_policy.validate("<default>") {
            errors.push(e);
        }
        for (community, policy) in &self.communities {
            if let Err(e) = policy.validate(community) {
                errors.push(e);
            }
        }
        errors
    }
}

/// Per-community configuration source consumed by the pipeline
pub trait ConfigStore: Send + Sync {
    fn get_config(&self, community: &str) -> PolicyConfig;

    /// Apply a patch. Invalid results are rejected and the stored config is kept.
    fn set_config(&self, community: &str, patch: &ConfigPatch) -> Result<PolicyConfig, WardenError>;
}

/// Config store seeded from the YAML file and updated in memory
pub struct InMemoryConfigStore {
    default_policy: PolicyConfig,
    communities: RwLock<HashMap<CommunityId, PolicyConfig>>,
}

impl InMemoryConfigStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            default_policy: config.default_policy.clone(),
            communities: RwLock::new(
                config
                    .communities
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }

    pub fn with_policy(community: &str, policy: PolicyConfig) -> Self {
        let mut communities = HashMap::new();
        communities.insert(community.to_string(), policy);
        Self {
            default_policy: PolicyConfig::default(),
            communities: RwLock::new(communities),
        }
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn get_config(&self, community: &str) -> PolicyConfig {
        match self.communities.read() {
            Ok(map) => map
                .get(community)
                .cloned()
                .unwrap_or_else(|| self.default_policy.clone()),
            Err(poisoned) => poisoned
                .into_inner()
                .get(community)
                .cloned()
                .unwrap_or_else(|| self.default_policy.clone()),
        }
    }

    fn set_config(&self, community: &str, patch: &ConfigPatch) -> Result<PolicyConfig, WardenError> {
        // Read, patch and write under one lock so concurrent patches compose
        let mut map = self
            .communities
            .write()
            .map_err(|e| WardenError::Storage(e.to_string()))?;
        let next = map
            .get(community)
            .unwrap_or(&self.default_policy)
            .patched(patch);
        next.validate(community)?;
        map.insert(community.to_string(), next.clone());
        log::info!("Updated policy for community {community}");
        Ok(next)
    }
}
