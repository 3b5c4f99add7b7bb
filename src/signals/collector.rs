use crate::config::{BanLookupLimits, PolicyConfig};
use crate::error::WardenError;
use crate::model::{GlobalFlag, Identity, Membership, SignalSet};
use crate::signals::bans::{count_cross_community_bans, BanLookup};
use crate::signals::username::UsernameSuspicionStrategy;
use crate::store::{FlagRegistry, WarningStore};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Gathers the evidence for one join. Read-only: nothing here writes to a
/// store or the platform.
pub struct SignalCollector {
    warnings: Arc<dyn WarningStore>,
    flags: Arc<dyn FlagRegistry>,
    bans: Arc<dyn BanLookup>,
    username: Arc<dyn UsernameSuspicionStrategy>,
    ban_limits: BanLookupLimits,
}

async fn within<T, F>(probe: &str, deadline: Instant, fut: F) -> Result<T, WardenError>
where
    F: Future<Output = Result<T, WardenError>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(WardenError::signal_unavailable(probe, "analysis deadline exceeded")),
    }
}

/// Substitute the neutral value for a failed probe and remember that we did.
fn settle<T>(probe: &str, result: Result<T, WardenError>, neutral: T, degraded: &mut Vec<String>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::warn!("{e}; using neutral value");
            degraded.push(probe.to_string());
            neutral
        }
    }
}

impl SignalCollector {
    pub fn new(
        warnings: Arc<dyn WarningStore>,
        flags: Arc<dyn FlagRegistry>,
        bans: Arc<dyn BanLookup>,
        username: Arc<dyn UsernameSuspicionStrategy>,
        ban_limits: BanLookupLimits,
    ) -> Self {
        Self {
            warnings,
            flags,
            bans,
            username,
            ban_limits,
        }
    }

    /// Run every probe concurrently. Probes still running at `deadline` are
    /// abandoned and count as neutral. Never fails.
    pub async fn collect(
        &self,
        identity: &Identity,
        membership: &Membership,
        policy: &PolicyConfig,
        deadline: Instant,
        at: DateTime<Utc>,
    ) -> SignalSet {
        let community = membership.community_id.as_str();
        let identity_id = identity.id.as_str();

        let warnings_probe = within("warnings", deadline, async {
            self.warnings.warnings(community, identity_id)
        });
        let flag_probe = within("global_flag", deadline, async {
            self.flags.get_flag(identity_id)
        });
        let bans_probe = within(
            "cross_community_bans",
            deadline,
            count_cross_community_bans(self.bans.as_ref(), identity_id, community, &self.ban_limits),
        );
        let username_probe = within("username", deadline, async {
            Ok(self.username.assess(&identity.username, &policy.username))
        });

        let (warnings, flag, bans, username) =
            tokio::join!(warnings_probe, flag_probe, bans_probe, username_probe);

        let mut signals = SignalSet::neutral(identity, membership, at);
        let mut degraded = Vec::new();

        signals.warnings_count = settle("warnings", warnings, 0, &mut degraded);
        signals.global_flag = settle::<Option<GlobalFlag>>("global_flag", flag, None, &mut degraded);
        signals.cross_community_ban_count =
            settle("cross_community_bans", bans, 0, &mut degraded);
        let username = settle("username", username, Default::default(), &mut degraded);
        signals.username_suspicious = username.suspicious;
        signals.username_reasons = username.reasons;
        signals.degraded = degraded;

        log::debug!(
            "Signals for {} in {}: age {}d, warnings {}, bans {}, flagged {}, degraded {:?}",
            identity_id,
            community,
            signals.age_days,
            signals.warnings_count,
            signals.cross_community_ban_count,
            signals.global_flag.is_some(),
            signals.degraded
        );

        signals
    }
}
