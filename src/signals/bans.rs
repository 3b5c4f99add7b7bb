//! Cross-community ban lookups.
//!
//! Lookups are paginated and capped so one identity with a long history cannot
//! stall a join. The scan stops at whichever limit is hit first: bans found or
//! communities checked.

use crate::config::BanLookupLimits;
use crate::error::WardenError;
use crate::model::CommunityId;
use crate::store::CaseStore;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub community_id: CommunityId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BanPage {
    pub bans: Vec<BanRecord>,
    /// Communities examined to produce this page
    pub communities_scanned: usize,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait BanLookup: Send + Sync {
    /// One page of bans for `identity` outside `exclude_community`.
    async fn bans_page(
        &self,
        identity: &str,
        exclude_community: &str,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<BanPage, WardenError>;
}

/// Count bans elsewhere, stopping early at the configured caps.
pub async fn count_cross_community_bans(
    lookup: &dyn BanLookup,
    identity: &str,
    community: &str,
    limits: &BanLookupLimits,
) -> Result<u32, WardenError> {
    let mut found = 0u32;
    let mut scanned = 0usize;
    let mut cursor = None;

    loop {
        let page = lookup
            .bans_page(identity, community, cursor, limits.page_size.max(1))
            .await?;
        found = found.saturating_add(page.bans.len() as u32);
        scanned += page.communities_scanned;

        if found >= limits.max_ban_matches {
            log::debug!("Ban scan for {identity} stopped at {found} match(es)");
            return Ok(found.min(limits.max_ban_matches));
        }
        if scanned >= limits.max_communities_scanned {
            log::debug!("Ban scan for {identity} stopped after {scanned} communities");
            return Ok(found);
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(found),
        }
    }
}

/// Single-tenant deployments have nothing to look up
pub struct NoBanLookup;

#[async_trait]
impl BanLookup for NoBanLookup {
    async fn bans_page(
        &self,
        _identity: &str,
        _exclude_community: &str,
        _cursor: Option<String>,
        _page_size: usize,
    ) -> Result<BanPage, WardenError> {
        Ok(BanPage::default())
    }
}

/// Bans derived from this service's own case history: every community where a
/// case for the identity ended in BANNED.
pub struct CaseHistoryBanLookup {
    cases: Arc<dyn CaseStore>,
}

impl CaseHistoryBanLookup {
    pub fn new(cases: Arc<dyn CaseStore>) -> Self {
        Self { cases }
    }
}

#[async_trait]
impl BanLookup for CaseHistoryBanLookup {
    async fn bans_page(
        &self,
        identity: &str,
        exclude_community: &str,
        cursor: Option<String>,
        page_size: usize,
    ) -> Result<BanPage, WardenError> {
        let banned = self.cases.banned_communities(identity)?;

        // The index is ordered, so the cursor is just the last community seen
        let remaining: Vec<&CommunityId> = banned
            .iter()
            .filter(|c| c.as_str() != exclude_community)
            .filter(|c| cursor.as_deref().map_or(true, |after| c.as_str() > after))
            .collect();

        let page = &remaining[..remaining.len().min(page_size)];
        let next_cursor = if remaining.len() > page.len() {
            page.last().map(|c| c.to_string())
        } else {
            None
        };

        Ok(BanPage {
            bans: page
                .iter()
                .map(|community| BanRecord {
                    community_id: community.to_string(),
                    reason: Some("banned by join-warden".to_string()),
                })
                .collect(),
            communities_scanned: page.len(),
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::verification::state::{CaseState, VerificationCase, SYSTEM_ACTOR};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every community it scans has banned the identity
    struct EndlessBans {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BanLookup for EndlessBans {
        async fn bans_page(
            &self,
            _identity: &str,
            _exclude_community: &str,
            cursor: Option<String>,
            page_size: usize,
        ) -> Result<BanPage, WardenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
            Ok(BanPage {
                bans: (start..start + page_size)
                    .map(|i| BanRecord {
                        community_id: format!("c{i}"),
                        reason: None,
                    })
                    .collect(),
                communities_scanned: page_size,
                next_cursor: Some((start + page_size).to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_scan_stops_at_match_cap() {
        let lookup = EndlessBans {
            calls: AtomicUsize::new(0),
        };
        let limits = BanLookupLimits {
            page_size: 2,
            max_ban_matches: 5,
            max_communities_scanned: 1000,
        };
        let count = count_cross_community_bans(&lookup, "u1", "home", &limits)
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_scan_stops_at_community_cap() {
        struct CleanPages;

        #[async_trait]
        impl BanLookup for CleanPages {
            async fn bans_page(
                &self,
                _identity: &str,
                _exclude_community: &str,
                _cursor: Option<String>,
                page_size: usize,
            ) -> Result<BanPage, WardenError> {
                Ok(BanPage {
                    bans: Vec::new(),
                    communities_scanned: page_size,
                    next_cursor: Some("more".to_string()),
                })
            }
        }

        let limits = BanLookupLimits {
            page_size: 10,
            max_ban_matches: 5,
            max_communities_scanned: 30,
        };
        let count = count_cross_community_bans(&CleanPages, "u1", "home", &limits)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_case_history_lookup_pages_through_communities() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (community, state) in [
            ("a", CaseState::Banned),
            ("b", CaseState::Approved),
            ("c", CaseState::Banned),
            ("home", CaseState::Banned),
        ] {
            let mut case = VerificationCase::new("u1", community, now);
            case.transition(state, SYSTEM_ACTOR, "ban", vec![], now).unwrap();
            store.put_case(&case).unwrap();
        }

        let lookup = CaseHistoryBanLookup::new(store);
        let limits = BanLookupLimits {
            page_size: 1,
            max_ban_matches: 10,
            max_communities_scanned: 10,
        };
        let count = count_cross_community_bans(&lookup, "u1", "home", &limits)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
