//! Storage collaborators owned by the pipeline: verification cases, the global
//! flag registry and per-community warning counters.
//!
//! Two implementations are provided. `MemoryStore` backs tests and dry runs,
//! `JsonFileStore` writes each registry to its own JSON file under the data
//! directory so that pending timer deadlines survive a restart.
//!
//! Only open cases are kept for good. A terminal case has already been
//! archived to the audit log; the store keeps a bounded number of them around
//! to acknowledge late decisions, and remembers bans in a compact per-identity
//! index used for cross-community lookups.

use crate::error::{Result, WardenError};
use crate::model::{CommunityId, GlobalFlag, IdentityId};
use crate::verification::state::{CaseState, VerificationCase};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub trait CaseStore: Send + Sync {
    fn get_case(&self, case_id: &str) -> Result<Option<VerificationCase>>;
    fn put_case(&self, case: &VerificationCase) -> Result<()>;
    fn find_open_case(&self, identity: &str, community: &str) -> Result<Option<VerificationCase>>;
    fn list_open_cases(&self) -> Result<Vec<VerificationCase>>;
    /// Communities where a case for `identity` ended in BANNED
    fn banned_communities(&self, identity: &str) -> Result<BTreeSet<CommunityId>>;
}

/// Shared across every community served
pub trait FlagRegistry: Send + Sync {
    fn get_flag(&self, identity: &str) -> Result<Option<GlobalFlag>>;
    fn set_flag(&self, identity: &str, flag: GlobalFlag) -> Result<()>;
    fn delete_flag(&self, identity: &str) -> Result<bool>;
}

pub trait WarningStore: Send + Sync {
    fn warnings(&self, community: &str, identity: &str) -> Result<u32>;
    fn add_warning(&self, community: &str, identity: &str) -> Result<u32>;
    fn clear_warnings(&self, community: &str, identity: &str) -> Result<()>;
}

fn warning_key(community: &str, identity: &str) -> String {
    format!("{community}/{identity}")
}

/// Terminal cases kept in memory after they leave the live set
pub const RETAINED_CLOSED_CASES: usize = 1024;

/// What a `put` changed, so file-backed stores rewrite only what they must
struct PutEffect {
    open_set_changed: bool,
    bans_changed: bool,
}

#[derive(Default)]
struct Registries {
    cases: BTreeMap<String, VerificationCase>,
    closed: VecDeque<String>,
    bans: BTreeMap<IdentityId, BTreeSet<CommunityId>>,
    flags: BTreeMap<IdentityId, GlobalFlag>,
    warnings: BTreeMap<String, u32>,
}

impl Registries {
    fn put(&mut self, case: &VerificationCase) -> PutEffect {
        let was_open = self
            .cases
            .get(&case.case_id)
            .map(|c| c.is_open())
            .unwrap_or(false);
        let mut bans_changed = false;
        if case.state == CaseState::Banned {
            bans_changed = self
                .bans
                .entry(case.identity_id.clone())
                .or_default()
                .insert(case.community_id.clone());
        }

        let newly_closed = !case.is_open()
            && (was_open || !self.cases.contains_key(&case.case_id));
        self.cases.insert(case.case_id.clone(), case.clone());
        if newly_closed {
            self.closed.push_back(case.case_id.clone());
            while self.closed.len() > RETAINED_CLOSED_CASES {
                if let Some(oldest) = self.closed.pop_front() {
                    self.cases.remove(&oldest);
                }
            }
        }

        PutEffect {
            open_set_changed: was_open || case.is_open(),
            bans_changed,
        }
    }

    fn find_open(&self, identity: &str, community: &str) -> Option<VerificationCase> {
        self.cases
            .values()
            .find(|c| c.is_open() && c.identity_id == identity && c.community_id == community)
            .cloned()
    }

    fn open_cases(&self) -> Vec<VerificationCase> {
        self.cases.values().filter(|c| c.is_open()).cloned().collect()
    }

    fn banned_in(&self, identity: &str) -> BTreeSet<CommunityId> {
        self.bans.get(identity).cloned().unwrap_or_default()
    }
}

fn lock(registries: &Mutex<Registries>) -> Result<MutexGuard<'_, Registries>> {
    registries
        .lock()
        .map_err(|e| WardenError::Storage(format!("store lock poisoned: {e}")))
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Registries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaseStore for MemoryStore {
    fn get_case(&self, case_id: &str) -> Result<Option<VerificationCase>> {
        Ok(lock(&self.inner)?.cases.get(case_id).cloned())
    }

    fn put_case(&self, case: &VerificationCase) -> Result<()> {
        lock(&self.inner)?.put(case);
        Ok(())
    }

    fn find_open_case(&self, identity: &str, community: &str) -> Result<Option<VerificationCase>> {
        Ok(lock(&self.inner)?.find_open(identity, community))
    }

    fn list_open_cases(&self) -> Result<Vec<VerificationCase>> {
        Ok(lock(&self.inner)?.open_cases())
    }

    fn banned_communities(&self, identity: &str) -> Result<BTreeSet<CommunityId>> {
        Ok(lock(&self.inner)?.banned_in(identity))
    }
}

impl FlagRegistry for MemoryStore {
    fn get_flag(&self, identity: &str) -> Result<Option<GlobalFlag>> {
        Ok(lock(&self.inner)?.flags.get(identity).cloned())
    }

    fn set_flag(&self, identity: &str, flag: GlobalFlag) -> Result<()> {
        lock(&self.inner)?.flags.insert(identity.to_string(), flag);
        Ok(())
    }

    fn delete_flag(&self, identity: &str) -> Result<bool> {
        Ok(lock(&self.inner)?.flags.remove(identity).is_some())
    }
}

impl WarningStore for MemoryStore {
    fn warnings(&self, community: &str, identity: &str) -> Result<u32> {
        Ok(lock(&self.inner)?
            .warnings
            .get(&warning_key(community, identity))
            .copied()
            .unwrap_or(0))
    }

    fn add_warning(&self, community: &str, identity: &str) -> Result<u32> {
        let mut inner = lock(&self.inner)?;
        let count = inner
            .warnings
            .entry(warning_key(community, identity))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn clear_warnings(&self, community: &str, identity: &str) -> Result<()> {
        lock(&self.inner)?
            .warnings
            .remove(&warning_key(community, identity));
        Ok(())
    }
}

/// Write-through JSON persistence. A mutation rewrites only the file it
/// affects; `cases.json` holds open cases only, so its size tracks the
/// backlog rather than history.
pub struct JsonFileStore {
    dir: PathBuf,
    inner: Mutex<Registries>,
}

const CASES_FILE: &str = "cases.json";
const FLAGS_FILE: &str = "global_flags.json";
const WARNINGS_FILE: &str = "warnings.json";
const BANS_FILE: &str = "bans.json";

impl JsonFileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let cases: Vec<VerificationCase> = read_json(&dir.join(CASES_FILE))?.unwrap_or_default();
        let flags = read_json(&dir.join(FLAGS_FILE))?.unwrap_or_default();
        let warnings = read_json(&dir.join(WARNINGS_FILE))?.unwrap_or_default();
        let bans = read_json(&dir.join(BANS_FILE))?.unwrap_or_default();

        let mut registries = Registries {
            flags,
            warnings,
            bans,
            ..Registries::default()
        };
        // Files written before terminal cases were retired may still hold
        // them; fold their bans into the index and drop them.
        let mut retired = 0usize;
        for case in cases {
            if case.is_open() {
                registries.cases.insert(case.case_id.clone(), case);
            } else {
                if case.state == CaseState::Banned {
                    registries
                        .bans
                        .entry(case.identity_id.clone())
                        .or_default()
                        .insert(case.community_id.clone());
                }
                retired += 1;
            }
        }

        log::info!(
            "Loaded {} open case(s) from {}",
            registries.cases.len(),
            dir.display()
        );

        let store = Self {
            dir,
            inner: Mutex::new(registries),
        };
        if retired > 0 {
            log::info!("Retired {retired} closed case(s) from {CASES_FILE}");
            let inner = lock(&store.inner)?;
            store.persist_cases(&inner)?;
            store.persist_bans(&inner)?;
        }
        Ok(store)
    }

    fn persist_cases(&self, registries: &Registries) -> Result<()> {
        let cases: Vec<&VerificationCase> = registries.cases.values().filter(|c| c.is_open()).collect();
        write_json(&self.dir.join(CASES_FILE), &cases)
    }

    fn persist_bans(&self, registries: &Registries) -> Result<()> {
        write_json(&self.dir.join(BANS_FILE), &registries.bans)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&content)?))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl CaseStore for JsonFileStore {
    fn get_case(&self, case_id: &str) -> Result<Option<VerificationCase>> {
        Ok(lock(&self.inner)?.cases.get(case_id).cloned())
    }

    fn put_case(&self, case: &VerificationCase) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        let effect = inner.put(case);
        if effect.bans_changed {
            self.persist_bans(&inner)?;
        }
        if effect.open_set_changed {
            self.persist_cases(&inner)?;
        }
        Ok(())
    }

    fn find_open_case(&self, identity: &str, community: &str) -> Result<Option<VerificationCase>> {
        Ok(lock(&self.inner)?.find_open(identity, community))
    }

    fn list_open_cases(&self) -> Result<Vec<VerificationCase>> {
        Ok(lock(&self.inner)?.open_cases())
    }

    fn banned_communities(&self, identity: &str) -> Result<BTreeSet<CommunityId>> {
        Ok(lock(&self.inner)?.banned_in(identity))
    }
}

impl FlagRegistry for JsonFileStore {
    fn get_flag(&self, identity: &str) -> Result<Option<GlobalFlag>> {
        Ok(lock(&self.inner)?.flags.get(identity).cloned())
    }

    fn set_flag(&self, identity: &str, flag: GlobalFlag) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        inner.flags.insert(identity.to_string(), flag);
        write_json(&self.dir.join(FLAGS_FILE), &inner.flags)
    }

    fn delete_flag(&self, identity: &str) -> Result<bool> {
        let mut inner = lock(&self.inner)?;
        let removed = inner.flags.remove(identity).is_some();
        if removed {
            write_json(&self.dir.join(FLAGS_FILE), &inner.flags)?;
        }
        Ok(removed)
    }
}

impl WarningStore for JsonFileStore {
    fn warnings(&self, community: &str, identity: &str) -> Result<u32> {
        Ok(lock(&self.inner)?
            .warnings
            .get(&warning_key(community, identity))
            .copied()
            .unwrap_or(0))
    }

    fn add_warning(&self, community: &str, identity: &str) -> Result<u32> {
        let mut inner = lock(&self.inner)?;
        let count = {
            let entry = inner
                .warnings
                .entry(warning_key(community, identity))
                .or_insert(0);
            *entry += 1;
            *entry
        };
        write_json(&self.dir.join(WARNINGS_FILE), &inner.warnings)?;
        Ok(count)
    }

    fn clear_warnings(&self, community: &str, identity: &str) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        if inner
            .warnings
            .remove(&warning_key(community, identity))
            .is_some()
        {
            write_json(&self.dir.join(WARNINGS_FILE), &inner.warnings)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::state::{CaseState, SYSTEM_ACTOR};
    use chrono::{Duration, Utc};

    #[test]
    fn test_memory_store_open_case_lookup() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut case = VerificationCase::new("u1", "c1", now);
        store.put_case(&case).unwrap();
        assert!(store.find_open_case("u1", "c1").unwrap().is_some());
        assert!(store.find_open_case("u1", "c2").unwrap().is_none());

        case.transition(CaseState::Approved, SYSTEM_ACTOR, "approve", vec![], now)
            .unwrap();
        store.put_case(&case).unwrap();
        assert!(store.find_open_case("u1", "c1").unwrap().is_none());
        assert!(store.get_case(&case.case_id).unwrap().is_some());
    }

    #[test]
    fn test_warning_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.warnings("c1", "u1").unwrap(), 0);
        store.add_warning("c1", "u1").unwrap();
        assert_eq!(store.add_warning("c1", "u1").unwrap(), 2);
        assert_eq!(store.warnings("c2", "u1").unwrap(), 0);
        store.clear_warnings("c1", "u1").unwrap();
        assert_eq!(store.warnings("c1", "u1").unwrap(), 0);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let deadline = now + Duration::minutes(45);

        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            let mut case = VerificationCase::new("u1", "c1", now);
            case.transition(CaseState::PendingAdmin, SYSTEM_ACTOR, "admin_approval", vec![], now)
                .unwrap();
            case.pending_timer_deadline = Some(deadline);
            store.put_case(&case).unwrap();
            store
                .set_flag(
                    "u9",
                    GlobalFlag {
                        reason: "scam links".to_string(),
                        actor_id: "admin-1".to_string(),
                        flagged_at: now,
                    },
                )
                .unwrap();
            store.add_warning("c1", "u1").unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        let open = reopened.list_open_cases().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].state, CaseState::PendingAdmin);
        assert_eq!(open[0].pending_timer_deadline, Some(deadline));
        assert_eq!(reopened.get_flag("u9").unwrap().unwrap().reason, "scam links");
        assert_eq!(reopened.warnings("c1", "u1").unwrap(), 1);
        assert!(reopened.delete_flag("u9").unwrap());
        assert!(!reopened.delete_flag("u9").unwrap());
    }

    fn closed(identity: &str, community: &str, state: CaseState) -> VerificationCase {
        let now = Utc::now();
        let mut case = VerificationCase::new(identity, community, now);
        case.transition(state, SYSTEM_ACTOR, "resolve", vec![], now)
            .unwrap();
        case
    }

    #[test]
    fn test_closed_cases_leave_the_case_file() {
        let dir = tempfile::tempdir().unwrap();
        let approved = closed("u2", "c1", CaseState::Approved);
        let banned_id = {
            let store = JsonFileStore::open(dir.path()).unwrap();
            let mut case = VerificationCase::new("u1", "c1", Utc::now());
            store.put_case(&case).unwrap();
            case.transition(CaseState::Banned, SYSTEM_ACTOR, "ban", vec![], Utc::now())
                .unwrap();
            store.put_case(&case).unwrap();
            store.put_case(&approved).unwrap();

            // Still answerable in this process for late decisions
            assert_eq!(
                store.get_case(&case.case_id).unwrap().unwrap().state,
                CaseState::Banned
            );
            let on_disk: Vec<VerificationCase> =
                read_json(&dir.path().join(CASES_FILE)).unwrap().unwrap();
            assert!(on_disk.is_empty());
            case.case_id
        };

        let reopened = JsonFileStore::open(dir.path()).unwrap();
        assert!(reopened.get_case(&approved.case_id).unwrap().is_none());
        assert!(reopened.get_case(&banned_id).unwrap().is_none());
        assert!(reopened.banned_communities("u1").unwrap().contains("c1"));
        assert!(reopened.banned_communities("u2").unwrap().is_empty());
    }

    #[test]
    fn test_legacy_closed_cases_fold_into_ban_index() {
        let dir = tempfile::tempdir().unwrap();
        let pending = VerificationCase::new("u3", "c1", Utc::now());
        let legacy = vec![
            closed("u1", "c2", CaseState::Banned),
            closed("u2", "c1", CaseState::Kicked),
            pending.clone(),
        ];
        write_json(&dir.path().join(CASES_FILE), &legacy).unwrap();

        let store = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(store.list_open_cases().unwrap(), vec![pending]);
        assert!(store.banned_communities("u1").unwrap().contains("c2"));
        let on_disk: Vec<VerificationCase> =
            read_json(&dir.path().join(CASES_FILE)).unwrap().unwrap();
        assert_eq!(on_disk.len(), 1);
    }

    #[test]
    fn test_closed_case_retention_is_bounded() {
        let store = MemoryStore::new();
        let first = closed("u0", "c1", CaseState::Approved);
        store.put_case(&first).unwrap();
        for i in 1..=RETAINED_CLOSED_CASES {
            store
                .put_case(&closed(&format!("u{i}"), "c1", CaseState::Approved))
                .unwrap();
        }
        assert!(store.get_case(&first.case_id).unwrap().is_none());
        assert_eq!(lock(&store.inner).unwrap().cases.len(), RETAINED_CLOSED_CASES);
    }
}
