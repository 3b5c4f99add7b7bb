//! Multi-identity (alt account / ban evasion) detection.
//!
//! Each community keeps a bounded window of recently seen identities. A new
//! identity is compared against the newest entries of that window only, so
//! the cost of one join is capped regardless of community size.

use crate::config::{DetectorConfig, MAX_WINDOW_TTL_HOURS};
use crate::model::{CommunityId, Identity, IdentityId, IdentityMatch};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Minimum username similarity (percent) that counts as a name match
const NAME_MATCH_FLOOR: u8 = 70;
const NAME_WEIGHT_PERCENT: u32 = 60;
const AVATAR_POINTS: u32 = 30;
const CREATION_CLUSTER_POINTS: u32 = 15;
const REMOVED_IDENTITY_POINTS: u32 = 15;

#[derive(Debug, Clone)]
struct WindowEntry {
    identity_id: IdentityId,
    normalized_name: String,
    avatar_hash: Option<String>,
    created_at: DateTime<Utc>,
    seen_at: DateTime<Utc>,
    removed: bool,
}

pub struct MultiIdentityDetector {
    config: DetectorConfig,
    windows: Mutex<HashMap<CommunityId, VecDeque<WindowEntry>>>,
}

/// Combine per-match similarities into the single confidence the policy
/// engine compares against `multi_identity_threshold`. The strongest match
/// wins; weaker matches do not add up.
pub fn aggregate_confidence(matches: &[IdentityMatch]) -> u8 {
    matches.iter().map(|m| m.similarity).max().unwrap_or(0)
}

impl MultiIdentityDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Top matches for `identity` among recent identities of `community`,
    /// strongest first.
    pub fn detect(&self, identity: &Identity, community: &str, at: DateTime<Utc>) -> Vec<IdentityMatch> {
        let candidate_name = normalize_name(&identity.username);
        let ttl = Duration::hours(self.config.window_ttl_hours.clamp(0, MAX_WINDOW_TTL_HOURS));

        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(window) = windows.get_mut(community) else {
            return Vec::new();
        };
        window.retain(|e| at - e.seen_at <= ttl);

        let mut matches: Vec<IdentityMatch> = window
            .iter()
            .rev()
            .filter(|e| e.identity_id != identity.id)
            .take(self.config.max_comparisons)
            .filter_map(|entry| self.compare(identity, &candidate_name, entry))
            .filter(|m| m.similarity >= self.config.min_match_similarity)
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .cmp(&a.similarity)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });
        matches.truncate(self.config.max_matches);
        matches
    }

    fn compare(&self, identity: &Identity, candidate_name: &str, entry: &WindowEntry) -> Option<IdentityMatch> {
        let mut points = 0u32;
        let mut reasons = Vec::new();
        let mut strong_signal = false;

        let name_sim = name_similarity(candidate_name, &entry.normalized_name);
        if name_sim >= NAME_MATCH_FLOOR {
            points += name_sim as u32 * NAME_WEIGHT_PERCENT / 100;
            reasons.push(format!("username {}% similar", name_sim));
            strong_signal = true;
        }

        if let (Some(a), Some(b)) = (&identity.avatar_hash, &entry.avatar_hash) {
            if a == b {
                points += AVATAR_POINTS;
                reasons.push("identical avatar".to_string());
                strong_signal = true;
            }
        }

        if !strong_signal {
            return None;
        }

        let gap = (identity.created_at - entry.created_at).num_minutes().abs();
        if gap <= self.config.creation_cluster_minutes {
            points += CREATION_CLUSTER_POINTS;
            reasons.push(format!("accounts created {gap} min apart"));
        }

        if entry.removed {
            points += REMOVED_IDENTITY_POINTS;
            reasons.push("resembles a recently removed identity".to_string());
        }

        Some(IdentityMatch {
            candidate_id: entry.identity_id.clone(),
            similarity: points.min(100) as u8,
            reasons,
        })
    }

    /// Remember `identity` as seen in `community`.
    pub fn record(&self, identity: &Identity, community: &str, at: DateTime<Utc>) {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows.entry(community.to_string()).or_default();
        let removed = window
            .iter()
            .find(|e| e.identity_id == identity.id)
            .map(|e| e.removed)
            .unwrap_or(false);
        window.retain(|e| e.identity_id != identity.id);
        window.push_back(WindowEntry {
            identity_id: identity.id.clone(),
            normalized_name: normalize_name(&identity.username),
            avatar_hash: identity.avatar_hash.clone(),
            created_at: identity.created_at,
            seen_at: at,
            removed,
        });
        while window.len() > self.config.window_capacity {
            window.pop_front();
        }
    }

    /// Flag a kicked or banned identity so lookalikes score higher.
    pub fn mark_removed(&self, identity_id: &str, community: &str) {
        let mut windows = match self.windows.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = windows
            .get_mut(community)
            .and_then(|w| w.iter_mut().find(|e| e.identity_id == identity_id))
        {
            entry.removed = true;
        }
    }
}

/// Lowercase, fold common look-alike characters and drop everything that is
/// not a letter or digit.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .flat_map(|c| c.to_lowercase())
        .filter_map(fold_confusable)
        .collect()
}

fn fold_confusable(ch: char) -> Option<char> {
    let folded = match ch {
        '0' => 'o',
        '1' | '!' | '|' => 'l',
        '3' => 'e',
        '4' | '@' => 'a',
        '5' | '$' => 's',
        '7' => 't',
        // Cyrillic
        '\u{0430}' => 'a',
        '\u{0435}' => 'e',
        '\u{043E}' => 'o',
        '\u{0440}' => 'p',
        '\u{0441}' => 'c',
        '\u{0445}' => 'x',
        '\u{0443}' => 'y',
        '\u{0456}' => 'i',
        // Greek
        '\u{03B1}' => 'a',
        '\u{03B5}' => 'e',
        '\u{03BF}' => 'o',
        '\u{03C1}' => 'p',
        '\u{03BA}' => 'k',
        '\u{03BD}' => 'v',
        c if c.is_ascii_alphanumeric() => c,
        _ => return None,
    };
    Some(folded)
}

/// Levenshtein similarity in percent. Names shorter than three characters
/// are too ambiguous to compare.
pub fn name_similarity(a: &str, b: &str) -> u8 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if a.len() < 3 || b.len() < 3 {
        return 0;
    }
    let distance = levenshtein(&a, &b);
    ((longest - distance) * 100 / longest) as u8
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str, created_at: DateTime<Utc>, avatar: Option<&str>) -> Identity {
        Identity {
            id: id.to_string(),
            created_at,
            has_custom_avatar: avatar.is_some(),
            avatar_hash: avatar.map(|a| a.to_string()),
            username: name.to_string(),
            is_automated: false,
        }
    }

    #[test]
    fn test_normalize_folds_lookalikes() {
        assert_eq!(normalize_name("J0hn_D03"), "johndoe");
        // Cyrillic а and о
        assert_eq!(normalize_name("p\u{0430}ul_r\u{043E}ss"), "paulross");
    }

    #[test]
    fn test_name_similarity() {
        assert_eq!(name_similarity("johndoe", "johndoe"), 100);
        assert_eq!(name_similarity("johndoe", "johndoes"), 87);
        assert_eq!(name_similarity("ab", "ab"), 0);
        assert!(name_similarity("johndoe", "zzzzzzz") < 20);
    }

    #[test]
    fn test_detects_renamed_alt_with_same_avatar() {
        let detector = MultiIdentityDetector::new(DetectorConfig::default());
        let now = Utc::now();
        let original = identity("u1", "spammer_jim", now - Duration::days(10), Some("abc"));
        detector.record(&original, "c1", now - Duration::hours(1));
        detector.mark_removed("u1", "c1");

        let alt = identity("u2", "spammer_j1m", now - Duration::days(10), Some("abc"));
        let matches = detector.detect(&alt, "c1", now);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].candidate_id, "u1");
        assert_eq!(matches[0].similarity, 100);
        assert!(matches[0]
            .reasons
            .iter()
            .any(|r| r.contains("removed identity")));

        // Other communities have their own window
        assert!(detector.detect(&alt, "c2", now).is_empty());
    }

    #[test]
    fn test_creation_time_alone_is_not_a_match() {
        let detector = MultiIdentityDetector::new(DetectorConfig::default());
        let now = Utc::now();
        detector.record(&identity("u1", "gardener", now, None), "c1", now);
        let other = identity("u2", "astronomy", now, None);
        assert!(detector.detect(&other, "c1", now).is_empty());
    }

    #[test]
    fn test_window_is_bounded_and_expires() {
        let config = DetectorConfig {
            window_capacity: 2,
            window_ttl_hours: 1,
            ..DetectorConfig::default()
        };
        let detector = MultiIdentityDetector::new(config);
        let now = Utc::now();
        let created = now - Duration::days(100);
        detector.record(&identity("u1", "samename", created, None), "c1", now);
        detector.record(&identity("u2", "different", created, None), "c1", now);
        detector.record(&identity("u3", "unrelated", created, None), "c1", now);

        // u1 fell out of the window
        let candidate = identity("u4", "samename", created, None);
        assert!(detector.detect(&candidate, "c1", now).is_empty());

        detector.record(&identity("u5", "samename", created, None), "c1", now);
        assert_eq!(detector.detect(&candidate, "c1", now).len(), 1);
        // and entries expire with the TTL
        assert!(detector
            .detect(&candidate, "c1", now + Duration::hours(2))
            .is_empty());
    }

    #[test]
    fn test_oversized_ttl_does_not_overflow() {
        let detector = MultiIdentityDetector::new(DetectorConfig {
            window_ttl_hours: i64::MAX,
            ..DetectorConfig::default()
        });
        let now = Utc::now();
        detector.record(&identity("u1", "samename", now, None), "c1", now);
        let candidate = identity("u2", "samename", now, None);
        assert_eq!(detector.detect(&candidate, "c1", now).len(), 1);
    }

    #[test]
    fn test_aggregate_confidence_is_max() {
        let matches = vec![
            IdentityMatch {
                candidate_id: "a".to_string(),
                similarity: 55,
                reasons: vec![],
            },
            IdentityMatch {
                candidate_id: "b".to_string(),
                similarity: 80,
                reasons: vec![],
            },
        ];
        assert_eq!(aggregate_confidence(&matches), 80);
        assert_eq!(aggregate_confidence(&[]), 0);
    }
}
