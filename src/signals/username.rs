use crate::config::UsernameRules;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsernameVerdict {
    pub suspicious: bool,
    pub reasons: Vec<String>,
}

/// Pluggable username heuristic. Rules come from the community's policy so
/// one strategy instance can serve every community.
pub trait UsernameSuspicionStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn assess(&self, username: &str, rules: &UsernameRules) -> UsernameVerdict;
}

/// Keyword, regex and symbol-run checks driven entirely by configuration
#[derive(Default)]
pub struct KeywordUsernameStrategy {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl KeywordUsernameStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern_matches(&self, pattern: &str, username: &str) -> bool {
        let mut cache = match self.compiled.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !cache.contains_key(pattern) {
            match Regex::new(pattern) {
                Ok(re) => {
                    cache.insert(pattern.to_string(), re);
                }
                Err(e) => {
                    log::warn!("Skipping invalid username pattern '{pattern}': {e}");
                    return false;
                }
            }
        }
        cache
            .get(pattern)
            .map(|re| re.is_match(username))
            .unwrap_or(false)
    }
}

/// Lowercase and turn separators into single spaces so "Free_Nitro" and
/// "free.nitro" both hit the "free nitro" keyword.
fn flatten(username: &str) -> String {
    let mut out = String::with_capacity(username.len());
    let mut last_space = true;
    for ch in username.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Three or more identical non-alphanumeric characters in a row
fn has_repeated_symbols(s: &str) -> bool {
    let mut prev: Option<char> = None;
    let mut run = 0;
    for ch in s.chars() {
        if Some(ch) == prev {
            run += 1;
            if run >= 2 && !ch.is_alphanumeric() && !ch.is_whitespace() {
                return true;
            }
        } else {
            prev = Some(ch);
            run = 0;
        }
    }
    false
}

impl UsernameSuspicionStrategy for KeywordUsernameStrategy {
    fn name(&self) -> &str {
        "keyword"
    }

    fn assess(&self, username: &str, rules: &UsernameRules) -> UsernameVerdict {
        let mut reasons = Vec::new();
        let flat = flatten(username);

        for keyword in &rules.keywords {
            let needle = flatten(keyword);
            if !needle.is_empty() && flat.contains(&needle) {
                reasons.push(format!("username contains '{keyword}'"));
            }
        }

        for pattern in &rules.patterns {
            if self.pattern_matches(pattern, username) {
                reasons.push(format!("username matches /{pattern}/"));
            }
        }

        if rules.flag_repeated_symbols && has_repeated_symbols(username) {
            reasons.push("username has repeated symbol runs".to_string());
        }

        UsernameVerdict {
            suspicious: !reasons.is_empty(),
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> UsernameRules {
        UsernameRules {
            keywords: vec!["free nitro".to_string(), "support team".to_string()],
            patterns: vec![r"(?i)^mod\d+$".to_string()],
            flag_repeated_symbols: true,
        }
    }

    #[test]
    fn test_keywords_ignore_separators_and_case() {
        let strategy = KeywordUsernameStrategy::new();
        let verdict = strategy.assess("FREE_Nitro.gifts", &rules());
        assert!(verdict.suspicious);
        assert_eq!(verdict.reasons.len(), 1);

        assert!(strategy.assess("Support-Team", &rules()).suspicious);
        assert!(!strategy.assess("nitrogen_fan", &rules()).suspicious);
    }

    #[test]
    fn test_patterns_and_symbol_runs() {
        let strategy = KeywordUsernameStrategy::new();
        assert!(strategy.assess("MOD42", &rules()).suspicious);
        assert!(strategy.assess("hey!!!", &rules()).suspicious);
        assert!(!strategy.assess("hey!!", &rules()).suspicious);
        assert!(!strategy.assess("aaaa", &rules()).suspicious);

        let mut relaxed = rules();
        relaxed.flag_repeated_symbols = false;
        assert!(!strategy.assess("hey!!!", &relaxed).suspicious);
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let strategy = KeywordUsernameStrategy::new();
        let mut broken = rules();
        broken.patterns = vec!["([".to_string()];
        assert!(!strategy.assess("anything", &broken).suspicious);
    }
}
