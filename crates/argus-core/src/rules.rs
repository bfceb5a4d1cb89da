//! Block rules and the request matcher.
//!
//! Two kinds of rule exist:
//!
//! - **Domain** rules match the request host by label suffix: the rule
//!   `ads.example.com` matches `ads.example.com` and `x.ads.example.com`
//!   but not `badads.example.com`.
//! - **Keyword** rules match the full request URL by case-insensitive
//!   substring.
//!
//! ## Evaluation Order
//!
//! 1. Domain rules are checked first, most specific suffix first
//! 2. Keyword rules are checked against the full URL
//! 3. No match means the request is forwarded
//!
//! The first matching rule supplies the block reason.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// The kind of a block rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Matches the request host by suffix.
    Domain,
    /// Matches the full URL by substring.
    Keyword,
}

impl RuleKind {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Domain => "domain",
            RuleKind::Keyword => "keyword",
        }
    }

    /// Parse from database string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(RuleKind::Domain),
            "keyword" => Some(RuleKind::Keyword),
            _ => None,
        }
    }

    /// Parses the plural path segment used by the API (`domains`, `keywords`).
    pub fn from_plural(s: &str) -> Option<Self> {
        match s {
            "domains" => Some(RuleKind::Domain),
            "keywords" => Some(RuleKind::Keyword),
            _ => None,
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single block rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub kind: RuleKind,
    pub value: String,
}

impl Rule {
    /// Creates a rule from a raw value, normalizing it first.
    pub fn new(kind: RuleKind, raw: &str) -> Result<Self, RuleError> {
        Ok(Self {
            kind,
            value: normalize(kind, raw)?,
        })
    }

    /// Creates a domain rule.
    pub fn domain(raw: &str) -> Result<Self, RuleError> {
        Self::new(RuleKind::Domain, raw)
    }

    /// Creates a keyword rule.
    pub fn keyword(raw: &str) -> Result<Self, RuleError> {
        Self::new(RuleKind::Keyword, raw)
    }
}

/// Result of a rule match: the rule that fired and the reason to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDecision {
    pub rule: Rule,
    pub reason: String,
}

impl BlockDecision {
    fn new(kind: RuleKind, value: &str) -> Self {
        Self {
            reason: format!("Blocked by {} rule: {}", kind, value),
            rule: Rule {
                kind,
                value: value.to_string(),
            },
        }
    }
}

/// Normalizes a raw rule value.
///
/// Values are trimmed and lower-cased. Domain values additionally lose any
/// scheme, path, port, leading `*.`/`.` and trailing `.`, so that
/// `https://*.Ads.Example.com:443/x` becomes `ads.example.com`.
pub fn normalize(kind: RuleKind, raw: &str) -> Result<String, RuleError> {
    let value = raw.trim().to_lowercase();

    let value = match kind {
        RuleKind::Keyword => value,
        RuleKind::Domain => normalize_domain(&value),
    };

    if value.is_empty() {
        return Err(RuleError::InvalidRule {
            kind,
            reason: "value must not be empty".to_string(),
        });
    }

    if kind == RuleKind::Domain {
        if value.chars().any(char::is_whitespace) {
            return Err(RuleError::InvalidRule {
                kind,
                reason: format!("\"{}\" contains whitespace", value),
            });
        }
        if value.contains("..") {
            return Err(RuleError::InvalidRule {
                kind,
                reason: format!("\"{}\" has an empty label", value),
            });
        }
    }

    Ok(value)
}

fn normalize_domain(value: &str) -> String {
    let without_scheme = match value.find("://") {
        Some(idx) => &value[idx + 3..],
        None => value,
    };
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);

    let mut host = strip_port(authority);
    while let Some(rest) = host.strip_prefix("*.") {
        host = rest;
    }

    host.trim_matches('.').to_string()
}

/// Strips a trailing `:port` from a host, leaving bracketed IPv6 literals intact.
pub fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => authority,
    }
}

/// In-memory matcher over the domain and keyword block lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    domains: BTreeSet<String>,
    keywords: BTreeSet<String>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rule set from already-normalized rules, ignoring duplicates.
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut set = Self::new();
        for rule in rules {
            set.values_mut(rule.kind).insert(rule.value);
        }
        set
    }

    fn values(&self, kind: RuleKind) -> &BTreeSet<String> {
        match kind {
            RuleKind::Domain => &self.domains,
            RuleKind::Keyword => &self.keywords,
        }
    }

    fn values_mut(&mut self, kind: RuleKind) -> &mut BTreeSet<String> {
        match kind {
            RuleKind::Domain => &mut self.domains,
            RuleKind::Keyword => &mut self.keywords,
        }
    }

    /// Returns true if the rule is present.
    pub fn contains(&self, rule: &Rule) -> bool {
        self.values(rule.kind).contains(&rule.value)
    }

    /// Adds a rule, failing if it is already present.
    pub fn insert(&mut self, rule: Rule) -> Result<(), RuleError> {
        if self.contains(&rule) {
            return Err(RuleError::DuplicateRule {
                kind: rule.kind,
                value: rule.value,
            });
        }
        self.values_mut(rule.kind).insert(rule.value);
        Ok(())
    }

    /// Removes a rule, failing if it is absent.
    pub fn remove(&mut self, rule: &Rule) -> Result<(), RuleError> {
        if !self.values_mut(rule.kind).remove(&rule.value) {
            return Err(RuleError::NotFound {
                kind: rule.kind,
                value: rule.value.clone(),
            });
        }
        Ok(())
    }

    /// Blocked domains in sorted order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().map(String::as_str)
    }

    /// Blocked keywords in sorted order.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(String::as_str)
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.domains.len() + self.keywords.len()
    }

    /// Returns true if there are no rules of either kind.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.keywords.is_empty()
    }

    /// Returns the most specific domain rule matching `host`, if any.
    pub fn match_domain(&self, host: &str) -> Option<&str> {
        if self.domains.is_empty() {
            return None;
        }

        let host = strip_port(host.trim()).trim_end_matches('.').to_lowercase();
        let mut candidate = host.as_str();
        loop {
            if let Some(rule) = self.domains.get(candidate) {
                return Some(rule.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return None,
            }
        }
    }

    /// Returns the first keyword rule found in `url`, if any.
    pub fn match_keyword(&self, url: &str) -> Option<&str> {
        if self.keywords.is_empty() {
            return None;
        }

        let url = url.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| url.contains(keyword.as_str()))
            .map(String::as_str)
    }

    /// Evaluates a request: domain rules first, then keyword rules.
    pub fn evaluate(&self, host: &str, url: &str) -> Option<BlockDecision> {
        if let Some(domain) = self.match_domain(host) {
            return Some(BlockDecision::new(RuleKind::Domain, domain));
        }

        self.match_keyword(url)
            .map(|keyword| BlockDecision::new(RuleKind::Keyword, keyword))
    }
}

/// Process-wide filtering settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// When false, rule evaluation is skipped and every request is forwarded.
    pub filtering_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            filtering_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(domains: &[&str], keywords: &[&str]) -> RuleSet {
        let mut set = RuleSet::new();
        for d in domains {
            set.insert(Rule::domain(d).unwrap()).unwrap();
        }
        for k in keywords {
            set.insert(Rule::keyword(k).unwrap()).unwrap();
        }
        set
    }

    #[test]
    fn normalize_domain_values() {
        assert_eq!(normalize(RuleKind::Domain, "  Bad.COM ").unwrap(), "bad.com");
        assert_eq!(
            normalize(RuleKind::Domain, "https://*.Ads.Example.com:443/path?q=1").unwrap(),
            "ads.example.com"
        );
        assert_eq!(normalize(RuleKind::Domain, ".tracker.net.").unwrap(), "tracker.net");
    }

    #[test]
    fn normalize_rejects_empty_and_malformed() {
        assert!(matches!(
            normalize(RuleKind::Domain, "   "),
            Err(RuleError::InvalidRule { .. })
        ));
        assert!(matches!(
            normalize(RuleKind::Keyword, ""),
            Err(RuleError::InvalidRule { .. })
        ));
        assert!(matches!(
            normalize(RuleKind::Domain, "bad..com"),
            Err(RuleError::InvalidRule { .. })
        ));
        assert!(matches!(
            normalize(RuleKind::Domain, "bad com"),
            Err(RuleError::InvalidRule { .. })
        ));
    }

    #[test]
    fn keyword_is_lowercased_but_keeps_inner_text() {
        assert_eq!(normalize(RuleKind::Keyword, " Casino/Slots ").unwrap(), "casino/slots");
    }

    #[test]
    fn strip_port_handles_hosts_and_ipv6() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut set = rules(&["bad.com"], &[]);
        let err = set.insert(Rule::domain("BAD.com").unwrap()).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateRule { kind: RuleKind::Domain, .. }));
        assert_eq!(set.domains().collect::<Vec<_>>(), vec!["bad.com"]);
    }

    #[test]
    fn same_value_may_exist_in_both_kinds() {
        let set = rules(&["casino.com"], &["casino.com"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_missing_rule_is_not_found() {
        let mut set = rules(&["bad.com"], &["ads"]);
        let before = set.clone();
        let err = set.remove(&Rule::domain("never.com").unwrap()).unwrap_err();
        assert!(matches!(err, RuleError::NotFound { .. }));
        assert_eq!(set, before);
    }

    #[test]
    fn domain_matches_by_label_suffix() {
        let set = rules(&["ads.example.com"], &[]);
        assert_eq!(set.match_domain("ads.example.com"), Some("ads.example.com"));
        assert_eq!(set.match_domain("x.ads.example.com"), Some("ads.example.com"));
        assert_eq!(set.match_domain("X.ADS.Example.COM:443"), Some("ads.example.com"));
        assert_eq!(set.match_domain("badads.example.com"), None);
        assert_eq!(set.match_domain("example.com"), None);
    }

    #[test]
    fn most_specific_domain_wins() {
        let set = rules(&["example.com", "ads.example.com"], &[]);
        let decision = set.evaluate("x.ads.example.com", "http://x.ads.example.com/").unwrap();
        assert_eq!(decision.rule.value, "ads.example.com");
    }

    #[test]
    fn keyword_matches_full_url_case_insensitively() {
        let set = rules(&[], &["casino"]);
        let decision = set
            .evaluate("good.com", "http://good.com/Online-CASINO/games")
            .unwrap();
        assert_eq!(decision.rule.kind, RuleKind::Keyword);
        assert_eq!(decision.reason, "Blocked by keyword rule: casino");
        assert!(set.evaluate("good.com", "http://good.com/news").is_none());
    }

    #[test]
    fn domain_rules_are_checked_before_keywords() {
        let set = rules(&["bad.com"], &["bad"]);
        let decision = set.evaluate("bad.com", "http://bad.com/x").unwrap();
        assert_eq!(decision.rule.kind, RuleKind::Domain);
        assert_eq!(decision.reason, "Blocked by domain rule: bad.com");
    }

    #[test]
    fn empty_rule_set_allows_everything() {
        let set = RuleSet::new();
        assert!(set.is_empty());
        assert!(set.evaluate("bad.com", "http://bad.com/x").is_none());
    }

    #[test]
    fn rule_kind_round_trips_through_strings() {
        assert_eq!(RuleKind::parse("domain"), Some(RuleKind::Domain));
        assert_eq!(RuleKind::parse(RuleKind::Keyword.as_str()), Some(RuleKind::Keyword));
        assert_eq!(RuleKind::from_plural("keywords"), Some(RuleKind::Keyword));
        assert_eq!(RuleKind::from_plural("hosts"), None);
    }

    #[test]
    fn settings_default_to_filtering_enabled() {
        assert!(Settings::default().filtering_enabled);
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["filtering_enabled"], true);
    }
}
