//! Content and identity filtering for ingested posts
//!
//! Rule sets are loaded once at startup into an immutable [`FilterRuleSet`],
//! compiled into a [`PatternFilter`], and shared by reference with the
//! ingestion loop. There is no runtime mutation path.

use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const DEFAULT_RULES: &str = include_str!("../../rules/default.json");

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to read rules file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse rules: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Inclusion/exclusion rules and identity lists, as loaded from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRuleSet {
    pub allow_dids: Vec<String>,
    pub deny_dids: Vec<String>,
    pub exclude_tokens: Vec<String>,
    pub include_tokens: Vec<String>,
    pub phrases: Vec<String>,
    /// Stopword that may precede a phrase without being required
    pub phrase_prefix: Option<String>,
    /// Space-separated words that must all occur, in any order
    pub multi_word: Vec<String>,
}

impl Default for FilterRuleSet {
    fn default() -> Self {
        Self {
            allow_dids: Vec::new(),
            deny_dids: Vec::new(),
            exclude_tokens: Vec::new(),
            include_tokens: Vec::new(),
            phrases: Vec::new(),
            phrase_prefix: Some("the".to_string()),
            multi_word: Vec::new(),
        }
    }
}

impl FilterRuleSet {
    /// Rule set bundled with the crate
    pub fn builtin() -> Result<Self, FilterError> {
        Ok(serde_json::from_str(DEFAULT_RULES)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| FilterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Append operator-supplied identities to the rule set's own lists
    pub fn with_identities(mut self, allow: &[String], deny: &[String]) -> Self {
        self.allow_dids.extend(allow.iter().cloned());
        self.deny_dids.extend(deny.iter().cloned());
        self
    }
}

/// Build `\b(?:a|b|c)\b`, or `None` when there is nothing to alternate.
/// An empty alternation would match every input.
fn word_alternation(items: &[String], plural: bool, prefix: Option<&str>) -> Option<String> {
    let escaped: Vec<String> = items
        .iter()
        .map(|item| item.split_whitespace().map(regex::escape).collect::<Vec<_>>())
        .filter(|words| !words.is_empty())
        .map(|words| {
            let joined = words.join(r"\s+");
            if plural {
                format!("{}s?", joined)
            } else {
                joined
            }
        })
        .collect();

    if escaped.is_empty() {
        return None;
    }

    let mut pattern = format!("(?:{})", escaped.join("|"));
    if let Some(prefix) = prefix.map(str::trim).filter(|p| !p.is_empty()) {
        pattern = format!(r"(?:{}\s+)?{}", regex::escape(prefix), pattern);
    }
    Some(format!(r"\b(?:{})\b", pattern))
}

fn compile(pattern: Option<String>) -> Result<Option<Regex>, FilterError> {
    pattern
        .map(|p| RegexBuilder::new(&p).case_insensitive(true).build())
        .transpose()
        .map_err(FilterError::from)
}

/// Co-occurrence rules: each word is matched once through a [`RegexSet`],
/// a rule fires when every one of its words matched.
#[derive(Debug, Clone)]
struct MultiWordMatcher {
    words: RegexSet,
    rules: Vec<Vec<usize>>,
}

impl MultiWordMatcher {
    fn compile(rules: &[String]) -> Result<Option<Self>, FilterError> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut patterns = Vec::new();
        let mut compiled_rules = Vec::new();

        for rule in rules {
            let mut word_ids = Vec::new();
            for word in rule.split_whitespace() {
                let key = word.to_lowercase();
                let id = *index.entry(key).or_insert_with(|| {
                    patterns.push(format!(r"\b{}\b", regex::escape(word)));
                    patterns.len() - 1
                });
                word_ids.push(id);
            }
            if !word_ids.is_empty() {
                compiled_rules.push(word_ids);
            }
        }

        if compiled_rules.is_empty() {
            return Ok(None);
        }

        let words = RegexSetBuilder::new(&patterns)
            .case_insensitive(true)
            .build()?;
        Ok(Some(Self {
            words,
            rules: compiled_rules,
        }))
    }

    fn matches(&self, text: &str) -> bool {
        let hits = self.words.matches(text);
        self.rules
            .iter()
            .any(|rule| rule.iter().all(|&id| hits.matched(id)))
    }
}

/// Compiled text matcher
#[derive(Debug, Clone)]
pub struct PatternFilter {
    exclude: Option<Regex>,
    phrases: Option<Regex>,
    multi_word: Option<MultiWordMatcher>,
    include: Option<Regex>,
}

impl PatternFilter {
    pub fn compile(rules: &FilterRuleSet) -> Result<Self, FilterError> {
        let filter = Self {
            exclude: compile(word_alternation(&rules.exclude_tokens, true, None))?,
            phrases: compile(word_alternation(
                &rules.phrases,
                false,
                rules.phrase_prefix.as_deref(),
            ))?,
            multi_word: MultiWordMatcher::compile(&rules.multi_word)?,
            include: compile(word_alternation(&rules.include_tokens, true, None))?,
        };

        log::info!(
            "🔍 Compiled filter: {} exclude tokens, {} include tokens, {} phrases, {} multi-word rules",
            rules.exclude_tokens.len(),
            rules.include_tokens.len(),
            rules.phrases.len(),
            rules.multi_word.len()
        );

        Ok(filter)
    }

    /// Exclusion wins over every inclusion rule
    pub fn matches(&self, text: &str) -> bool {
        if self.exclude.as_ref().is_some_and(|re| re.is_match(text)) {
            return false;
        }

        self.phrases.as_ref().is_some_and(|re| re.is_match(text))
            || self.multi_word.as_ref().is_some_and(|m| m.matches(text))
            || self.include.as_ref().is_some_and(|re| re.is_match(text))
    }
}

/// Author identities checked before any text filtering
#[derive(Debug, Clone, Default)]
pub struct IdentityLists {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl IdentityLists {
    pub fn new(allow: impl IntoIterator<Item = String>, deny: impl IntoIterator<Item = String>) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
        }
    }

    pub fn is_denied(&self, did: &str) -> bool {
        self.deny.contains(did)
    }

    pub fn is_allowed(&self, did: &str) -> bool {
        self.allow.contains(did)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    Allowed,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Denied,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Kept(KeepReason),
    Rejected(RejectReason),
}

impl FilterDecision {
    pub fn is_kept(&self) -> bool {
        matches!(self, FilterDecision::Kept(_))
    }
}

/// Identity lists plus text matcher, as applied to each created post
#[derive(Debug, Clone)]
pub struct PostFilter {
    identities: IdentityLists,
    patterns: PatternFilter,
}

impl PostFilter {
    pub fn new(identities: IdentityLists, patterns: PatternFilter) -> Self {
        Self {
            identities,
            patterns,
        }
    }

    pub fn from_rules(rules: &FilterRuleSet) -> Result<Self, FilterError> {
        Ok(Self::new(
            IdentityLists::new(rules.allow_dids.iter().cloned(), rules.deny_dids.iter().cloned()),
            PatternFilter::compile(rules)?,
        ))
    }

    pub fn decide(&self, author: &str, text: &str) -> FilterDecision {
        if self.identities.is_denied(author) {
            return FilterDecision::Rejected(RejectReason::Denied);
        }
        if self.identities.is_allowed(author) {
            return FilterDecision::Kept(KeepReason::Allowed);
        }
        if self.patterns.matches(text) {
            FilterDecision::Kept(KeepReason::Matched)
        } else {
            FilterDecision::Rejected(RejectReason::NoMatch)
        }
    }
}
