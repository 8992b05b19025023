//! Scope and safety rules consulted by the context assembler.
//!
//! Whether a message falls inside the assistant's expertise is a pluggable
//! [`ScopePredicate`]; the default [`KeywordScope`] matches whole words against
//! the configured expertise keywords. The [`CrisisRule`] runs independently and
//! takes precedence over everything else.

use regex::{Regex, RegexBuilder};

use crate::config::ScopeConfig;
use crate::error::{FedeError, FedeResult};

/// Decides whether a message lies within the assistant's declared expertise.
pub trait ScopePredicate: Send + Sync {
    fn in_expertise(&self, message: &str) -> bool;

    fn name(&self) -> &str;
}

/// Whole-word, case-insensitive keyword match.
pub struct KeywordScope {
    pattern: Option<Regex>,
}

impl KeywordScope {
    pub fn new(keywords: &[String]) -> FedeResult<Self> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }

        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
            .case_insensitive(true)
            .build()
            .map_err(|e| FedeError::invalid(format!("invalid expertise keywords: {}", e)))?;

        Ok(Self {
            pattern: Some(pattern),
        })
    }
}

impl ScopePredicate for KeywordScope {
    fn in_expertise(&self, message: &str) -> bool {
        self.pattern.as_ref().map_or(false, |p| p.is_match(message))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Accepts everything; used when scope enforcement is turned off.
pub struct AcceptAll;

impl ScopePredicate for AcceptAll {
    fn in_expertise(&self, _message: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        "accept_all"
    }
}

/// Safety rule: any matching pattern forces a crisis escalation.
pub struct CrisisRule {
    patterns: Vec<Regex>,
    pub message: String,
}

impl CrisisRule {
    pub fn new(patterns: &[String], message: impl Into<String>) -> FedeResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| FedeError::invalid(format!("invalid crisis pattern '{}': {}", p, e)))
            })
            .collect::<FedeResult<Vec<_>>>()?;

        Ok(Self {
            patterns,
            message: message.into(),
        })
    }

    /// Build from config; `None` when escalation is disabled.
    pub fn from_config(config: &ScopeConfig) -> FedeResult<Option<Self>> {
        if !config.crisis_escalation {
            return Ok(None);
        }
        Self::new(&config.crisis_patterns, config.crisis_message.clone()).map(Some)
    }

    pub fn triggered(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(message))
    }
}

/// Default predicate for a config: keywords when scope is required,
/// otherwise accept everything.
pub fn predicate_from_config(config: &ScopeConfig) -> FedeResult<Box<dyn ScopePredicate>> {
    if config.require_scope {
        Ok(Box::new(KeywordScope::new(&config.expertise_keywords)?))
    } else {
        Ok(Box::new(AcceptAll))
    }
}
