//! Subscription matching
//!
//! Event patterns are shell-style globs compiled once into anchored
//! regular expressions and cached by pattern text.

use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};

use super::{Publication, Subscription};
use crate::error::{AppError, AppResult};

/// Translate a glob into an anchored regex source
///
/// `*` matches any run of non-`/` characters, `?` one non-`/`
/// character, `[abc]`, `[a-z]` and `[!abc]` are character classes and
/// `\` escapes the next character.
pub fn glob_to_regex(pattern: &str) -> AppResult<String> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| AppError::validation(format!("trailing escape in pattern '{}'", pattern)))?;
                out.push_str(&regex::escape(&escaped.to_string()));
            }
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }

                let mut closed = false;
                let mut empty = true;
                while let Some(c) = chars.next() {
                    match c {
                        ']' if !empty => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            let escaped = chars.next().ok_or_else(|| {
                                AppError::validation(format!("trailing escape in pattern '{}'", pattern))
                            })?;
                            out.push('\\');
                            out.push(escaped);
                        }
                        '-' => out.push('-'),
                        '[' | ']' | '^' | '&' | '~' => {
                            out.push('\\');
                            out.push(c);
                        }
                        _ => out.push(c),
                    }
                    empty = false;
                }
                if !closed {
                    return Err(AppError::validation(format!(
                        "unterminated character class in pattern '{}'",
                        pattern
                    )));
                }
                out.push(']');
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}

/// Matches publications against subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionMatcher {
    /// Compiled patterns; `None` for patterns that failed to compile
    cache: DashMap<String, Option<Regex>>,
}

impl SubscriptionMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a pattern, reporting syntax errors
    pub fn compile(&self, pattern: &str) -> AppResult<Regex> {
        if let Some(entry) = self.cache.get(pattern) {
            if let Some(regex) = entry.value() {
                return Ok(regex.clone());
            }
        }

        let source = glob_to_regex(pattern)?;
        let regex = Regex::new(&source)
            .map_err(|e| AppError::validation(format!("invalid pattern '{}': {}", pattern, e)))?;
        self.cache.insert(pattern.to_string(), Some(regex.clone()));
        Ok(regex)
    }

    /// Invalid patterns match nothing
    pub fn matches_pattern(&self, event_name: &str, pattern: &str) -> bool {
        if let Some(entry) = self.cache.get(pattern) {
            return entry
                .value()
                .as_ref()
                .map_or(false, |regex| regex.is_match(event_name));
        }

        match self.compile(pattern) {
            Ok(regex) => regex.is_match(event_name),
            Err(_) => {
                self.cache.insert(pattern.to_string(), None);
                false
            }
        }
    }

    pub fn matches_subscription(&self, publication: &Publication, subscription: &Subscription) -> bool {
        if !subscription.active {
            return false;
        }

        let filters = &subscription.filters;
        if let Some(publisher) = filters.publisher_agent_id.as_deref().filter(|s| !s.is_empty()) {
            if publication.publisher_agent_id != publisher {
                return false;
            }
        }
        if let Some(publisher_type) = filters
            .publisher_agent_type
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            if publication.publisher_agent_type != publisher_type {
                return false;
            }
        }
        if !filters.publication_types.is_empty()
            && !filters.publication_types.contains(&publication.publication_type)
        {
            return false;
        }
        if !self.matches_pattern(&publication.event_name, &subscription.event_pattern) {
            return false;
        }

        matches_conditions(&publication.payload, &filters.conditions)
    }

    /// Publications matching at least one subscription, each listed once
    pub fn filter_matching_publications<'a>(
        &self,
        publications: &'a [Publication],
        subscriptions: &[Subscription],
    ) -> Vec<&'a Publication> {
        publications
            .iter()
            .filter(|p| subscriptions.iter().any(|s| self.matches_subscription(p, s)))
            .collect()
    }

    pub fn matching_subscriptions<'a>(
        &self,
        publication: &Publication,
        subscriptions: &'a [Subscription],
    ) -> Vec<&'a Subscription> {
        subscriptions
            .iter()
            .filter(|s| self.matches_subscription(publication, s))
            .collect()
    }

    pub fn cached_patterns(&self) -> usize {
        self.cache.len()
    }
}

/// Every condition key must be present in the payload with an equal value
pub fn matches_conditions(payload: &Value, conditions: &Map<String, Value>) -> bool {
    conditions.iter().all(|(key, expected)| match payload.get(key) {
        None => false,
        Some(actual) if actual == expected => true,
        Some(Value::String(actual)) => expected
            .as_str()
            .map_or(false, |expected| actual.eq_ignore_ascii_case(expected)),
        Some(_) => false,
    })
}
