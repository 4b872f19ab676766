//! Metadata matcher: a declarative predicate over event/stream metadata used
//! to filter iteration and stream-name discovery.
//!
//! A missing key fails every operation uniformly, `not_in` included — a
//! non-present key is never treated as "not in the list".

use std::collections::HashMap;

use regex::Regex;

/// A single metadata-key predicate.
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Regex(Regex),
}

impl Condition {
    fn matches(&self, value: Option<&str>) -> bool {
        let value = match value {
            Some(v) => v,
            // Every operation, including NotIn, fails to match a missing key.
            None => return false,
        };
        match self {
            Condition::Eq(expected) => value == expected,
            Condition::In(values) => values.iter().any(|v| v == value),
            Condition::NotIn(values) => !values.iter().any(|v| v == value),
            Condition::Regex(re) => re.is_match(value),
        }
    }
}

/// A matcher is a conjunction of per-key conditions. A matcher with no
/// entries matches everything.
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    conditions: HashMap<String, Condition>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(key.into(), Condition::Eq(value.into()));
        self
    }

    #[must_use]
    pub fn with_in(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.conditions.insert(key.into(), Condition::In(values));
        self
    }

    #[must_use]
    pub fn with_not_in(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.conditions.insert(key.into(), Condition::NotIn(values));
        self
    }

    /// Adds a regex condition. Returns an error if `pattern` does not
    /// compile.
    pub fn with_regex(
        mut self,
        key: impl Into<String>,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        let re = Regex::new(pattern)?;
        self.conditions.insert(key.into(), Condition::Regex(re));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluates the matcher against a metadata map.
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.conditions
            .iter()
            .all(|(key, cond)| cond.matches(metadata.get(key).map(String::as_str)))
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_matcher_matches_everything() {
        let m = Matcher::new();
        assert!(m.matches(&meta(&[])));
        assert!(m.matches(&meta(&[("x", "y")])));
    }

    #[test]
    fn eq_requires_key_present_and_equal() {
        let m = Matcher::new().with_eq("aggregate_id", "A");
        assert!(m.matches(&meta(&[("aggregate_id", "A")])));
        assert!(!m.matches(&meta(&[("aggregate_id", "B")])));
        assert!(!m.matches(&meta(&[])));
    }

    #[test]
    fn not_in_fails_on_missing_key() {
        let m = Matcher::new().with_not_in("status", vec!["closed".into()]);
        assert!(!m.matches(&meta(&[])));
        assert!(m.matches(&meta(&[("status", "open")])));
        assert!(!m.matches(&meta(&[("status", "closed")])));
    }

    #[test]
    fn in_matches_any_listed_value() {
        let m = Matcher::new().with_in("kind", vec!["a".into(), "b".into()]);
        assert!(m.matches(&meta(&[("kind", "b")])));
        assert!(!m.matches(&meta(&[("kind", "c")])));
    }

    #[test]
    fn regex_compiles_once_and_matches() {
        let m = Matcher::new().with_regex("name", "^user-.*$").unwrap();
        assert!(m.matches(&meta(&[("name", "user-123")])));
        assert!(!m.matches(&meta(&[("name", "order-123")])));
    }

    #[test]
    fn multiple_conditions_are_conjunctive() {
        let m = Matcher::new()
            .with_eq("aggregate_id", "A")
            .with_in("kind", vec!["created".into()]);
        assert!(m.matches(&meta(&[("aggregate_id", "A"), ("kind", "created")])));
        assert!(!m.matches(&meta(&[("aggregate_id", "A"), ("kind", "deleted")])));
    }
}
