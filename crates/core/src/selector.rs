//! Label selectors: conjunctions of equality, set and existence terms.
//!
//! Textual form (comma separated, all terms must match):
//! - `app=web`, `app==web`, `app!=web`
//! - `app` (key exists), `!app` (key absent)
//! - `tier in (db,cache)`, `tier notin (db,cache)`

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{StateError, StateResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LabelTerm {
    Equal { key: String, value: String },
    NotEqual { key: String, value: String },
    Exists { key: String },
    NotExists { key: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
}

impl LabelTerm {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelTerm::Equal { key, value } => labels.get(key) == Some(value),
            LabelTerm::NotEqual { key, value } => labels.get(key) != Some(value),
            LabelTerm::Exists { key } => labels.contains_key(key),
            LabelTerm::NotExists { key } => !labels.contains_key(key),
            LabelTerm::In { key, values } => labels.get(key).map(|v| values.contains(v)).unwrap_or(false),
            LabelTerm::NotIn { key, values } => labels.get(key).map(|v| !values.contains(v)).unwrap_or(true),
        }
    }
}

impl fmt::Display for LabelTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelTerm::Equal { key, value } => write!(f, "{key}={value}"),
            LabelTerm::NotEqual { key, value } => write!(f, "{key}!={value}"),
            LabelTerm::Exists { key } => write!(f, "{key}"),
            LabelTerm::NotExists { key } => write!(f, "!{key}"),
            LabelTerm::In { key, values } => write!(f, "{key} in ({})", values.join(",")),
            LabelTerm::NotIn { key, values } => write!(f, "{key} notin ({})", values.join(",")),
        }
    }
}

/// Empty selector matches everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LabelSelector {
    #[serde(default)]
    pub terms: Vec<LabelTerm>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.terms.is_empty() }

    pub fn equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Equal { key: key.into(), value: value.into() });
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Exists { key: key.into() });
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|t| t.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.terms.iter().map(|t| t.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

fn bad(input: &str, why: &str) -> StateError {
    StateError::InvalidArgument(format!("label selector {input:?}: {why}"))
}

fn check_key(input: &str, key: &str) -> StateResult<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(bad(input, "empty key"));
    }
    if key.chars().any(|c| c.is_whitespace() || "=!(),".contains(c)) {
        return Err(bad(input, "invalid key"));
    }
    Ok(key.to_string())
}

/// Split on commas that are not inside parentheses.
fn split_terms(input: &str) -> StateResult<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(bad(input, "unbalanced parentheses"));
                }
            }
            ',' if depth == 0 => {
                out.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(bad(input, "unbalanced parentheses"));
    }
    out.push(&input[start..]);
    Ok(out)
}

fn parse_set(input: &str, rest: &str) -> StateResult<Vec<String>> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| bad(input, "set must be parenthesized"))?;
    let values: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return Err(bad(input, "empty set"));
    }
    Ok(values)
}

fn parse_term(input: &str, raw: &str) -> StateResult<LabelTerm> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(bad(input, "empty term"));
    }
    if let Some(key) = t.strip_prefix('!') {
        return Ok(LabelTerm::NotExists { key: check_key(input, key)? });
    }
    if let Some((k, v)) = t.split_once("!=") {
        return Ok(LabelTerm::NotEqual { key: check_key(input, k)?, value: v.trim().to_string() });
    }
    if let Some((k, v)) = t.split_once("==").or_else(|| t.split_once('=')) {
        return Ok(LabelTerm::Equal { key: check_key(input, k)?, value: v.trim().to_string() });
    }
    if let Some((k, rest)) = t.split_once(" notin ") {
        return Ok(LabelTerm::NotIn { key: check_key(input, k)?, values: parse_set(input, rest)? });
    }
    if let Some((k, rest)) = t.split_once(" in ") {
        return Ok(LabelTerm::In { key: check_key(input, k)?, values: parse_set(input, rest)? });
    }
    Ok(LabelTerm::Exists { key: check_key(input, t)? })
}

impl FromStr for LabelSelector {
    type Err = StateError;

    fn from_str(input: &str) -> StateResult<Self> {
        if input.trim().is_empty() {
            return Ok(Self::everything());
        }
        let terms = split_terms(input)?
            .into_iter()
            .map(|raw| parse_term(input, raw))
            .collect::<StateResult<Vec<_>>>()?;
        Ok(Self { terms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_all_term_shapes() {
        let s: LabelSelector = "app=web, tier in (db,cache), !legacy, env!=prod, owner".parse().unwrap();
        assert_eq!(s.terms.len(), 5);
        assert_eq!(s.terms[1], LabelTerm::In { key: "tier".into(), values: vec!["db".into(), "cache".into()] });
        assert_eq!(s.terms[2], LabelTerm::NotExists { key: "legacy".into() });
        assert_eq!(s.terms[4], LabelTerm::Exists { key: "owner".into() });
    }

    #[test]
    fn matching_is_a_conjunction() {
        let s: LabelSelector = "app=web,tier notin (db)".parse().unwrap();
        assert!(s.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(s.matches(&labels(&[("app", "web")])));
        assert!(!s.matches(&labels(&[("app", "web"), ("tier", "db")])));
        assert!(!s.matches(&labels(&[("app", "api")])));
        assert!(LabelSelector::everything().matches(&labels(&[])));
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["app=web,", "tier in db", "tier in ()", "(a", "=x", "a b"] {
            let r: StateResult<LabelSelector> = bad.parse();
            assert!(matches!(r, Err(StateError::InvalidArgument(_))), "{bad} should fail");
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        let s: LabelSelector = "app=web,tier in (db,cache),!legacy".parse().unwrap();
        let again: LabelSelector = s.to_string().parse().unwrap();
        assert_eq!(s, again);
    }
}
