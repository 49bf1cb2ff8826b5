//! Compiled string and header matchers.

use crate::config::FieldMatch;
use crate::error::RuleError;
use regex::Regex;
use std::sync::Arc;

/// Exact (case-sensitive) or regex (search) matcher for one string field.
#[derive(Debug, Clone)]
pub enum CompiledField {
    Exact(String),
    Regex(Arc<Regex>),
}

impl CompiledField {
    pub fn compile(rule: &str, field: &str, matcher: &FieldMatch) -> Result<Self, RuleError> {
        match matcher {
            FieldMatch::Exact { exact } | FieldMatch::Plain(exact) => {
                Ok(CompiledField::Exact(exact.clone()))
            }
            FieldMatch::Regex { regex } => compile_regex(rule, field, regex)
                .map(|r| CompiledField::Regex(Arc::new(r))),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            CompiledField::Exact(expected) => expected == value,
            CompiledField::Regex(regex) => regex.is_match(value),
        }
    }
}

pub(crate) fn compile_regex(rule: &str, field: &str, pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).map_err(|e| RuleError::InvalidRegex {
        rule: rule.to_string(),
        field: field.to_string(),
        message: e.to_string(),
    })
}

/// Header matcher. Exact entries compare the name case-insensitively and the
/// value exactly; regex entries apply one regex to the name and another to
/// the value of the same header.
#[derive(Debug, Clone)]
pub enum HeaderMatcher {
    Exact { name: String, value: String },
    Regex { name: Arc<Regex>, value: Arc<Regex> },
}

impl HeaderMatcher {
    pub fn compile(rule: &str, name: &str, matcher: &FieldMatch) -> Result<Self, RuleError> {
        match matcher {
            FieldMatch::Exact { exact } | FieldMatch::Plain(exact) => Ok(HeaderMatcher::Exact {
                name: name.to_lowercase(),
                value: exact.clone(),
            }),
            FieldMatch::Regex { regex } => {
                let field = format!("header '{name}'");
                // Header names arrive lowercased; match them without case.
                let name_regex = compile_regex(rule, &field, &format!("(?i){name}"))?;
                let value_regex = compile_regex(rule, &field, regex)?;
                Ok(HeaderMatcher::Regex {
                    name: Arc::new(name_regex),
                    value: Arc::new(value_regex),
                })
            }
        }
    }

    /// True when at least one header satisfies this matcher.
    pub fn matches(&self, headers: &[(String, String)]) -> bool {
        match self {
            HeaderMatcher::Exact { name, value } => headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(name) && v == value),
            HeaderMatcher::Regex { name, value } => headers
                .iter()
                .any(|(k, v)| name.is_match(k) && value.is_match(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_is_case_sensitive() {
        let m = CompiledField::compile("r", "uri", &FieldMatch::exact("/Users")).unwrap();
        assert!(m.matches("/Users"));
        assert!(!m.matches("/users"));
        assert!(!m.matches("/Users/1"));
    }

    #[test]
    fn test_regex_uses_search_semantics() {
        let m = CompiledField::compile("r", "uri", &FieldMatch::regex(r"users/\d+")).unwrap();
        assert!(m.matches("/api/users/42/orders"));
        let anchored =
            CompiledField::compile("r", "uri", &FieldMatch::regex(r"^/api/users/\d+$")).unwrap();
        assert!(!anchored.matches("/api/users/42/orders"));
        assert!(anchored.matches("/api/users/42"));
    }

    #[test]
    fn test_invalid_regex_is_rule_error() {
        let err = CompiledField::compile("broken", "body", &FieldMatch::regex("(")).unwrap_err();
        assert_eq!(err.rule(), "broken");
        assert!(matches!(err, RuleError::InvalidRegex { .. }));
    }

    #[test]
    fn test_header_exact() {
        let m = HeaderMatcher::compile("r", "X-Api-Key", &FieldMatch::exact("secret")).unwrap();
        assert!(m.matches(&headers(&[("x-api-key", "secret")])));
        assert!(!m.matches(&headers(&[("x-api-key", "Secret")])));
        assert!(!m.matches(&headers(&[("x-other", "secret")])));
    }

    #[test]
    fn test_header_regex_applies_to_name_and_value() {
        let m = HeaderMatcher::compile("r", "^x-trace-.*", &FieldMatch::regex("^[0-9a-f]+$"))
            .unwrap();
        assert!(m.matches(&headers(&[("accept", "*/*"), ("x-trace-id", "abc123")])));
        assert!(!m.matches(&headers(&[("x-trace-id", "not-hex")])));
        assert!(!m.matches(&headers(&[("x-span-id", "abc123")])));
    }
}
