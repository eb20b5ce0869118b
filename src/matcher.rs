//! Request matching logic.
//!
//! Selects the first eligible handler of an app for a test request. Matching
//! is read-only: exhaustion is judged from the `total_matches` snapshot the
//! caller passes in, and counting belongs to the dispatcher.

use crate::model::{Handler, RequestDescriptor, RequestSpec};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Pattern for a single named segment (`:id` or `{id}`).
const NAMED_SEGMENT: &str = "([^/?#]+)";

/// Pattern for a `*` wildcard, which may span segments.
const WILDCARD: &str = "(.*?)";

/// Errors raised while compiling a url pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("empty parameter name in url pattern '{0}'")]
    EmptyName(String),

    #[error("unclosed '{{' in url pattern '{0}'")]
    Unclosed(String),

    #[error("unbalanced optional group in url pattern '{0}'")]
    Unbalanced(String),

    #[error("invalid url pattern: {0}")]
    Regex(#[from] regex::Error),
}

/// A compiled path template.
///
/// Supports literal text, named segments (`/users/:id` or `/users/{id}`),
/// `*` wildcards and optional groups (`/users(/:id)`). A pattern matches the
/// whole path or not at all.
#[derive(Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
    params: Vec<String>,
}

impl UrlPattern {
    /// Compile a pattern.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut expr = String::from("^");
        let mut literal = String::new();
        let mut params = Vec::new();
        let mut depth = 0usize;
        let mut chars = pattern.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                ':' => {
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '_' {
                            name.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        return Err(PatternError::EmptyName(pattern.to_string()));
                    }
                    flush_literal(&mut expr, &mut literal);
                    expr.push_str(NAMED_SEGMENT);
                    params.push(name);
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for next in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    if !closed {
                        return Err(PatternError::Unclosed(pattern.to_string()));
                    }
                    if name.trim().is_empty() {
                        return Err(PatternError::EmptyName(pattern.to_string()));
                    }
                    flush_literal(&mut expr, &mut literal);
                    expr.push_str(NAMED_SEGMENT);
                    params.push(name.trim().to_string());
                }
                '*' => {
                    flush_literal(&mut expr, &mut literal);
                    expr.push_str(WILDCARD);
                    params.push("_".to_string());
                }
                '(' => {
                    flush_literal(&mut expr, &mut literal);
                    expr.push_str("(?:");
                    depth += 1;
                }
                ')' => {
                    if depth == 0 {
                        return Err(PatternError::Unbalanced(pattern.to_string()));
                    }
                    flush_literal(&mut expr, &mut literal);
                    expr.push_str(")?");
                    depth -= 1;
                }
                _ => literal.push(ch),
            }
        }

        if depth != 0 {
            return Err(PatternError::Unbalanced(pattern.to_string()));
        }
        flush_literal(&mut expr, &mut literal);
        expr.push('$');

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
            params,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Check whether a path matches the whole pattern.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Match a path and return the captured segment values.
    ///
    /// Values are only used for diagnostics; responses never see them.
    pub fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let mut values = HashMap::new();
        for (i, name) in self.params.iter().enumerate() {
            if let Some(m) = captures.get(i + 1) {
                values.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(values)
    }
}

fn flush_literal(expr: &mut String, literal: &mut String) {
    if !literal.is_empty() {
        expr.push_str(&regex::escape(literal));
        literal.clear();
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UrlPattern").field(&self.source).finish()
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for UrlPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        UrlPattern::parse(&source).map_err(serde::de::Error::custom)
    }
}

/// Find the first eligible handler for a request.
///
/// `handlers` must be in ordinal order. The lowest-ordinal handler whose
/// predicate matches and whose cap is not reached wins; there is no
/// specificity scoring.
pub fn find_match<'a>(handlers: &'a [Handler], request: &RequestDescriptor) -> Option<&'a Handler> {
    handlers.iter().find(|handler| is_eligible(handler, request))
}

/// Check a single handler against a request.
pub fn is_eligible(handler: &Handler, request: &RequestDescriptor) -> bool {
    !handler.is_exhausted() && matches_request(&handler.request, request)
}

fn matches_request(spec: &RequestSpec, request: &RequestDescriptor) -> bool {
    if let Some(protocol) = &spec.protocol {
        if !protocol.eq_ignore_ascii_case(&request.protocol) {
            return false;
        }
    }

    if let Some(method) = &spec.method {
        if !method.eq_ignore_ascii_case(&request.method) {
            return false;
        }
    }

    if let Some(pattern) = &spec.url_pattern {
        if !pattern.is_match(request.path()) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseSpec;

    fn make_handler(id: &str, pattern: Option<&str>) -> Handler {
        Handler {
            id: id.to_string(),
            request: RequestSpec {
                protocol: None,
                method: None,
                url_pattern: pattern.map(|p| UrlPattern::parse(p).unwrap()),
            },
            response: ResponseSpec::default(),
            max_matches: None,
            total_matches: 0,
        }
    }

    fn get(path: &str) -> RequestDescriptor {
        RequestDescriptor::new("http", "GET", path)
    }

    #[test]
    fn test_named_segment_pattern() {
        let pattern = UrlPattern::parse("/users/:id").unwrap();
        assert!(pattern.is_match("/users/123"));
        assert!(!pattern.is_match("/users/"));
        assert!(!pattern.is_match("/users/123/posts"));
        assert_eq!(
            pattern.captures("/users/abc").unwrap().get("id"),
            Some(&"abc".to_string())
        );
    }

    #[test]
    fn test_brace_segment_pattern() {
        let pattern = UrlPattern::parse("/users/{id}/posts/{post}").unwrap();
        let captures = pattern.captures("/users/7/posts/9").unwrap();
        assert_eq!(captures.get("id"), Some(&"7".to_string()));
        assert_eq!(captures.get("post"), Some(&"9".to_string()));
    }

    #[test]
    fn test_wildcard_pattern() {
        let pattern = UrlPattern::parse("/files/*").unwrap();
        assert!(pattern.is_match("/files/a/b/c.txt"));
        assert!(pattern.is_match("/files/"));
        assert!(!pattern.is_match("/other/a"));

        let everything = UrlPattern::parse("*").unwrap();
        assert!(everything.is_match("/anything/at/all"));
    }

    #[test]
    fn test_optional_group_pattern() {
        let pattern = UrlPattern::parse("/users(/:id)").unwrap();
        assert!(pattern.is_match("/users"));
        assert!(pattern.is_match("/users/5"));
        assert!(!pattern.is_match("/users/5/6"));
    }

    #[test]
    fn test_literal_characters_are_escaped() {
        let pattern = UrlPattern::parse("/api/v1.0/items").unwrap();
        assert!(pattern.is_match("/api/v1.0/items"));
        assert!(!pattern.is_match("/api/v1x0/items"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            UrlPattern::parse("/users/:"),
            Err(PatternError::EmptyName(_))
        ));
        assert!(matches!(
            UrlPattern::parse("/users/{id"),
            Err(PatternError::Unclosed(_))
        ));
        assert!(matches!(
            UrlPattern::parse("/users(/:id"),
            Err(PatternError::Unbalanced(_))
        ));
        assert!(matches!(
            UrlPattern::parse("/users)"),
            Err(PatternError::Unbalanced(_))
        ));
    }

    #[test]
    fn test_pattern_serde() {
        let pattern: UrlPattern = serde_json::from_str(r#""/users/:id""#).unwrap();
        assert_eq!(pattern.as_str(), "/users/:id");
        assert_eq!(serde_json::to_string(&pattern).unwrap(), r#""/users/:id""#);

        assert!(serde_json::from_str::<UrlPattern>(r#""/users/{id""#).is_err());
    }

    #[test]
    fn test_unconstrained_handler_matches_everything() {
        let handlers = vec![make_handler("any", None)];
        assert!(find_match(&handlers, &get("/users")).is_some());
        assert!(find_match(&handlers, &RequestDescriptor::new("https", "DELETE", "/x")).is_some());
    }

    #[test]
    fn test_method_matching() {
        let mut handler = make_handler("post-only", Some("/users"));
        handler.request.method = Some("POST".to_string());
        let handlers = vec![handler];

        assert!(find_match(&handlers, &RequestDescriptor::new("http", "POST", "/users")).is_some());
        assert!(find_match(&handlers, &RequestDescriptor::new("http", "post", "/users")).is_some());
        assert!(find_match(&handlers, &get("/users")).is_none());
    }

    #[test]
    fn test_protocol_matching() {
        let mut handler = make_handler("secure", None);
        handler.request.protocol = Some("https".to_string());
        let handlers = vec![handler];

        assert!(find_match(&handlers, &RequestDescriptor::new("https", "GET", "/")).is_some());
        assert!(find_match(&handlers, &get("/")).is_none());
    }

    #[test]
    fn test_query_string_is_ignored_for_patterns() {
        let handlers = vec![make_handler("user", Some("/users/:id"))];
        assert!(find_match(&handlers, &get("/users/123?expand=true")).is_some());
    }

    #[test]
    fn test_first_match_by_ordinal() {
        let handlers = vec![
            make_handler("broad", Some("/users/*")),
            make_handler("specific", Some("/users/:id")),
        ];

        let result = find_match(&handlers, &get("/users/123")).unwrap();
        assert_eq!(result.id, "broad");
    }

    #[test]
    fn test_exhausted_handler_is_skipped() {
        let mut first = make_handler("H1", Some("/users/:id"));
        first.max_matches = Some(1);
        first.total_matches = 1;
        let second = make_handler("H2", Some("/users/:id"));
        let handlers = vec![first, second];

        assert_eq!(find_match(&handlers, &get("/users/123")).unwrap().id, "H2");
    }

    #[test]
    fn test_cap_not_yet_reached() {
        let mut handler = make_handler("H1", None);
        handler.max_matches = Some(3);
        handler.total_matches = 2;
        let handlers = vec![handler];

        assert_eq!(find_match(&handlers, &get("/")).unwrap().id, "H1");
    }

    #[test]
    fn test_no_match() {
        let handlers = vec![make_handler("users", Some("/users/:id"))];
        assert!(find_match(&handlers, &get("/posts/1")).is_none());
        assert!(find_match(&[], &get("/posts/1")).is_none());
    }

    #[test]
    fn test_matching_is_deterministic() {
        let handlers = vec![
            make_handler("a", Some("/a")),
            make_handler("b", Some("/b/*")),
            make_handler("c", None),
        ];
        let request = get("/b/1");

        let first = find_match(&handlers, &request).map(|h| h.id.clone());
        let second = find_match(&handlers, &request).map(|h| h.id.clone());
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some("b"));
    }
}
