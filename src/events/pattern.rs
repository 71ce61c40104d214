//! Reusable event-pattern matcher.
//!
//! A pattern is either `*` (match-all), an exact event name, or a
//! colon-segmented pattern where a `*` segment matches exactly one
//! `[a-z0-9_-]+` token (`workspace:*:added` matches
//! `workspace:member:added` but not `workspace:added` or
//! `workspace:a:b:added`). Patterns compile once — at subscribe or
//! definition-registration time — into a matcher value that is cheap to
//! apply per delivered event.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::EventBusError;

static SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("segment regex"));

#[derive(Debug, Clone)]
enum Matcher {
    All,
    Exact(String),
    Segments(Regex),
}

/// A compiled event pattern.
#[derive(Debug, Clone)]
pub struct EventPattern {
    raw: String,
    matcher: Matcher,
}

impl EventPattern {
    /// Compile a pattern string. Fails with `invalid_pattern` when a
    /// non-wildcard segment contains characters outside `[a-z0-9_-]`.
    pub fn compile(pattern: &str) -> Result<Self, EventBusError> {
        let raw = pattern.to_string();

        if pattern == "*" {
            return Ok(Self {
                raw,
                matcher: Matcher::All,
            });
        }

        let segments: Vec<&str> = pattern.split(':').collect();
        let invalid = segments
            .iter()
            .any(|s| *s != "*" && !SEGMENT.is_match(s));
        if segments.is_empty() || invalid {
            return Err(EventBusError::InvalidPattern { pattern: raw });
        }

        if !segments.contains(&"*") {
            return Ok(Self {
                raw,
                matcher: Matcher::Exact(pattern.to_string()),
            });
        }

        let body = segments
            .iter()
            .map(|s| {
                if *s == "*" {
                    "[a-z0-9_-]+".to_string()
                } else {
                    regex::escape(s)
                }
            })
            .collect::<Vec<_>>()
            .join(":");
        let regex = Regex::new(&format!("^{body}$"))
            .map_err(|_| EventBusError::InvalidPattern { pattern: raw.clone() })?;
        Ok(Self {
            raw,
            matcher: Matcher::Segments(regex),
        })
    }

    pub fn matches(&self, event: &str) -> bool {
        match &self.matcher {
            Matcher::All => true,
            Matcher::Exact(name) => name == event,
            Matcher::Segments(regex) => regex.is_match(event),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all() {
        let p = EventPattern::compile("*").unwrap();
        assert!(p.matches("workspace:created"));
        assert!(p.matches("anything"));
    }

    #[test]
    fn test_exact() {
        let p = EventPattern::compile("workspace:created").unwrap();
        assert!(p.matches("workspace:created"));
        assert!(!p.matches("workspace:deleted"));
        assert!(!p.matches("workspace:created:extra"));
    }

    #[test]
    fn test_wildcard_segment_matches_one_token() {
        let p = EventPattern::compile("workspace:*:added").unwrap();
        assert!(p.matches("workspace:member:added"));
        assert!(p.matches("workspace:artifact-v2:added"));
        assert!(!p.matches("workspace:added"));
        assert!(!p.matches("workspace:a:b:added"));
        assert!(!p.matches("workspace:MEMBER:added"));
    }

    #[test]
    fn test_trailing_wildcard() {
        let p = EventPattern::compile("agent:message:*").unwrap();
        assert!(p.matches("agent:message:sent"));
        assert!(p.matches("agent:message:received"));
        assert!(!p.matches("agent:message"));
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        assert!(EventPattern::compile("work space:created").is_err());
        assert!(EventPattern::compile("workspace:Created").is_err());
        assert!(EventPattern::compile("a:(b|c)").is_err());
    }
}
