//! Host based route matching.
//!
//! A host pattern is either an exact host (compared case-insensitively) or a
//! pattern with `*` wildcards compiled once into an anchored regex. A `*` stands
//! for one or more non-dot characters, so it never spans more than one label:
//! `*.example.com` matches `web.example.com` but not `a.b.example.com`.
//!
//! Matching walks routes in configuration order and returns the first hit.
use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use crate::core::{error::EntityError, registry::GatewayRegistry, route::Route};

/// Compiled host pattern.
#[derive(Debug, Clone)]
pub enum HostMatcher {
    Exact(String),
    Wildcard(Regex),
}

impl HostMatcher {
    pub fn compile(pattern: &str) -> Result<Self, EntityError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(EntityError::EmptyHost);
        }
        if !pattern.contains('*') {
            return Ok(HostMatcher::Exact(pattern.to_ascii_lowercase()));
        }

        let invalid = |reason: &str| EntityError::InvalidHostPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut expr = String::with_capacity(pattern.len() * 2);
        expr.push('^');
        for (i, label) in pattern.split('.').enumerate() {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.contains("**") {
                return Err(invalid("consecutive wildcards"));
            }
            if i > 0 {
                expr.push_str(r"\.");
            }
            let parts: Vec<String> = label.split('*').map(regex::escape).collect();
            expr.push_str(&parts.join("[^.]+"));
        }
        expr.push('$');

        RegexBuilder::new(&expr)
            .case_insensitive(true)
            .build()
            .map(HostMatcher::Wildcard)
            .map_err(|e| invalid(&e.to_string()))
    }

    /// `host` must already be normalized (no port, no trailing dot).
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostMatcher::Exact(expected) => expected.eq_ignore_ascii_case(host),
            HostMatcher::Wildcard(regex) => regex.is_match(host),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, HostMatcher::Wildcard(_))
    }
}

/// Strip an optional `:port` suffix and trailing dot from a Host / :authority value.
pub fn normalize_host(host: &str) -> &str {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split_once(']').map(|(addr, _)| addr).unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port))
                if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };
    host.strip_suffix('.').unwrap_or(host)
}

/// First-match-wins lookup over the registry's current route list.
#[derive(Clone)]
pub struct RouteMatcher {
    registry: Arc<GatewayRegistry>,
}

impl RouteMatcher {
    pub fn new(registry: Arc<GatewayRegistry>) -> Self {
        Self { registry }
    }

    /// Route for an inbound host, if any.
    pub fn find(&self, host: &str) -> Option<Arc<Route>> {
        let host = normalize_host(host);
        let routes = self.registry.routes();
        let found = routes.iter().find(|route| route.matches(host)).cloned();
        if found.is_none() {
            tracing::debug!(host, "no route matched");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let matcher = HostMatcher::compile("Api.Example.com").unwrap();
        assert!(!matcher.is_wildcard());
        assert!(matcher.matches("api.example.com"));
        assert!(matcher.matches("API.EXAMPLE.COM"));
        assert!(!matcher.matches("web.example.com"));
    }

    #[test]
    fn test_wildcard_matches_exactly_one_label() {
        let matcher = HostMatcher::compile("*.example.com").unwrap();
        assert!(matcher.is_wildcard());
        assert!(matcher.matches("web.example.com"));
        assert!(matcher.matches("WEB.example.COM"));
        assert!(!matcher.matches("a.b.example.com"));
        assert!(!matcher.matches("example.com"));
        assert!(!matcher.matches("webexample.com"));
    }

    #[test]
    fn test_wildcard_inside_label_and_escaping() {
        let matcher = HostMatcher::compile("api-*.svc.local").unwrap();
        assert!(matcher.matches("api-v2.svc.local"));
        assert!(!matcher.matches("api-.svc.local"));
        assert!(!matcher.matches("api-v2.svcxlocal"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(HostMatcher::compile("  ").unwrap_err(), EntityError::EmptyHost);
        assert!(HostMatcher::compile("*..example.com").is_err());
        assert!(HostMatcher::compile("**.example.com").is_err());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("api.example.com:8080"), "api.example.com");
        assert_eq!(normalize_host("api.example.com."), "api.example.com");
        assert_eq!(normalize_host("[::1]:443"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host("plain"), "plain");
    }

    #[test]
    fn test_first_match_wins() {
        let registry = Arc::new(GatewayRegistry::new());
        registry
            .update_routes(&[
                RouteConfig::new("api.example.com", "a"),
                RouteConfig::new("*.example.com", "b"),
            ])
            .unwrap();
        let matcher = RouteMatcher::new(registry.clone());

        assert_eq!(matcher.find("api.example.com").unwrap().backend(), "a");
        assert_eq!(matcher.find("web.example.com").unwrap().backend(), "b");
        assert_eq!(matcher.find("api.example.com:443").unwrap().backend(), "a");
        assert!(matcher.find("a.b.example.com").is_none());

        // Reversed order: the wildcard now shadows the exact host.
        registry
            .update_routes(&[
                RouteConfig::new("*.example.com", "b"),
                RouteConfig::new("api.example.com", "a"),
            ])
            .unwrap();
        assert_eq!(matcher.find("api.example.com").unwrap().backend(), "b");
    }
}
