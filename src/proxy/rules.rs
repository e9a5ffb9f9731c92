use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

pub const HOST_PLACEHOLDER_PREFIX: &str = "$group";

/// Routing target when no upstream rule matches the request host.
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub scheme: String,
}

/// One configured host-matching rule. The target host may carry `$groupN`
/// placeholders filled from the regex capture groups (`$group0` is the whole
/// match).
#[derive(Debug)]
pub struct UpstreamRule {
    regex: Regex,
    host: String,
    scheme: String,
}

impl UpstreamRule {
    pub fn new(regex: &str, host: &str, scheme: &str) -> Result<Self> {
        let regex =
            Regex::new(regex).with_context(|| format!("invalid upstream rule regex '{regex}'"))?;
        Ok(Self {
            regex,
            host: host.to_string(),
            scheme: scheme.to_string(),
        })
    }
}

/// Pick the upstream for an incoming host: first rule whose regex matches
/// wins; otherwise the default backend. Returns `(host, scheme)`.
pub fn select_upstream(
    rules: &[UpstreamRule],
    default_backend: &Backend,
    request_host: &str,
) -> (String, String) {
    for (i, rule) in rules.iter().enumerate() {
        let Some(caps) = rule.regex.captures(request_host) else {
            debug!(
                host = request_host,
                rule = i,
                "host does not match rule regex, skipping"
            );
            continue;
        };

        let mut upstream = rule.host.clone();
        // substitute from the highest group down so $group10 is not clobbered
        // by $group1
        for idx in (0..caps.len()).rev() {
            if let Some(group) = caps.get(idx) {
                upstream = upstream.replace(
                    &format!("{HOST_PLACEHOLDER_PREFIX}{idx}"),
                    group.as_str(),
                );
            }
        }
        debug!(host = request_host, upstream = %upstream, "upstream rule matched");
        return (upstream, rule.scheme.clone());
    }

    (
        default_backend.host.clone(),
        default_backend.scheme.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backend() -> Backend {
        Backend {
            host: "registry-1.docker.io".to_string(),
            scheme: "https".to_string(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            UpstreamRule::new("^mirror\\.example\\.com$", "registry.example.com", "https").unwrap(),
            UpstreamRule::new("^mirror\\..*$", "catch-all.example.com", "http").unwrap(),
        ];

        let (host, scheme) = select_upstream(&rules, &default_backend(), "mirror.example.com");
        assert_eq!(host, "registry.example.com");
        assert_eq!(scheme, "https");

        let (host, scheme) = select_upstream(&rules, &default_backend(), "mirror.other.net");
        assert_eq!(host, "catch-all.example.com");
        assert_eq!(scheme, "http");
    }

    #[test]
    fn capture_groups_substitute_into_the_target_host() {
        let rules =
            vec![UpstreamRule::new("^(.+)\\.mirror\\.local$", "$group1.upstream.io", "https")
                .unwrap()];

        let (host, _) = select_upstream(&rules, &default_backend(), "quay.mirror.local");
        assert_eq!(host, "quay.upstream.io");
    }

    #[test]
    fn group_zero_is_the_full_match() {
        let rules = vec![UpstreamRule::new("^local:5000$", "upstream-for-$group0", "http").unwrap()];
        let (host, _) = select_upstream(&rules, &default_backend(), "local:5000");
        assert_eq!(host, "upstream-for-local:5000");
    }

    #[test]
    fn unmatched_host_falls_back_to_the_default_backend() {
        let rules = vec![UpstreamRule::new("^nothing$", "x", "http").unwrap()];
        let (host, scheme) = select_upstream(&rules, &default_backend(), "ghcr.io");
        assert_eq!(host, "registry-1.docker.io");
        assert_eq!(scheme, "https");
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(UpstreamRule::new("(", "x", "http").is_err());
    }
}
