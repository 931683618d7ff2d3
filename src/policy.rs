use axum::http::{header, HeaderMap};

use crate::config::{Environment, ProfilerConfig};

/// Cookie a caller sets to switch profiling off for themselves.
pub const OPT_OUT_COOKIE: &str = "mp-disabled";

/// Caller identity established by the host's auth layer.
///
/// Insert it into the request extensions ahead of the profiler. When
/// present it is used instead of the identity header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// What the policy gets to look at for one request.
#[derive(Debug, Clone)]
pub struct CallerInfo<'a> {
    /// Identity established by the host's auth layer, if any.
    pub identity: Option<&'a str>,
    /// The caller's opt-out preference.
    pub opted_out: bool,
    pub path: &'a str,
}

impl<'a> CallerInfo<'a> {
    pub fn from_request(headers: &'a HeaderMap, path: &'a str, identity_header: &str) -> Self {
        let identity = headers
            .get(identity_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let opted_out = cookie_value(headers, OPT_OUT_COOKIE)
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        Self {
            identity,
            opted_out,
            path,
        }
    }
}

/// Decides, once per request, whether it gets profiled.
///
/// Runs on every request, so implementations must be cheap.
pub trait ProfilingPolicy: Send + Sync {
    fn should_profile(&self, caller: &CallerInfo<'_>) -> bool;
}

/// Allow-list in production, everyone in development. The opt-out cookie
/// always wins.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    environment: Environment,
    enabled_users: Vec<String>,
}

impl DefaultPolicy {
    pub fn new(environment: Environment, enabled_users: Vec<String>) -> Self {
        Self {
            environment,
            enabled_users,
        }
    }

    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self::new(config.environment, config.enabled_users.clone())
    }
}

impl ProfilingPolicy for DefaultPolicy {
    fn should_profile(&self, caller: &CallerInfo<'_>) -> bool {
        if caller.opted_out {
            return false;
        }
        match self.environment {
            Environment::Development => true,
            Environment::Production => caller
                .identity
                .is_some_and(|who| self.enabled_users.iter().any(|u| u.eq_ignore_ascii_case(who))),
        }
    }
}

impl<F> ProfilingPolicy for F
where
    F: Fn(&CallerInfo<'_>) -> bool + Send + Sync,
{
    fn should_profile(&self, caller: &CallerInfo<'_>) -> bool {
        self(caller)
    }
}

/// Value of the first cookie called `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"').to_owned())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use test_case::test_case;

    use super::*;

    fn caller(identity: Option<&str>, opted_out: bool) -> CallerInfo<'_> {
        CallerInfo {
            identity,
            opted_out,
            path: "/",
        }
    }

    fn production() -> DefaultPolicy {
        DefaultPolicy::new(Environment::Production, vec!["dev@example.com".into()])
    }

    #[test_case(Some("dev@example.com"), false, true; "allow-listed")]
    #[test_case(Some("DEV@example.com"), false, true; "case-insensitive")]
    #[test_case(Some("eve@example.com"), false, false; "not listed")]
    #[test_case(None, false, false; "anonymous")]
    #[test_case(Some("dev@example.com"), true, false; "opted out")]
    fn production_policy(identity: Option<&str>, opted_out: bool, expected: bool) {
        assert_eq!(production().should_profile(&caller(identity, opted_out)), expected);
    }

    #[test]
    fn development_profiles_anonymous_callers_unless_opted_out() {
        let policy = DefaultPolicy::new(Environment::Development, vec![]);
        assert!(policy.should_profile(&caller(None, false)));
        assert!(!policy.should_profile(&caller(None, true)));
    }

    #[test]
    fn closures_are_policies() {
        let policy = |c: &CallerInfo<'_>| c.path.starts_with("/admin");
        assert!(policy.should_profile(&CallerInfo {
            identity: None,
            opted_out: false,
            path: "/admin/x",
        }));
    }

    #[test]
    fn reads_identity_and_opt_out_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-authenticated-user", HeaderValue::from_static(" ann "));
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; mp-disabled=1"));
        let info = CallerInfo::from_request(&headers, "/", "x-authenticated-user");
        assert_eq!(info.identity, Some("ann"));
        assert!(info.opted_out);
    }

    #[test]
    fn cookie_lookup_spans_headers() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::COOKIE, HeaderValue::from_static("b=\"2\""));
        assert_eq!(cookie_value(&headers, "b").as_deref(), Some("2"));
        assert_eq!(cookie_value(&headers, "c"), None);
    }
}
