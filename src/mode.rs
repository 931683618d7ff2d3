use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::policy::cookie_value;

/// Header a client sets to pick the profiling mode of one request.
pub const MODE_HEADER: &str = "x-miniprofiler-mode";
/// Cookie remembering the mode picked in the profiler UI.
pub const MODE_COOKIE: &str = "mp-mode";

/// What gets captured for a profiled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Start/end timing for the request as a whole.
    Simple,
    /// Every RPC the request makes.
    Rpc,
    /// Call-graph timing of every instrumented function.
    Instrumented,
    /// Periodic stack samples.
    Sampling,
    RpcInstrumented,
    RpcSampling,
}

/// Which CPU profiler a mode runs, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Instrumented,
    Sampling,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Simple,
        Mode::Rpc,
        Mode::Instrumented,
        Mode::Sampling,
        Mode::RpcInstrumented,
        Mode::RpcSampling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Simple => "simple",
            Mode::Rpc => "rpc",
            Mode::Instrumented => "instrumented",
            Mode::Sampling => "sampling",
            Mode::RpcInstrumented => "rpc_instrumented",
            Mode::RpcSampling => "rpc_sampling",
        }
    }

    pub fn rpc_enabled(self) -> bool {
        matches!(self, Mode::Rpc | Mode::RpcInstrumented | Mode::RpcSampling)
    }

    /// Log lines are captured in every mode except plain timing.
    pub fn logs_enabled(self) -> bool {
        self != Mode::Simple
    }

    pub fn cpu(self) -> Option<CpuMode> {
        match self {
            Mode::Instrumented | Mode::RpcInstrumented => Some(CpuMode::Instrumented),
            Mode::Sampling | Mode::RpcSampling => Some(CpuMode::Sampling),
            Mode::Simple | Mode::Rpc => None,
        }
    }

    /// Mode requested by the headers or cookies of a request. Anything
    /// unrecognised means `default`.
    pub fn requested(headers: &HeaderMap, default: Mode) -> Mode {
        let from_header = headers
            .get(MODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        from_header
            .or_else(|| cookie_value(headers, MODE_COOKIE))
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Rpc
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown profiler mode {:?}", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use test_case::test_case;

    use super::*;

    #[test_case("simple", Mode::Simple)]
    #[test_case("rpc_sampling", Mode::RpcSampling)]
    #[test_case(" instrumented ", Mode::Instrumented)]
    fn parses(raw: &str, expected: Mode) {
        assert_eq!(raw.parse::<Mode>(), Ok(expected));
    }

    #[test]
    fn unknown_mode_is_an_error() {
        assert!("memory_sampling".parse::<Mode>().is_err());
    }

    #[test]
    fn header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(MODE_HEADER, HeaderValue::from_static("sampling"));
        headers.insert("cookie", HeaderValue::from_static("mp-mode=instrumented"));
        assert_eq!(Mode::requested(&headers, Mode::Rpc), Mode::Sampling);
    }

    #[test]
    fn cookie_used_without_header() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("a=b; mp-mode=simple"));
        assert_eq!(Mode::requested(&headers, Mode::Rpc), Mode::Simple);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let mut headers = HeaderMap::new();
        headers.insert(MODE_HEADER, HeaderValue::from_static("turbo"));
        assert_eq!(Mode::requested(&headers, Mode::RpcInstrumented), Mode::RpcInstrumented);
    }

    #[test]
    fn capabilities() {
        assert!(!Mode::Simple.logs_enabled());
        assert!(Mode::Rpc.rpc_enabled());
        assert!(!Mode::Sampling.rpc_enabled());
        assert_eq!(Mode::RpcInstrumented.cpu(), Some(CpuMode::Instrumented));
        assert_eq!(Mode::Rpc.cpu(), None);
    }
}
