use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RequestId;
use crate::mode::Mode;

/// Everything captured for one profiled request.
///
/// Written to the store exactly once and never changed afterwards. A record
/// never refers to other records; chains are reconstructed by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: RequestId,
    pub method: String,
    /// Path and query string as received.
    pub url: String,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub total_ms: f64,
    pub outcome: Outcome,
    pub rpc: RpcProfile,
    pub cpu: CpuProfile,
    pub logs: Vec<LogLine>,
    #[serde(default)]
    pub dropped_logs: usize,
    /// Where the response redirected to, with the chain parameter added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    /// Capture facilities that failed; the record is partial.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capture_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Completed { status: u16 },
    /// The handler panicked; the panic was passed on.
    Panicked,
    /// The request future was dropped before it finished.
    Cancelled,
}

// ─── RPC ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    /// e.g. `redis`, `http`, `datastore`
    pub category: String,
    /// Human readable label, e.g. `HGETALL note:7`
    pub call: String,
    pub start_offset_ms: f64,
    pub duration_ms: f64,
    /// An earlier call in this request had the same identity.
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: usize,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcProfile {
    /// In the order the calls started.
    pub calls: Vec<RpcCall>,
    pub total_calls: usize,
    pub total_ms: f64,
    pub duplicate_calls: usize,
    pub by_category: BTreeMap<String, CategoryStats>,
}

impl RpcProfile {
    pub fn from_calls(mut calls: Vec<RpcCall>) -> Self {
        calls.sort_by(|a, b| a.start_offset_ms.total_cmp(&b.start_offset_ms));
        let mut by_category: BTreeMap<String, CategoryStats> = BTreeMap::new();
        for call in &calls {
            let stats = by_category.entry(call.category.clone()).or_default();
            stats.count += 1;
            stats.total_ms += call.duration_ms;
        }
        Self {
            total_calls: calls.len(),
            total_ms: calls.iter().map(|c| c.duration_ms).sum(),
            duplicate_calls: calls.iter().filter(|c| c.duplicate).count(),
            by_category,
            calls,
        }
    }
}

// ─── CPU ─────────────────────────────────────────────────────────

/// CPU profile of a request. Which variant is present says which profiler
/// ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CpuProfile {
    #[default]
    None,
    Instrumented(CallGraph),
    Sampled(StackHistogram),
}

impl CpuProfile {
    pub fn kind(&self) -> &'static str {
        match self {
            CpuProfile::None => "none",
            CpuProfile::Instrumented(_) => "instrumented",
            CpuProfile::Sampled(_) => "sampled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    /// Sorted by cumulative time, largest first.
    pub functions: Vec<FunctionStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    pub name: String,
    pub calls: u64,
    pub cumulative_ms: f64,
    pub self_ms: f64,
}

/// Sampled stacks, with frame names interned once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackHistogram {
    pub frame_names: Vec<String>,
    /// Distinct stacks and how often each was seen, most frequent first.
    pub stacks: Vec<StackCount>,
    /// Every sample in time order, pointing into `stacks`.
    pub samples: Vec<Sample>,
    pub total_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackCount {
    /// Indexes into `frame_names`, outermost frame first.
    pub frames: Vec<usize>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: f64,
    pub stack: usize,
}

// ─── Logs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    /// Module path (or target) the event came from.
    pub target: String,
    pub message: String,
    pub offset_ms: f64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn call(category: &str, start: f64, duration: f64, duplicate: bool) -> RpcCall {
        RpcCall {
            category: category.into(),
            call: format!("{category} call"),
            start_offset_ms: start,
            duration_ms: duration,
            duplicate,
            stack: None,
        }
    }

    pub fn record(id: &RequestId) -> ProfileRecord {
        ProfileRecord {
            id: id.clone(),
            method: "GET".into(),
            url: "/notes/1".into(),
            mode: Mode::Rpc,
            started_at: Utc::now(),
            total_ms: 12.5,
            outcome: Outcome::Completed { status: 200 },
            rpc: RpcProfile::from_calls(vec![
                call("redis", 1.0, 2.0, false),
                call("redis", 4.0, 1.5, true),
            ]),
            cpu: CpuProfile::None,
            logs: vec![LogLine {
                level: "INFO".into(),
                target: "notes".into(),
                message: "loaded note".into(),
                offset_ms: 3.0,
            }],
            dropped_logs: 0,
            redirect: None,
            capture_errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn rpc_summary_orders_and_totals() {
        let profile = RpcProfile::from_calls(vec![
            call("http", 5.0, 10.0, false),
            call("redis", 1.0, 2.0, false),
            call("redis", 3.0, 2.0, true),
        ]);
        assert_eq!(profile.total_calls, 3);
        assert_eq!(profile.duplicate_calls, 1);
        assert_eq!(profile.total_ms, 14.0);
        assert_eq!(profile.calls[0].category, "redis");
        assert_eq!(profile.by_category["redis"].count, 2);
        assert_eq!(profile.by_category["http"].total_ms, 10.0);
    }

    #[test]
    fn cpu_profile_is_tagged() {
        let json = serde_json::to_value(CpuProfile::Sampled(StackHistogram::default())).unwrap();
        assert_eq!(json["kind"], "sampled");
        let json = serde_json::to_value(CpuProfile::None).unwrap();
        assert_eq!(json["kind"], "none");
    }

    #[test]
    fn record_survives_json() {
        let id = RequestId::generate();
        let original = record(&id);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ProfileRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
    }
}
