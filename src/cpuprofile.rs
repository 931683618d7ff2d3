//! Export of a sampled profile in Chrome's `.cpuprofile` format, which the
//! browser devtools' performance panel opens as a flame chart.

use std::collections::HashMap;

use serde::Serialize;

use crate::record::{CpuProfile, ProfileRecord, StackHistogram};

const ROOT_ID: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChromeProfile {
    pub nodes: Vec<Node>,
    /// Microseconds since the Unix epoch.
    pub start_time: i64,
    pub end_time: i64,
    /// Leaf node of each sample, in time order.
    pub samples: Vec<u32>,
    /// Microseconds between consecutive samples; the first is from
    /// `start_time`.
    pub time_deltas: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: u32,
    pub call_frame: CallFrame,
    pub hit_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub function_name: String,
    pub script_id: String,
    pub url: String,
    pub line_number: i32,
    pub column_number: i32,
}

impl CallFrame {
    fn named(name: &str) -> Self {
        Self {
            function_name: name.to_owned(),
            script_id: "0".into(),
            url: String::new(),
            line_number: -1,
            column_number: -1,
        }
    }
}

impl ChromeProfile {
    /// `None` unless the record carries a sampled CPU profile.
    pub fn from_record(record: &ProfileRecord) -> Option<Self> {
        let CpuProfile::Sampled(histogram) = &record.cpu else {
            return None;
        };
        let start_time = record.started_at.timestamp_micros();
        let end_time = start_time + (record.total_ms * 1000.0) as i64;
        Some(Self::build(histogram, start_time, end_time))
    }

    fn build(histogram: &StackHistogram, start_time: i64, end_time: i64) -> Self {
        let mut nodes = vec![Node {
            id: ROOT_ID,
            call_frame: CallFrame::named("(root)"),
            hit_count: 0,
            children: Vec::new(),
        }];
        // (parent node, frame index) -> node
        let mut edges: HashMap<(u32, usize), u32> = HashMap::new();

        let leaves: Vec<u32> = histogram
            .stacks
            .iter()
            .map(|stack| {
                let mut parent = ROOT_ID;
                for &frame in &stack.frames {
                    parent = match edges.get(&(parent, frame)) {
                        Some(&id) => id,
                        None => {
                            let id = nodes.len() as u32 + 1;
                            let name = histogram
                                .frame_names
                                .get(frame)
                                .map(String::as_str)
                                .unwrap_or("(unknown)");
                            nodes.push(Node {
                                id,
                                call_frame: CallFrame::named(name),
                                hit_count: 0,
                                children: Vec::new(),
                            });
                            nodes[(parent - 1) as usize].children.push(id);
                            edges.insert((parent, frame), id);
                            id
                        }
                    };
                }
                parent
            })
            .collect();

        let mut samples = Vec::with_capacity(histogram.samples.len());
        let mut time_deltas = Vec::with_capacity(histogram.samples.len());
        let mut last_us = 0i64;
        for sample in &histogram.samples {
            let leaf = leaves.get(sample.stack).copied().unwrap_or(ROOT_ID);
            nodes[(leaf - 1) as usize].hit_count += 1;
            let at_us = (sample.timestamp_ms * 1000.0) as i64;
            samples.push(leaf);
            time_deltas.push(at_us - last_us);
            last_us = at_us;
        }

        Self {
            nodes,
            start_time,
            end_time,
            samples,
            time_deltas,
        }
    }
}

/// Download name for a record's export, e.g. `mp-20240102-030405-<id>.cpuprofile`.
pub fn file_name(record: &ProfileRecord) -> String {
    format!(
        "mp-{}-{}.cpuprofile",
        record.started_at.format("%Y%m%d-%H%M%S"),
        record.id
    )
}
