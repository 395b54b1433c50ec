// Copyright 2025 TraceWire Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use crate::metric_type::MetricType;

/// Separator between the segments of a fully qualified metric name.
pub const SEGMENT_DELIMITER: char = '/';
/// Separator between the namespace and the metric's own name.
pub const NAME_DELIMITER: char = ':';

/// A single timestamped metric observation.
///
/// Two events with the same metric name and timestamp are the same event, so a
/// batch holding both keeps only one. The value is carried opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub metric: String,
    pub metric_type: MetricType,
    /// Observation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub value: serde_json::Value,
}

impl TraceEvent {
    /// Creates an event stamped with the current time.
    pub fn new(metric: impl Into<String>, metric_type: MetricType, value: serde_json::Value) -> Self {
        TraceEvent {
            metric: metric.into(),
            metric_type,
            timestamp: now_millis(),
            value,
        }
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The numeric value, if the payload is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }
}

impl PartialEq for TraceEvent {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric && self.timestamp == other.timestamp
    }
}

impl Eq for TraceEvent {}

impl Hash for TraceEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metric.hash(state);
        self.timestamp.hash(state);
    }
}

/// Builds a fully qualified metric name: `host/agent/seg1/seg2:name`.
///
/// Empty namespace segments are skipped.
///
/// ```
/// use tracewire_trace::metric_name;
///
/// assert_eq!(metric_name("web-1", "jvm", &["gc", "young"], "count"), "web-1/jvm/gc/young:count");
/// assert_eq!(metric_name("web-1", "jvm", &[], "uptime"), "web-1/jvm:uptime");
/// ```
pub fn metric_name(host: &str, agent: &str, namespace: &[&str], name: &str) -> String {
    let mut fqn = String::with_capacity(host.len() + agent.len() + name.len() + 16);
    fqn.push_str(host);
    fqn.push(SEGMENT_DELIMITER);
    fqn.push_str(agent);
    for segment in namespace.iter().filter(|s| !s.is_empty()) {
        fqn.push(SEGMENT_DELIMITER);
        fqn.push_str(segment);
    }
    fqn.push(NAME_DELIMITER);
    fqn.push_str(name);
    fqn
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
