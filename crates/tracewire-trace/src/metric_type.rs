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
use std::fmt;
use std::str::FromStr;

/// Kind of metric a trace event carries.
///
/// The value itself stays opaque to the pipeline; the type only tells
/// collectors how to treat it. Delta types must be passed through a
/// [`DeltaManager`](crate::DeltaManager) before being traced, sticky types keep
/// their last value across empty intervals, and int types are narrowed to 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    IntAvg,
    LongAvg,
    StickyIntAvg,
    StickyLongAvg,
    DeltaIntAvg,
    DeltaLongAvg,
    StickyDeltaIntAvg,
    StickyDeltaLongAvg,
    IntervalIncident,
    Timestamp,
    String,
    Strings,
    Bytes,
}

impl MetricType {
    pub const ALL: [MetricType; 13] = [
        MetricType::IntAvg,
        MetricType::LongAvg,
        MetricType::StickyIntAvg,
        MetricType::StickyLongAvg,
        MetricType::DeltaIntAvg,
        MetricType::DeltaLongAvg,
        MetricType::StickyDeltaIntAvg,
        MetricType::StickyDeltaLongAvg,
        MetricType::IntervalIncident,
        MetricType::Timestamp,
        MetricType::String,
        MetricType::Strings,
        MetricType::Bytes,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<MetricType> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn is_delta(self) -> bool {
        matches!(
            self,
            MetricType::DeltaIntAvg
                | MetricType::DeltaLongAvg
                | MetricType::StickyDeltaIntAvg
                | MetricType::StickyDeltaLongAvg
        )
    }

    pub fn is_sticky(self) -> bool {
        matches!(
            self,
            MetricType::StickyIntAvg
                | MetricType::StickyLongAvg
                | MetricType::StickyDeltaIntAvg
                | MetricType::StickyDeltaLongAvg
                | MetricType::Timestamp
                | MetricType::String
        )
    }

    /// Interval incident counts are ints too.
    pub fn is_int(self) -> bool {
        matches!(
            self,
            MetricType::IntAvg
                | MetricType::StickyIntAvg
                | MetricType::DeltaIntAvg
                | MetricType::StickyDeltaIntAvg
                | MetricType::IntervalIncident
        )
    }

    pub fn is_long(self) -> bool {
        matches!(
            self,
            MetricType::LongAvg
                | MetricType::StickyLongAvg
                | MetricType::DeltaLongAvg
                | MetricType::StickyDeltaLongAvg
        )
    }

    pub fn is_number(self) -> bool {
        self.is_int() || self.is_long() || self == MetricType::Timestamp
    }

    pub fn is_string(self) -> bool {
        matches!(self, MetricType::String | MetricType::Strings)
    }

    /// The snake_case name used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            MetricType::IntAvg => "int_avg",
            MetricType::LongAvg => "long_avg",
            MetricType::StickyIntAvg => "sticky_int_avg",
            MetricType::StickyLongAvg => "sticky_long_avg",
            MetricType::DeltaIntAvg => "delta_int_avg",
            MetricType::DeltaLongAvg => "delta_long_avg",
            MetricType::StickyDeltaIntAvg => "sticky_delta_int_avg",
            MetricType::StickyDeltaLongAvg => "sticky_delta_long_avg",
            MetricType::IntervalIncident => "interval_incident",
            MetricType::Timestamp => "timestamp",
            MetricType::String => "string",
            MetricType::Strings => "strings",
            MetricType::Bytes => "bytes",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MetricType::IntAvg => "Interval averaged integer",
            MetricType::LongAvg => "Interval averaged long",
            MetricType::StickyIntAvg => "Sticky averaged integer",
            MetricType::StickyLongAvg => "Sticky averaged long",
            MetricType::DeltaIntAvg => "Delta integer",
            MetricType::DeltaLongAvg => "Delta long",
            MetricType::StickyDeltaIntAvg => "Sticky delta integer",
            MetricType::StickyDeltaLongAvg => "Sticky delta long",
            MetricType::IntervalIncident => "Interval incident count",
            MetricType::Timestamp => "Interval timestamp range",
            MetricType::String => "Last message of the interval",
            MetricType::Strings => "All messages in the interval",
            MetricType::Bytes => "All byte arrays in the interval",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for MetricType {
    type Err = String;

    /// Accepts the wire name, with `-` allowed in place of `_`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        MetricType::ALL
            .into_iter()
            .find(|ty| ty.name() == wanted)
            .ok_or_else(|| format!("unknown metric type '{}'", s))
    }
}
