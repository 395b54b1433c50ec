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

//! Per-metric monotonic delta tracking.
//!
//! Collectors that sample cumulative counters (CPU ticks, bytes sent, GC counts)
//! trace the difference between successive samples rather than the raw value.
//! [`DeltaManager`] keeps the last raw sample per metric name and computes that
//! difference, applying a [`DeltaPolicy`] when a counter goes backwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use tracewire_common::config::{env_or, env_parse};

use crate::error::{Result, TraceError};
use crate::metric_type::MetricType;

/// What to emit when a sample is lower than the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaPolicy {
    /// Adopt the new sample as the baseline and emit nothing.
    #[default]
    Rebase,
    /// Adopt the new sample and emit `|new - prior|`.
    Absolute,
    /// Adopt the new sample and emit the signed `new - prior`.
    Relative,
}

impl FromStr for DeltaPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rebase" => Ok(DeltaPolicy::Rebase),
            "absolute" => Ok(DeltaPolicy::Absolute),
            "relative" => Ok(DeltaPolicy::Relative),
            other => Err(format!("unknown delta policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeltaConfig {
    pub initial_capacity: usize,
    /// Policy used by [`DeltaManager::delta_typed`].
    pub policy: DeltaPolicy,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 100,
            policy: DeltaPolicy::Rebase,
        }
    }
}

impl DeltaConfig {
    /// Reads `TRACEWIRE_DELTA_CAPACITY` and `TRACEWIRE_DELTA_POLICY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_capacity: env_or("DELTA_CAPACITY", defaults.initial_capacity),
            policy: env_parse("DELTA_POLICY").unwrap_or(defaults.policy),
        }
    }
}

/// Stateful delta calculator shared by every collector of one agent.
///
/// All operations take a single lock and never perform I/O while holding it,
/// so concurrent samples of the same metric are applied one after another.
#[derive(Debug)]
pub struct DeltaManager {
    state: Mutex<HashMap<String, i64>>,
    policy: DeltaPolicy,
}

impl Default for DeltaManager {
    fn default() -> Self {
        Self::new(DeltaConfig::default())
    }
}

impl DeltaManager {
    pub fn new(config: DeltaConfig) -> Self {
        DeltaManager {
            state: Mutex::new(HashMap::with_capacity(config.initial_capacity)),
            policy: config.policy,
        }
    }

    pub fn policy(&self) -> DeltaPolicy {
        self.policy
    }

    fn state_map(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `value` for `name` and returns the delta from the previous sample.
    ///
    /// Returns `None` for the first sample of a metric (it only sets the
    /// baseline) and for a rollover under [`DeltaPolicy::Rebase`].
    pub fn delta(&self, name: &str, value: i64, policy: DeltaPolicy) -> Option<i64> {
        let mut state = self.state_map();
        let prior = state.insert(name.to_string(), value)?;

        // Samples at the edges of the i64 range wrap instead of overflowing.
        let diff = value.wrapping_sub(prior);
        if value >= prior {
            return Some(diff);
        }

        tracing::debug!(metric = name, prior, value, ?policy, "Counter went backwards");
        match policy {
            DeltaPolicy::Rebase => None,
            DeltaPolicy::Absolute => Some(diff.wrapping_abs()),
            DeltaPolicy::Relative => Some(diff),
        }
    }

    /// Like [`delta`](Self::delta) with the configured policy, for a typed metric.
    ///
    /// Non-delta metric types are a caller error. Int metric types have the
    /// result narrowed to 32 bits.
    pub fn delta_typed(&self, name: &str, value: i64, metric_type: MetricType) -> Result<Option<i64>> {
        if !metric_type.is_delta() {
            return Err(TraceError::StateViolation(format!(
                "metric type {} of '{}' is not a delta type",
                metric_type, name
            )));
        }
        Ok(self
            .delta(name, value, self.policy)
            .map(|d| if metric_type.is_int() { d as i32 as i64 } else { d }))
    }

    /// Last raw sample recorded for `name`.
    pub fn state(&self, name: &str) -> Option<i64> {
        self.state_map().get(name).copied()
    }

    pub fn state_size(&self) -> usize {
        self.state_map().len()
    }

    /// Human-readable listing of every tracked metric, sorted by name.
    pub fn dump_state(&self) -> String {
        let state = self.state_map();
        let mut entries: Vec<(&String, &i64)> = state.iter().collect();
        entries.sort();

        let mut out = String::from("DeltaManager states:");
        for (name, value) in entries {
            let _ = write!(out, "\n\t{}: {}", name, value);
        }
        out
    }

    pub fn reset(&self) {
        self.state_map().clear();
    }

    /// Discards all state. The manager stays usable and starts from empty baselines.
    pub fn shutdown(&self) {
        let mut state = self.state_map();
        tracing::info!(tracked = state.len(), "Shutting down delta manager");
        state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_sample_sets_baseline() {
        let deltas = DeltaManager::default();
        assert_eq!(deltas.delta("cpu.ticks", 100, DeltaPolicy::Rebase), None);
        assert_eq!(deltas.state("cpu.ticks"), Some(100));
    }

    #[test]
    fn test_increasing_samples_yield_difference() {
        let deltas = DeltaManager::default();
        deltas.delta("bytes", 10, DeltaPolicy::Rebase);
        assert_eq!(deltas.delta("bytes", 25, DeltaPolicy::Rebase), Some(15));
        assert_eq!(deltas.delta("bytes", 25, DeltaPolicy::Rebase), Some(0));
        assert_eq!(deltas.state("bytes"), Some(25));
    }

    #[test]
    fn test_rebase_suppresses_rollover() {
        let deltas = DeltaManager::default();
        deltas.delta("bytes", 500, DeltaPolicy::Rebase);
        assert_eq!(deltas.delta("bytes", 20, DeltaPolicy::Rebase), None);
        assert_eq!(deltas.state("bytes"), Some(20));
        assert_eq!(deltas.delta("bytes", 30, DeltaPolicy::Rebase), Some(10));
    }

    #[test]
    fn test_relative_then_absolute_rollover() {
        let deltas = DeltaManager::default();
        assert_eq!(deltas.delta("cpu.ticks", 100, DeltaPolicy::Relative), None);
        assert_eq!(deltas.delta("cpu.ticks", 260, DeltaPolicy::Relative), Some(160));
        assert_eq!(deltas.delta("cpu.ticks", 50, DeltaPolicy::Absolute), Some(210));
        assert_eq!(deltas.state("cpu.ticks"), Some(50));
    }

    #[test]
    fn test_relative_rollover_is_negative() {
        let deltas = DeltaManager::default();
        deltas.delta("q", 80, DeltaPolicy::Relative);
        assert_eq!(deltas.delta("q", 30, DeltaPolicy::Relative), Some(-50));
    }

    #[test]
    fn test_extreme_samples_wrap_instead_of_overflowing() {
        let deltas = DeltaManager::default();
        deltas.delta("c", i64::MAX, DeltaPolicy::Relative);
        assert_eq!(deltas.delta("c", -2, DeltaPolicy::Relative), Some(i64::MAX));
        assert_eq!(deltas.state("c"), Some(-2));

        assert_eq!(deltas.delta("c", i64::MIN, DeltaPolicy::Absolute), Some(i64::MAX - 1));
        assert_eq!(deltas.delta("c", i64::MAX, DeltaPolicy::Rebase), Some(-1));
    }

    #[test]
    fn test_typed_rejects_non_delta_types() {
        let deltas = DeltaManager::default();
        let err = deltas.delta_typed("x", 1, MetricType::LongAvg).unwrap_err();
        assert!(err.is_state_violation());
        assert_eq!(deltas.state_size(), 0);
    }

    #[test]
    fn test_typed_narrows_int_types() {
        let deltas = DeltaManager::default();
        let big = i64::from(i32::MAX) + 10;
        deltas.delta_typed("wide", 0, MetricType::DeltaLongAvg).unwrap();
        deltas.delta_typed("narrow", 0, MetricType::DeltaIntAvg).unwrap();

        assert_eq!(deltas.delta_typed("wide", big, MetricType::DeltaLongAvg).unwrap(), Some(big));
        assert_eq!(
            deltas.delta_typed("narrow", big, MetricType::DeltaIntAvg).unwrap(),
            Some(big as i32 as i64)
        );
    }

    #[test]
    fn test_reset_and_dump() {
        let deltas = DeltaManager::default();
        deltas.delta("b", 2, DeltaPolicy::Rebase);
        deltas.delta("a", 1, DeltaPolicy::Rebase);
        assert_eq!(deltas.dump_state(), "DeltaManager states:\n\ta: 1\n\tb: 2");

        deltas.reset();
        assert_eq!(deltas.state_size(), 0);
        assert_eq!(deltas.state("a"), None);
    }

    #[test]
    fn test_concurrent_samples_lose_no_updates() {
        let deltas = Arc::new(DeltaManager::default());
        deltas.delta("counter", 0, DeltaPolicy::Rebase);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let deltas = deltas.clone();
                thread::spawn(move || {
                    // Each thread samples its own strictly increasing series.
                    let name = format!("counter-{}", t);
                    let mut sum = 0;
                    for v in 0..1000 {
                        sum += deltas.delta(&name, v, DeltaPolicy::Rebase).unwrap_or(0);
                    }
                    sum
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 999);
        }
        assert_eq!(deltas.state_size(), 9);
    }

    #[test]
    fn test_policy_parses_case_insensitively() {
        assert_eq!("ABSOLUTE".parse::<DeltaPolicy>(), Ok(DeltaPolicy::Absolute));
        assert!("sideways".parse::<DeltaPolicy>().is_err());
    }
}
