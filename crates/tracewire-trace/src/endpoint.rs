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

//! Endpoints: downstream sinks that accept batches of trace events.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::batch::TraceBatch;
use crate::error::EndpointError;
use crate::trace::TraceEvent;

/// A sink for trace batches.
///
/// Endpoints are shared across dispatch tasks, so every method takes `&self`.
/// `process_traces` may run concurrently with other endpoints' calls on the
/// same batch and must treat the batch as read-only.
pub trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), EndpointError> {
        Ok(())
    }

    /// Processes one batch. `Ok(false)` means the batch was dropped without error.
    fn process_traces(&self, batch: &TraceBatch) -> Result<bool, EndpointError>;

    fn disconnect(&self) {}
}

/// Point-in-time view of an [`InstrumentedEndpoint`]'s counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub name: String,
    pub connected: bool,
    pub total_submissions: u64,
    pub successful_submissions: u64,
    pub failed_submissions: u64,
    pub dropped_submissions: u64,
    pub consecutive_failures: u32,
    pub min_elapsed_us: u64,
    pub max_elapsed_us: u64,
}

/// Consecutive trace failures after which an endpoint is taken offline.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Wraps an endpoint with submission statistics and offline tracking.
///
/// A connect error takes the endpoint offline immediately; trace errors do so
/// once `failure_threshold` of them happen in a row. While offline, batches are
/// counted as dropped until [`reconnect`](Self::reconnect) succeeds.
pub struct InstrumentedEndpoint<E> {
    inner: E,
    failure_threshold: u32,
    connected: AtomicBool,
    consecutive_failures: AtomicU32,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    min_elapsed_us: AtomicU64,
    max_elapsed_us: AtomicU64,
}

impl<E: Endpoint> InstrumentedEndpoint<E> {
    pub fn new(inner: E) -> Self {
        Self::with_failure_threshold(inner, DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(inner: E, failure_threshold: u32) -> Self {
        InstrumentedEndpoint {
            inner,
            failure_threshold: failure_threshold.max(1),
            connected: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            min_elapsed_us: AtomicU64::new(u64::MAX),
            max_elapsed_us: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn reconnect(&self) -> Result<(), EndpointError> {
        self.disconnect();
        self.connect()
    }

    pub fn reset_statistics(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.min_elapsed_us.store(u64::MAX, Ordering::Relaxed);
        self.max_elapsed_us.store(0, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> EndpointMetrics {
        let min = self.min_elapsed_us.load(Ordering::Relaxed);
        EndpointMetrics {
            name: self.inner.name().to_string(),
            connected: self.is_connected(),
            total_submissions: self.total.load(Ordering::Relaxed),
            successful_submissions: self.succeeded.load(Ordering::Relaxed),
            failed_submissions: self.failed.load(Ordering::Relaxed),
            dropped_submissions: self.dropped.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            min_elapsed_us: if min == u64::MAX { 0 } else { min },
            max_elapsed_us: self.max_elapsed_us.load(Ordering::Relaxed),
        }
    }

    fn go_offline(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!(endpoint = self.inner.name(), reason, "Endpoint offline");
            self.inner.disconnect();
        }
    }
}

impl<E: Endpoint> Endpoint for InstrumentedEndpoint<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn connect(&self) -> Result<(), EndpointError> {
        if self.is_connected() {
            return Ok(());
        }
        let start = Instant::now();
        match self.inner.connect() {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                tracing::debug!(
                    endpoint = self.inner.name(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Endpoint connected"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(endpoint = self.inner.name(), "Endpoint connect failed: {}", e);
                Err(e)
            }
        }
    }

    fn process_traces(&self, batch: &TraceBatch) -> Result<bool, EndpointError> {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !self.is_connected() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let start = Instant::now();
        match self.inner.process_traces(batch) {
            Ok(true) => {
                let elapsed = start.elapsed().as_micros() as u64;
                self.min_elapsed_us.fetch_min(elapsed, Ordering::Relaxed);
                self.max_elapsed_us.fetch_max(elapsed, Ordering::Relaxed);
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
                Ok(true)
            }
            Ok(false) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Err(EndpointError::Connect(reason)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.go_offline(&reason);
                Err(EndpointError::Connect(reason))
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.go_offline("consecutive failure threshold reached");
                }
                Err(e)
            }
        }
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.inner.disconnect();
            tracing::debug!(endpoint = self.inner.name(), "Endpoint disconnected");
        }
    }
}

/// Bounded in-memory endpoint. Batches that do not fit are dropped whole.
pub struct LocalQueueEndpoint {
    name: String,
    capacity: usize,
    queue: Mutex<VecDeque<TraceEvent>>,
}

impl LocalQueueEndpoint {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        LocalQueueEndpoint {
            name: name.into(),
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TraceEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Removes and returns everything queued so far.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.queue().drain(..).collect()
    }
}

impl Endpoint for LocalQueueEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_traces(&self, batch: &TraceBatch) -> Result<bool, EndpointError> {
        let mut queue = self.queue();
        if queue.len() + batch.len() > self.capacity {
            tracing::debug!(
                endpoint = %self.name,
                queued = queue.len(),
                batch = batch.len(),
                "Local queue full, dropping batch"
            );
            return Ok(false);
        }
        queue.extend(batch.traces().cloned());
        Ok(true)
    }
}

/// Writes every trace to the `tracing` output at debug level.
pub struct LoggingEndpoint {
    name: String,
}

impl LoggingEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        LoggingEndpoint { name: name.into() }
    }
}

impl Endpoint for LoggingEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_traces(&self, batch: &TraceBatch) -> Result<bool, EndpointError> {
        tracing::info!(
            endpoint = %self.name,
            serial = batch.serial(),
            sequence = batch.sequence(),
            traces = batch.len(),
            "Batch received"
        );
        for trace in batch.traces() {
            tracing::debug!(
                endpoint = %self.name,
                metric = %trace.metric,
                metric_type = %trace.metric_type,
                timestamp = trace.timestamp,
                value = %trace.value,
                "Trace"
            );
        }
        Ok(true)
    }
}
