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

//! TraceWire Trace Pipeline
//!
//! This crate turns a stream of individual metric observations into batches
//! and dispatches those batches to one or more downstream endpoints.
//!
//! # Architecture
//!
//! ```text
//! collectors ──► DeltaManager ──► TraceAccumulator ──► TraceBatch ──► BatchSubmissionContext
//!                                       │                                   │
//!                                 SUBQ / ATTACHED / APPLIED           FLUSHED / ENDPOINT
//!                                       └──────────── PhasePipeline ────────┘
//! ```
//!
//! - [`DeltaManager`]: Per-metric delta computation for cumulative counters
//! - [`TraceAccumulator`]: Queues traces and flushes them into batches by size or time
//! - [`TraceBatch`]: Reusable, de-duplicated set of traces plus context tags
//! - [`BatchSubmissionContext`]: Endpoints, executor and closer; sequential or concurrent dispatch
//! - [`PhasePipeline`]: Sync and async triggers bound to pipeline checkpoints
//! - [`WorkerPool`]: Bounded thread pool with an explicit [`RejectionPolicy`]
//!
//! # Usage Example
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tracewire_trace::{
//!     AccumulatorConfig, BatchSubmissionContext, LocalQueueEndpoint, MetricType, TraceAccumulator,
//!     TraceEvent,
//! };
//!
//! let sink = Arc::new(LocalQueueEndpoint::new("local", 1_000));
//! let context = BatchSubmissionContext::builder().endpoint(sink.clone()).build();
//! let accumulator = TraceAccumulator::new(AccumulatorConfig::default(), context);
//!
//! accumulator.offer(TraceEvent::new("web-1/jvm:heap", MetricType::LongAvg, json!(1024))).unwrap();
//! assert_eq!(accumulator.flush().unwrap(), 1);
//! ```
//!
//! # Thread Safety
//!
//! Everything here is shared across threads behind `Arc`. The delta manager
//! serializes all of its operations behind one lock; batches in flight are
//! read-only to endpoint tasks, and only the completion counter is mutated
//! concurrently.

mod accumulator;
mod batch;
mod delta;
mod endpoint;
mod error;
mod metric_type;
mod phase;
mod pool;
mod submission;
mod trace;

pub use accumulator::{AccumulatorConfig, AccumulatorStats, FlusherHandle, TraceAccumulator};
pub use batch::{ContextTag, TraceBatch, CONTEXT_TAG_SLOTS};
pub use delta::{DeltaConfig, DeltaManager, DeltaPolicy};
pub use endpoint::{
    Endpoint, EndpointMetrics, InstrumentedEndpoint, LocalQueueEndpoint, LoggingEndpoint,
    DEFAULT_FAILURE_THRESHOLD,
};
pub use error::{EndpointError, Result, TraceError};
pub use metric_type::MetricType;
pub use phase::{Phase, PhasePipeline, PhaseTrigger, TriggerBinding};
pub use pool::{PoolStatsSnapshot, RejectionPolicy, WorkerPool, WorkerPoolConfig};
pub use submission::{
    BatchSubmissionContext, BatchSubmissionContextBuilder, Closer, SubmissionStats,
    DEFAULT_FREE_LIST_CAPACITY,
};
pub use trace::{metric_name, TraceEvent, NAME_DELIMITER, SEGMENT_DELIMITER};
