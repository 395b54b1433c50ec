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

//! Dispatch of loaded batches to endpoints.
//!
//! A [`BatchSubmissionContext`] owns the endpoint list, the executor and the
//! closer callback. Submitting a batch hands it to the executor:
//!
//! - **sequential**: one task calls every endpoint in registration order, then
//!   the closer, then resets the batch
//! - **multithreaded**: one task per endpoint; the task that brings the
//!   completion counter to zero runs the closer and resets the batch
//!
//! Either way the batch is read-only while endpoints hold it, and an endpoint
//! that fails or panics never keeps the others from running or the batch
//! from completing.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::batch::TraceBatch;
use crate::endpoint::Endpoint;
use crate::error::{EndpointError, Result};
use crate::phase::{Phase, PhasePipeline};
use crate::pool::WorkerPool;

/// Callback run once per batch after every endpoint has returned.
pub type Closer = Arc<dyn Fn(&TraceBatch) + Send + Sync>;

/// Batches kept for reuse by [`BatchSubmissionContext::acquire_batch`].
pub const DEFAULT_FREE_LIST_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionStats {
    pub submitted: u64,
    pub completed: u64,
    pub endpoint_failures: u64,
}

struct ContextInner {
    endpoints: Vec<Arc<dyn Endpoint>>,
    executor: Arc<WorkerPool>,
    multithreaded: bool,
    closer: Option<Closer>,
    pipeline: Option<Arc<PhasePipeline>>,
    free: Mutex<Vec<TraceBatch>>,
    free_capacity: usize,
    submitted: AtomicU64,
    completed: AtomicU64,
    endpoint_failures: AtomicU64,
}

impl ContextInner {
    fn deliver(&self, endpoint: &dyn Endpoint, batch: &TraceBatch) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| endpoint.process_traces(batch)))
            .unwrap_or_else(|payload| Err(EndpointError::Panicked(panic_message(payload.as_ref()))));

        match outcome {
            Ok(true) => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.fire_all(Phase::Endpoint, batch.traces());
                }
            }
            Ok(false) => {
                tracing::debug!(endpoint = endpoint.name(), serial = batch.serial(), "Endpoint dropped batch");
            }
            Err(e) => {
                self.endpoint_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    endpoint = endpoint.name(),
                    serial = batch.serial(),
                    traces = batch.len(),
                    "Endpoint failed to process batch: {}",
                    e
                );
            }
        }
    }

    fn complete(&self, mut batch: TraceBatch) {
        if let Some(closer) = &self.closer {
            if panic::catch_unwind(AssertUnwindSafe(|| closer(&batch))).is_err() {
                tracing::error!(serial = batch.serial(), "Batch closer panicked");
            }
        }
        batch.reset();
        self.completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(serial = batch.serial(), "Batch dispatch complete");

        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.free_capacity {
            free.push(batch);
        }
    }
}

/// State shared by the tasks dispatching one batch.
struct Dispatch {
    context: Arc<ContextInner>,
    batch: RwLock<Option<TraceBatch>>,
    remaining: AtomicUsize,
}

/// One unit of dispatch work. `target == None` means every endpoint in order.
///
/// Counting down happens on drop, so a task the executor discards still
/// releases its share of the batch.
struct DispatchTask {
    dispatch: Arc<Dispatch>,
    target: Option<Arc<dyn Endpoint>>,
    ran: bool,
}

impl DispatchTask {
    fn run(mut self) {
        {
            let guard = self.dispatch.batch.read().unwrap_or_else(|e| e.into_inner());
            if let Some(batch) = guard.as_ref() {
                let context = &self.dispatch.context;
                match &self.target {
                    Some(endpoint) => context.deliver(endpoint.as_ref(), batch),
                    None => {
                        for endpoint in &context.endpoints {
                            context.deliver(endpoint.as_ref(), batch);
                        }
                    }
                }
            }
        }
        self.ran = true;
    }
}

impl Drop for DispatchTask {
    fn drop(&mut self) {
        if !self.ran {
            let endpoint = self.target.as_ref().map(|e| e.name()).unwrap_or("*");
            tracing::warn!(endpoint, "Dispatch task discarded before running");
        }
        // The read guard is released before this point, so the last task can take the batch.
        if self.dispatch.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let batch = self
                .dispatch
                .batch
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(batch) = batch {
                self.dispatch.context.complete(batch);
            }
        }
    }
}

/// Endpoints, executor and closer shared by everything that submits batches.
///
/// Cheap to clone; clones share endpoints, statistics and the free list.
#[derive(Clone)]
pub struct BatchSubmissionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for BatchSubmissionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints: Vec<&str> = self.inner.endpoints.iter().map(|e| e.name()).collect();
        f.debug_struct("BatchSubmissionContext")
            .field("endpoints", &endpoints)
            .field("multithreaded", &self.inner.multithreaded)
            .field("closer", &self.inner.closer.is_some())
            .field("executor", &self.inner.executor)
            .finish()
    }
}

impl BatchSubmissionContext {
    pub fn builder() -> BatchSubmissionContextBuilder {
        BatchSubmissionContextBuilder::default()
    }

    pub fn endpoints(&self) -> &[Arc<dyn Endpoint>] {
        &self.inner.endpoints
    }

    pub fn executor(&self) -> &Arc<WorkerPool> {
        &self.inner.executor
    }

    pub fn is_multithreaded(&self) -> bool {
        self.inner.multithreaded
    }

    pub fn pipeline(&self) -> Option<&Arc<PhasePipeline>> {
        self.inner.pipeline.as_ref()
    }

    /// An empty batch, reused from a completed dispatch when one is available.
    pub fn acquire_batch(&self) -> TraceBatch {
        self.inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_default()
    }

    /// Number of completed batches waiting to be reused.
    pub fn free_batches(&self) -> usize {
        self.inner.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> SubmissionStats {
        SubmissionStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            endpoint_failures: self.inner.endpoint_failures.load(Ordering::Relaxed),
        }
    }

    /// Hands `batch` to the executor for dispatch and returns without waiting.
    ///
    /// Fires [`Phase::Flushed`] for every trace first. When the executor
    /// refuses a task the batch still completes (without that delivery) and
    /// the first refusal is returned.
    pub fn submit(&self, batch: TraceBatch) -> Result<()> {
        let inner = &self.inner;
        inner.submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(pipeline) = &inner.pipeline {
            pipeline.fire_all(Phase::Flushed, batch.traces());
        }

        tracing::debug!(
            serial = batch.serial(),
            sequence = batch.sequence(),
            traces = batch.len(),
            endpoints = inner.endpoints.len(),
            multithreaded = inner.multithreaded,
            "Submitting batch"
        );

        if inner.endpoints.is_empty() {
            inner.complete(batch);
            return Ok(());
        }

        let targets: Vec<Option<Arc<dyn Endpoint>>> = if inner.multithreaded {
            inner.endpoints.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        };

        let dispatch = Arc::new(Dispatch {
            context: inner.clone(),
            batch: RwLock::new(Some(batch)),
            remaining: AtomicUsize::new(targets.len()),
        });

        let mut first_error = None;
        for target in targets {
            let task = DispatchTask {
                dispatch: dispatch.clone(),
                target,
                ran: false,
            };
            if let Err(e) = inner.executor.submit(move || task.run()) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl TraceBatch {
    /// Hands this batch to `context` for dispatch.
    pub fn submit(self, context: &BatchSubmissionContext) -> Result<()> {
        context.submit(self)
    }
}

#[derive(Default)]
pub struct BatchSubmissionContextBuilder {
    endpoints: Vec<Arc<dyn Endpoint>>,
    executor: Option<Arc<WorkerPool>>,
    multithreaded: bool,
    closer: Option<Closer>,
    pipeline: Option<Arc<PhasePipeline>>,
    free_capacity: Option<usize>,
}

impl BatchSubmissionContextBuilder {
    /// Adds an endpoint. Sequential dispatch calls endpoints in the order added.
    pub fn endpoint(mut self, endpoint: Arc<dyn Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn executor(mut self, executor: Arc<WorkerPool>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    pub fn closer<F>(mut self, closer: F) -> Self
    where
        F: Fn(&TraceBatch) + Send + Sync + 'static,
    {
        self.closer = Some(Arc::new(closer));
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<PhasePipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn free_list_capacity(mut self, capacity: usize) -> Self {
        self.free_capacity = Some(capacity);
        self
    }

    /// Builds the context. Without an explicit executor a default pool is created.
    pub fn build(self) -> BatchSubmissionContext {
        BatchSubmissionContext {
            inner: Arc::new(ContextInner {
                endpoints: self.endpoints,
                executor: self.executor.unwrap_or_default(),
                multithreaded: self.multithreaded,
                closer: self.closer,
                pipeline: self.pipeline,
                free: Mutex::new(Vec::new()),
                free_capacity: self.free_capacity.unwrap_or(DEFAULT_FREE_LIST_CAPACITY),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                endpoint_failures: AtomicU64::new(0),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
