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

//! Trace accumulation: the entry point that turns individual trace events
//! into batches.
//!
//! Traces offered to a [`TraceAccumulator`] wait in a queue until either the
//! queue reaches the flush size or a flush is requested (explicitly or by
//! the background flusher). Each flush loads one batch, stamps its sequence
//! number and submits it, firing the pipeline phases along the way.

use crossbeam::channel::{self, Sender};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracewire_common::config::{env_millis, env_or};

use crate::error::Result;
use crate::phase::Phase;
use crate::submission::BatchSubmissionContext;
use crate::trace::TraceEvent;

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    /// Queue length that triggers an immediate flush.
    pub flush_size: usize,
    /// Period of the background flusher.
    pub flush_interval: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            flush_size: 200,
            flush_interval: Duration::from_millis(5000),
        }
    }
}

impl AccumulatorConfig {
    /// Reads `TRACEWIRE_FLUSH_SIZE` and `TRACEWIRE_FLUSH_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            flush_size: env_or("FLUSH_SIZE", defaults.flush_size),
            flush_interval: env_millis("FLUSH_INTERVAL_MS", defaults.flush_interval),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub offered: u64,
    pub flushed_traces: u64,
    pub batches: u64,
    pub pending: usize,
}

pub struct TraceAccumulator {
    config: AccumulatorConfig,
    context: BatchSubmissionContext,
    queue: Mutex<Vec<TraceEvent>>,
    sequence: AtomicI64,
    offered: AtomicU64,
    flushed_traces: AtomicU64,
    batches: AtomicU64,
}

impl std::fmt::Debug for TraceAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAccumulator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TraceAccumulator {
    pub fn new(config: AccumulatorConfig, context: BatchSubmissionContext) -> Self {
        TraceAccumulator {
            queue: Mutex::new(Vec::with_capacity(config.flush_size)),
            config,
            context,
            sequence: AtomicI64::new(0),
            offered: AtomicU64::new(0),
            flushed_traces: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    pub fn context(&self) -> &BatchSubmissionContext {
        &self.context
    }

    fn queue(&self) -> MutexGuard<'_, Vec<TraceEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues one trace, flushing when the queue reaches the flush size.
    pub fn offer(&self, trace: TraceEvent) -> Result<()> {
        self.offer_all(std::iter::once(trace))
    }

    pub fn offer_all<I>(&self, traces: I) -> Result<()>
    where
        I: IntoIterator<Item = TraceEvent>,
    {
        let traces: Vec<TraceEvent> = traces.into_iter().collect();
        // Triggers run before the queue is locked, so they may offer traces themselves.
        if let Some(pipeline) = self.context.pipeline() {
            pipeline.fire_all(Phase::Subq, &traces);
        }

        let mut ready = Vec::new();
        {
            let mut queue = self.queue();
            for trace in traces {
                self.offered.fetch_add(1, Ordering::Relaxed);
                queue.push(trace);
                if queue.len() >= self.config.flush_size {
                    ready.push(std::mem::replace(
                        &mut *queue,
                        Vec::with_capacity(self.config.flush_size),
                    ));
                }
            }
        }
        for traces in ready {
            self.dispatch(traces)?;
        }
        Ok(())
    }

    /// Flushes whatever is queued. Returns how many traces were flushed.
    pub fn flush(&self) -> Result<usize> {
        let traces = std::mem::take(&mut *self.queue());
        if traces.is_empty() {
            return Ok(0);
        }
        self.dispatch(traces)
    }

    fn dispatch(&self, traces: Vec<TraceEvent>) -> Result<usize> {
        let pipeline = self.context.pipeline().cloned();
        let mut batch = self.context.acquire_batch();
        let loaded = batch.load(traces)?;
        if let Some(pipeline) = &pipeline {
            pipeline.fire_all(Phase::Attached, batch.traces());
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        batch.set_sequence(sequence);
        if let Some(pipeline) = &pipeline {
            pipeline.fire_all(Phase::Applied, batch.traces());
        }

        self.flushed_traces.fetch_add(loaded as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(sequence, traces = loaded, "Flushing batch");
        self.context.submit(batch)?;
        Ok(loaded)
    }

    pub fn pending(&self) -> usize {
        self.queue().len()
    }

    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            offered: self.offered.load(Ordering::Relaxed),
            flushed_traces: self.flushed_traces.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Starts a thread that flushes every `flush_interval` until the returned
    /// handle is stopped or the accumulator is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> std::io::Result<FlusherHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let ticker = channel::tick(self.config.flush_interval);
        let weak: Weak<TraceAccumulator> = Arc::downgrade(self);

        let thread = thread::Builder::new()
            .name("tracewire-flusher".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        let Some(accumulator) = weak.upgrade() else { break };
                        if let Err(e) = accumulator.flush() {
                            tracing::warn!("Timed flush failed: {}", e);
                        }
                    }
                }
            })?;

        Ok(FlusherHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the background flusher when dropped.
pub struct FlusherHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FlusherHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Flusher thread panicked");
            }
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::LocalQueueEndpoint;
    use crate::metric_type::MetricType;
    use crate::phase::{PhasePipeline, TriggerBinding};
    use crate::pool::{WorkerPool, WorkerPoolConfig};
    use crossbeam::channel::Receiver;
    use serde_json::json;
    use std::sync::OnceLock;

    const WAIT: Duration = Duration::from_secs(5);

    fn trace(i: u64) -> TraceEvent {
        TraceEvent::new(format!("h/a:m{}", i), MetricType::LongAvg, json!(i)).at(10)
    }

    fn setup(
        flush_size: usize,
        pipeline: Option<PhasePipeline>,
    ) -> (Arc<TraceAccumulator>, Arc<LocalQueueEndpoint>, Receiver<i64>) {
        let sink = Arc::new(LocalQueueEndpoint::new("sink", 10_000));
        let (closed_tx, closed_rx) = channel::unbounded();
        // One worker keeps batch completion in submission order.
        let executor = Arc::new(WorkerPool::new(WorkerPoolConfig {
            threads: 1,
            ..WorkerPoolConfig::default()
        }));
        let mut builder = BatchSubmissionContext::builder()
            .endpoint(sink.clone())
            .executor(executor)
            .closer(move |batch| {
                let _ = closed_tx.send(batch.sequence());
            });
        if let Some(pipeline) = pipeline {
            builder = builder.pipeline(Arc::new(pipeline));
        }
        let accumulator = TraceAccumulator::new(
            AccumulatorConfig {
                flush_size,
                flush_interval: Duration::from_millis(20),
            },
            builder.build(),
        );
        (Arc::new(accumulator), sink, closed_rx)
    }

    #[test]
    fn test_flushes_when_size_reached() {
        let (accumulator, sink, closed) = setup(3, None);
        for i in 0..7 {
            accumulator.offer(trace(i)).unwrap();
        }

        assert_eq!(closed.recv_timeout(WAIT).unwrap(), 1);
        assert_eq!(closed.recv_timeout(WAIT).unwrap(), 2);
        assert_eq!(accumulator.pending(), 1);
        assert_eq!(sink.len(), 6);

        assert_eq!(accumulator.flush().unwrap(), 1);
        assert_eq!(closed.recv_timeout(WAIT).unwrap(), 3);
        assert_eq!(accumulator.flush().unwrap(), 0);

        let stats = accumulator.stats();
        assert_eq!(stats.offered, 7);
        assert_eq!(stats.flushed_traces, 7);
        assert_eq!(stats.batches, 3);
    }

    #[test]
    fn test_phases_fire_in_pipeline_order() {
        let (phase_tx, phase_rx) = channel::unbounded();
        let mut pipeline = PhasePipeline::new(Arc::new(WorkerPool::default()));
        pipeline
            .register(
                TriggerBinding::new(Arc::new(move |phase: Phase, _: &TraceEvent| {
                    let _ = phase_tx.send(phase);
                }))
                .phases(&Phase::ALL),
            )
            .unwrap();

        let (accumulator, _sink, closed) = setup(100, Some(pipeline));
        accumulator.offer(trace(1)).unwrap();
        accumulator.flush().unwrap();
        closed.recv_timeout(WAIT).unwrap();

        let phases: Vec<Phase> = phase_rx.try_iter().collect();
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[test]
    fn test_background_flusher_drains_queue() {
        let (accumulator, sink, closed) = setup(1_000, None);
        let flusher = accumulator.spawn_flusher().unwrap();

        accumulator.offer_all((0..5).map(trace)).unwrap();
        closed.recv_timeout(WAIT).unwrap();
        assert_eq!(sink.len(), 5);

        flusher.stop();
    }

    #[test]
    fn test_subq_trigger_may_offer_back_into_accumulator() {
        let slot: Arc<OnceLock<Weak<TraceAccumulator>>> = Arc::new(OnceLock::new());
        let mut pipeline = PhasePipeline::new(Arc::new(WorkerPool::default()));
        let echo_slot = slot.clone();
        pipeline
            .register(
                TriggerBinding::new(Arc::new(move |_: Phase, trace: &TraceEvent| {
                    if trace.metric.ends_with(":echo") {
                        return;
                    }
                    let accumulator = echo_slot.get().and_then(Weak::upgrade);
                    if let Some(accumulator) = accumulator {
                        let echo = TraceEvent::new(format!("{}:echo", trace.metric), MetricType::String, json!("seen"));
                        accumulator.offer(echo).unwrap();
                    }
                }))
                .phase(Phase::Subq),
            )
            .unwrap();

        let (accumulator, sink, closed) = setup(100, Some(pipeline));
        slot.set(Arc::downgrade(&accumulator)).unwrap();

        let (done_tx, done_rx) = channel::bounded(1);
        let offering = accumulator.clone();
        thread::spawn(move || {
            let _ = done_tx.send(offering.offer(trace(1)));
        });
        done_rx.recv_timeout(WAIT).unwrap().unwrap();

        assert_eq!(accumulator.pending(), 2);
        assert_eq!(accumulator.flush().unwrap(), 2);
        closed.recv_timeout(WAIT).unwrap();
        assert_eq!(sink.len(), 2);
    }
}
