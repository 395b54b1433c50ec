use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tracewire_common::protocol::error::{Result, TraceWireError};
use tracewire_trace::{metric_name, DeltaManager, MetricType, TraceEvent};

use crate::client::AgentClient;

/// Counters reported by [`AgentTracer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub traced: u64,
    /// Delta samples that produced no value (first sample, or a rebased reset).
    pub skipped: u64,
    pub shipped: u64,
    /// Traces lost because a flush could not reach the server.
    pub dropped: u64,
}

/// Builds trace events for one host/agent and ships them in batches.
///
/// Delta metric types go through the [`DeltaManager`] first; everything
/// else is buffered as-is. The buffer is flushed when it reaches the
/// configured flush size, on an explicit [`flush`](AgentTracer::flush), or on
/// the interval driven by [`spawn_flusher`](AgentTracer::spawn_flusher).
pub struct AgentTracer {
    client: Arc<AgentClient>,
    deltas: DeltaManager,
    buffer: Mutex<Vec<TraceEvent>>,
    flush_size: usize,
    traced: AtomicU64,
    skipped: AtomicU64,
    shipped: AtomicU64,
    dropped: AtomicU64,
}

impl AgentTracer {
    pub fn new(client: Arc<AgentClient>, deltas: DeltaManager) -> Self {
        let flush_size = client.config().flush_size.max(1);
        AgentTracer {
            client,
            deltas,
            buffer: Mutex::new(Vec::with_capacity(flush_size)),
            flush_size,
            traced: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            shipped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<AgentClient> {
        &self.client
    }

    pub fn deltas(&self) -> &DeltaManager {
        &self.deltas
    }

    /// Fully qualified metric name under this agent's host and id.
    pub fn metric_name(&self, namespace: &[&str], name: &str) -> String {
        let config = self.client.config();
        metric_name(&config.host, &config.agent_id, namespace, name)
    }

    /// Records one observation.
    ///
    /// Returns `Ok(false)` when a delta metric produced no value yet. Delta
    /// types require an integer value.
    pub async fn trace(
        &self,
        namespace: &[&str],
        name: &str,
        metric_type: MetricType,
        value: Value,
    ) -> Result<bool> {
        let metric = self.metric_name(namespace, name);
        let value = if metric_type.is_delta() {
            let raw = value.as_i64().ok_or_else(|| {
                TraceWireError::StateViolation(format!(
                    "delta metric {} requires an integer value, got {}",
                    metric, value
                ))
            })?;
            let delta = self
                .deltas
                .delta_typed(&metric, raw, metric_type)
                .map_err(|e| TraceWireError::StateViolation(e.to_string()))?;
            match delta {
                Some(delta) => Value::from(delta),
                None => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    return Ok(false);
                }
            }
        } else {
            value
        };

        self.traced.fetch_add(1, Ordering::Relaxed);
        let full = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(TraceEvent::new(metric, metric_type, value));
            (buffer.len() >= self.flush_size).then(|| std::mem::take(&mut *buffer))
        };
        if let Some(traces) = full {
            self.ship(traces).await?;
        }
        Ok(true)
    }

    /// Ships everything buffered. Returns the number of traces sent.
    pub async fn flush(&self) -> Result<usize> {
        let traces = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|e| e.into_inner()));
        self.ship(traces).await
    }

    async fn ship(&self, traces: Vec<TraceEvent>) -> Result<usize> {
        let count = traces.len();
        if count == 0 {
            return Ok(0);
        }
        match self.client.submit_traces(traces).await {
            Ok(()) => {
                self.shipped.fetch_add(count as u64, Ordering::Relaxed);
                Ok(count)
            }
            Err(e) => {
                self.dropped.fetch_add(count as u64, Ordering::Relaxed);
                tracing::warn!(count, "Dropping traces: {}", e);
                Err(e)
            }
        }
    }

    /// Traces buffered and not yet shipped.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> TracerStats {
        TracerStats {
            traced: self.traced.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            shipped: self.shipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Flushes on the configured interval until the tracer is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        spawn_interval_flusher(Arc::downgrade(self), self.client.config().flush_interval)
    }
}

fn spawn_interval_flusher(tracer: Weak<AgentTracer>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(tracer) = tracer.upgrade() else {
                break;
            };
            if let Err(e) = tracer.flush().await {
                tracing::debug!("Timed flush failed: {}", e);
            }
        }
    })
}
