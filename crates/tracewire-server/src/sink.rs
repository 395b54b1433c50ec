use std::sync::{Arc, Mutex};

use tracewire_trace::{FlusherHandle, TraceAccumulator, TraceEvent};

use crate::session::AgentSession;

/// Destination of traces accepted from agents.
pub trait TraceSink: Send + Sync {
    /// Takes ownership of traces shipped by `session`. Returns how many were
    /// accepted.
    fn accept(&self, session: Option<&AgentSession>, traces: Vec<TraceEvent>) -> tracewire_trace::Result<usize>;
}

/// Feeds accepted traces into a [`TraceAccumulator`], which batches them and
/// hands the batches to its submission context.
pub struct BatchingSink {
    accumulator: Arc<TraceAccumulator>,
    flusher: Mutex<Option<FlusherHandle>>,
}

impl BatchingSink {
    pub fn new(accumulator: Arc<TraceAccumulator>) -> Self {
        BatchingSink {
            accumulator,
            flusher: Mutex::new(None),
        }
    }

    /// Also flushes the accumulator on its configured interval.
    pub fn with_timed_flush(accumulator: Arc<TraceAccumulator>) -> std::io::Result<Self> {
        let flusher = accumulator.spawn_flusher()?;
        Ok(BatchingSink {
            accumulator,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    pub fn accumulator(&self) -> &Arc<TraceAccumulator> {
        &self.accumulator
    }

    /// Stops the timed flusher, pushes out whatever is still queued and shuts
    /// down the dispatch executor.
    ///
    /// Blocks until every submitted batch has been handed to the endpoints.
    /// Traces accepted afterwards are not delivered.
    pub fn close(&self) -> tracewire_trace::Result<usize> {
        let flusher = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(flusher) = flusher {
            flusher.stop();
        }
        let flushed = self.accumulator.flush();
        self.accumulator.context().executor().shutdown();
        flushed
    }
}

impl TraceSink for BatchingSink {
    fn accept(&self, session: Option<&AgentSession>, traces: Vec<TraceEvent>) -> tracewire_trace::Result<usize> {
        let count = traces.len();
        self.accumulator.offer_all(traces)?;
        tracing::debug!(
            session = session.map(|s| s.session_id.as_str()).unwrap_or("-"),
            count,
            "Accepted traces"
        );
        Ok(count)
    }
}
