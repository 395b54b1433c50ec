//! Request/response correlation for synchronous invocations.
//!
//! Every synchronous invocation sent over the control channel gets exactly one
//! entry in the pending table, keyed by its request id. An entry leaves the
//! table through exactly one of three transitions:
//!
//! - a matching [`ProtocolResponse`] arrives ([`InvocationCorrelator::on_response`])
//! - its deadline passes ([`InvocationCorrelator::on_timeout`], the waiter itself
//!   or the background sweeper)
//! - the connection is torn down ([`InvocationCorrelator::fail_all`])
//!
//! Removing the entry from the table is the transition, so whichever path
//! removes it first delivers the outcome and every later path is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::error::{Result, TraceWireError};
use crate::protocol::{Payload, ProtocolInvocation, ProtocolResponse, RequestId};
use crate::transport::MessageSender;

/// Timeout applied to synchronous invocations when the caller does not give one.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(3000);

struct PendingEntry {
    op_code: i32,
    registered_at: Instant,
    timeout: Duration,
    deadline: Instant,
    waiter: oneshot::Sender<Result<Payload>>,
}

struct CorrelatorInner {
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    default_timeout: Duration,
}

impl CorrelatorInner {
    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        // A panic while holding the lock cannot leave an entry half-written,
        // so a poisoned table is still consistent.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn time_out(&self, request_id: RequestId) -> bool {
        let mut table = self.table();
        match table.remove(&request_id) {
            Some(entry) => {
                let timeout_ms = entry.timeout.as_millis() as u64;
                tracing::warn!(
                    request_id,
                    op_code = entry.op_code,
                    timeout_ms,
                    "Invocation timed out"
                );
                let _ = entry.waiter.send(Err(TraceWireError::Timeout {
                    request_id,
                    timeout_ms,
                }));
                true
            }
            None => false,
        }
    }

    fn cancel(&self, request_id: RequestId) {
        if self.table().remove(&request_id).is_some() {
            tracing::debug!(request_id, "Pending invocation abandoned by caller");
        }
    }
}

/// Table of in-flight synchronous invocations for one connection.
///
/// Cloning is cheap and every clone shares the same table, so the reader task
/// that receives responses and the callers that wait on them can each hold one.
#[derive(Clone)]
pub struct InvocationCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl Default for InvocationCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

impl std::fmt::Debug for InvocationCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCorrelator")
            .field("pending", &self.pending_count())
            .field("default_timeout", &self.inner.default_timeout)
            .finish()
    }
}

impl InvocationCorrelator {
    pub fn new(default_timeout: Duration) -> Self {
        InvocationCorrelator {
            inner: Arc::new(CorrelatorInner {
                pending: Mutex::new(HashMap::new()),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Registers a pending entry for a synchronous invocation.
    ///
    /// Must be called before the invocation is written to the wire, otherwise a
    /// fast response could arrive before there is anything to correlate it with.
    /// Fails with [`TraceWireError::StateViolation`] for fire-and-forget ops and
    /// for a request id that is already pending.
    pub fn register(
        &self,
        invocation: &ProtocolInvocation,
        timeout: Option<Duration>,
    ) -> Result<PendingInvocation> {
        if invocation.is_async() {
            return Err(TraceWireError::StateViolation(format!(
                "op {} is fire-and-forget and cannot be correlated",
                invocation.op_code()
            )));
        }

        let request_id = invocation.request_id();
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let registered_at = Instant::now();
        let deadline = registered_at + timeout;
        let (waiter, receiver) = oneshot::channel();

        let mut table = self.inner.table();
        if table.contains_key(&request_id) {
            return Err(TraceWireError::StateViolation(format!(
                "request {} is already pending",
                request_id
            )));
        }
        table.insert(
            request_id,
            PendingEntry {
                op_code: invocation.op_code(),
                registered_at,
                timeout,
                deadline,
                waiter,
            },
        );
        drop(table);

        tracing::trace!(request_id, timeout_ms = timeout.as_millis() as u64, "Registered invocation");

        Ok(PendingInvocation {
            request_id,
            timeout,
            deadline,
            receiver,
            correlator: Arc::downgrade(&self.inner),
        })
    }

    /// Sends an invocation and, for synchronous ops, waits for its outcome.
    ///
    /// Fire-and-forget ops return `Ok(None)` as soon as the message is queued.
    /// Synchronous ops resolve to the response payload, or fail with
    /// [`TraceWireError::Remote`], [`TraceWireError::Timeout`] or
    /// [`TraceWireError::ConnectionLost`].
    pub async fn send(
        &self,
        outbound: &MessageSender,
        invocation: ProtocolInvocation,
        timeout: Option<Duration>,
    ) -> Result<Option<Payload>> {
        if invocation.is_async() {
            outbound.send(invocation).await?;
            return Ok(None);
        }

        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let invocation = invocation.with_timeout(timeout);
        let pending = self.register(&invocation, Some(timeout))?;
        // A stalled writer must not hold the caller past its deadline.
        // Dropping `pending` on a failed send removes the entry again.
        match tokio::time::timeout_at(pending.deadline(), outbound.send(invocation)).await {
            Ok(sent) => sent?,
            Err(_) => {
                self.on_timeout(pending.request_id());
                return Err(TraceWireError::Timeout {
                    request_id: pending.request_id(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        pending.wait().await.map(Some)
    }

    /// Resolves the pending entry matching the response's request id.
    ///
    /// Returns `false` when nothing is pending for that id (already resolved,
    /// timed out, or never registered); the response is then discarded.
    pub fn on_response(&self, response: ProtocolResponse) -> bool {
        let request_id = response.request_id();
        let mut table = self.inner.table();
        match table.remove(&request_id) {
            Some(entry) => {
                tracing::debug!(
                    request_id,
                    elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Invocation resolved"
                );
                if entry.op_code != response.op_code() {
                    tracing::debug!(
                        request_id,
                        expected = entry.op_code,
                        actual = response.op_code(),
                        "Response op code does not match invocation"
                    );
                }
                // The waiter may already be gone; the entry is resolved either way.
                let _ = entry.waiter.send(response.into_result());
                true
            }
            None => {
                tracing::debug!(request_id, "Discarding response with no pending invocation");
                false
            }
        }
    }

    /// Fails the pending entry with [`TraceWireError::Timeout`] if it is still pending.
    pub fn on_timeout(&self, request_id: RequestId) -> bool {
        self.inner.time_out(request_id)
    }

    /// Times out every entry whose deadline has passed. Returns how many were failed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .inner
            .table()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter(|id| self.inner.time_out(*id))
            .count()
    }

    /// Spawns a task that calls [`sweep_expired`](Self::sweep_expired) every
    /// `interval`, so entries expire even when nobody is awaiting them.
    ///
    /// The task exits on its own once every clone of this correlator is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let correlator = InvocationCorrelator { inner };
                let swept = correlator.sweep_expired();
                if swept > 0 {
                    tracing::debug!(swept, "Expired pending invocations");
                }
            }
        })
    }

    /// Fails every pending entry with [`TraceWireError::ConnectionLost`].
    ///
    /// Called when the connection closes; returns how many entries were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingEntry)> = self.inner.table().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry
                .waiter
                .send(Err(TraceWireError::ConnectionLost(reason.to_string())));
        }
        if count > 0 {
            tracing::warn!(count, reason, "Failed pending invocations");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.inner.table().contains_key(&request_id)
    }
}

/// Caller-side handle for one registered invocation.
///
/// Dropping the handle before it resolves removes the pending entry, so an
/// abandoned call never leaks a table slot.
#[must_use = "a pending invocation is cancelled when dropped"]
pub struct PendingInvocation {
    request_id: RequestId,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<Payload>>,
    correlator: Weak<CorrelatorInner>,
}

impl PendingInvocation {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the response, the deadline, or connection loss, whichever
    /// resolves the entry first.
    pub async fn wait(mut self) -> Result<Payload> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TraceWireError::ConnectionLost(
                "correlator dropped before the invocation resolved".to_string(),
            )),
            Err(_) => {
                if let Some(inner) = self.correlator.upgrade() {
                    inner.time_out(self.request_id);
                }
                // Whichever transition removed the entry has already delivered.
                match self.receiver.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TraceWireError::Timeout {
                        request_id: self.request_id,
                        timeout_ms: self.timeout.as_millis() as u64,
                    }),
                }
            }
        }
    }
}

impl std::fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInvocation")
            .field("request_id", &self.request_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if let Some(inner) = self.correlator.upgrade() {
            inner.cancel(self.request_id);
        }
    }
}
