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

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TraceError};
use crate::trace::TraceEvent;

/// Number of context-tag slots a batch holds.
pub const CONTEXT_TAG_SLOTS: usize = 101;

/// Opaque value attached to a batch for the endpoints and closer to retrieve.
pub type ContextTag = Arc<dyn Any + Send + Sync>;

static BATCH_SERIAL: AtomicI64 = AtomicI64::new(0);

/// A reusable, de-duplicated collection of trace events dispatched as a unit.
///
/// A batch is loaded once, submitted, and reset before being loaded again.
/// Endpoints only ever see it through a shared reference.
pub struct TraceBatch {
    serial: i64,
    traces: HashSet<TraceEvent>,
    context_tags: Vec<ContextTag>,
    sequence: i64,
}

impl fmt::Debug for TraceBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBatch")
            .field("serial", &self.serial)
            .field("traces", &self.traces.len())
            .field("context_tags", &self.context_tags.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Default for TraceBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceBatch {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        TraceBatch {
            serial: BATCH_SERIAL.fetch_add(1, Ordering::Relaxed) + 1,
            traces: HashSet::with_capacity(capacity),
            context_tags: Vec::new(),
            sequence: -1,
        }
    }

    /// Unique, process-wide identity of this batch instance. Survives [`reset`](Self::reset).
    pub fn serial(&self) -> i64 {
        self.serial
    }

    /// Fills an empty batch. Duplicate events (same metric and timestamp) collapse.
    ///
    /// Loading a batch that still holds traces fails with
    /// [`TraceError::StateViolation`] and leaves the batch untouched.
    pub fn load<I>(&mut self, traces: I) -> Result<usize>
    where
        I: IntoIterator<Item = TraceEvent>,
    {
        if !self.traces.is_empty() {
            return Err(TraceError::StateViolation(format!(
                "batch #{} loaded while still holding {} traces",
                self.serial,
                self.traces.len()
            )));
        }
        self.traces.extend(traces);
        Ok(self.traces.len())
    }

    pub fn traces(&self) -> impl Iterator<Item = &TraceEvent> {
        self.traces.iter()
    }

    pub fn contains(&self, trace: &TraceEvent) -> bool {
        self.traces.contains(trace)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Stores `tag` in the next free slot and returns its index.
    pub fn set_context_tag(&mut self, tag: ContextTag) -> Result<usize> {
        if self.context_tags.len() >= CONTEXT_TAG_SLOTS {
            return Err(TraceError::StateViolation(format!(
                "batch #{} has no free context-tag slot (max {})",
                self.serial, CONTEXT_TAG_SLOTS
            )));
        }
        self.context_tags.push(tag);
        Ok(self.context_tags.len() - 1)
    }

    pub fn context_tag(&self, index: usize) -> Option<&ContextTag> {
        self.context_tags.get(index)
    }

    /// The tag at `index`, if it is a `T`.
    pub fn context_tag_as<T: Any + Send + Sync>(&self, index: usize) -> Option<&T> {
        self.context_tags.get(index).and_then(|tag| tag.downcast_ref::<T>())
    }

    /// Copy of the occupied tag slots.
    pub fn context_tags(&self) -> Vec<ContextTag> {
        self.context_tags.clone()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: i64) {
        tracing::trace!(serial = self.serial, sequence, "Batch sequence set");
        self.sequence = sequence;
    }

    /// Empties the traces and context tags. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.traces.clear();
        self.context_tags.clear();
        self.sequence = -1;
    }
}
