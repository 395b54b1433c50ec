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

use thiserror::Error;

/// Errors raised by the trace pipeline.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A caller broke a pipeline contract, such as loading a batch that still
    /// holds traces or exceeding the context-tag slots. Never retried.
    #[error("State violation: {0}")]
    StateViolation(String),

    /// The worker pool's queue was full and its policy is to reject.
    #[error("Worker pool '{pool}' rejected task: queue of {queue_size} is full")]
    Rejected { pool: String, queue_size: usize },

    #[error("Worker pool '{0}' is shut down")]
    PoolShutdown(String),
}

impl TraceError {
    pub fn is_state_violation(&self) -> bool {
        matches!(self, TraceError::StateViolation(_))
    }
}

/// Failure reported by a single endpoint while connecting or processing a batch.
///
/// An endpoint error is contained to the endpoint that raised it; sibling
/// endpoints and the batch's completion accounting are unaffected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The endpoint lost (or never had) its downstream connection.
    #[error("Endpoint connect error: {0}")]
    Connect(String),

    /// The endpoint was connected but failed to accept the traces.
    #[error("Endpoint trace error: {0}")]
    Trace(String),

    #[error("Endpoint panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, TraceError>;
