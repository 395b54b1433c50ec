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

//! Bounded worker pool used for batch dispatch and asynchronous phase triggers.
//!
//! Tasks go through a bounded crossbeam channel to a fixed set of named OS
//! threads. When the queue is full the pool's [`RejectionPolicy`] decides what
//! happens to the task:
//!
//! - [`RejectionPolicy::CallerRuns`] runs it on the submitting thread, which
//!   slows the producer down instead of losing work
//! - [`RejectionPolicy::Abort`] refuses it with [`TraceError::Rejected`]

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracewire_common::config::env_or;

use crate::error::{Result, TraceError};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPolicy {
    CallerRuns,
    Abort,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for worker thread names.
    pub name: String,
    pub threads: usize,
    pub queue_size: usize,
    pub rejection_policy: RejectionPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            name: "tracewire-worker".to_string(),
            threads: cpus * 2,
            queue_size: 100,
            rejection_policy: RejectionPolicy::CallerRuns,
        }
    }
}

impl WorkerPoolConfig {
    /// Reads `TRACEWIRE_POOL_THREADS` and `TRACEWIRE_POOL_QUEUE_SIZE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            threads: env_or("POOL_THREADS", defaults.threads),
            queue_size: env_or("POOL_QUEUE_SIZE", defaults.queue_size),
            ..defaults
        }
    }
}

/// Counters describing what a pool has done so far.
#[derive(Debug, Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    caller_runs: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub caller_runs: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub active: usize,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.config.name)
            .field("threads", &self.config.threads)
            .field("queue_size", &self.config.queue_size)
            .field("rejection_policy", &self.config.rejection_policy)
            .field("active", &self.stats.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolConfig::default())
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let threads = config.threads.max(1);
        let (sender, receiver) = channel::bounded::<Task>(config.queue_size.max(1));
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let stats = stats.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker_loop(receiver, stats));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => tracing::error!(pool = %config.name, "Failed to spawn worker thread: {}", e),
            }
        }

        tracing::debug!(
            pool = %config.name,
            threads = workers.len(),
            queue_size = config.queue_size,
            "Worker pool started"
        );

        WorkerPool {
            config,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stats,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Queues `task` for a worker thread, applying the rejection policy when
    /// the queue is full.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TraceError::PoolShutdown(self.config.name.clone()))?;

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => match self.config.rejection_policy {
                RejectionPolicy::CallerRuns => {
                    self.stats.caller_runs.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pool = %self.config.name, "Queue full, running task on caller");
                    run_task(task, &self.stats);
                    Ok(())
                }
                RejectionPolicy::Abort => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    Err(TraceError::Rejected {
                        pool: self.config.name.clone(),
                        queue_size: self.config.queue_size,
                    })
                }
            },
            Err(TrySendError::Disconnected(_)) => {
                Err(TraceError::PoolShutdown(self.config.name.clone()))
            }
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            caller_runs: self.stats.caller_runs.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Stops accepting tasks, lets the workers drain the queue and joins them.
    ///
    /// Calling it again is a no-op. Must not be called from one of the pool's
    /// own workers.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(pool = %self.config.name, "Worker thread exited abnormally");
            }
        }
        tracing::debug!(pool = %self.config.name, "Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Task>, stats: Arc<PoolStats>) {
    while let Ok(task) = receiver.recv() {
        run_task(task, &stats);
    }
}

fn run_task(task: Task, stats: &PoolStats) {
    stats.active.fetch_add(1, Ordering::Relaxed);
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        stats.panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!("Worker task panicked");
    }
    stats.active.fetch_sub(1, Ordering::Relaxed);
    stats.completed.fetch_add(1, Ordering::Relaxed);
}
