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

//! Phase triggers: instrumentation hooks fired as traces move through the pipeline.
//!
//! Triggers are bound to an explicit set of [`Phase`]s when the pipeline is
//! wired and never change afterwards. A synchronous trigger runs inline on the
//! thread that fires the phase. An asynchronous trigger is queued on the
//! pipeline's [`WorkerPool`] instead.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{Result, TraceError};
use crate::pool::WorkerPool;
use crate::trace::TraceEvent;

/// Checkpoints a trace crosses, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Submitted to the accumulator queue.
    Subq,
    /// Loaded into a batch.
    Attached,
    /// The batch was stamped with its sequence number.
    Applied,
    /// The batch was handed to the submission context.
    Flushed,
    /// An endpoint accepted the batch holding the trace.
    Endpoint,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Subq,
        Phase::Attached,
        Phase::Applied,
        Phase::Flushed,
        Phase::Endpoint,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Subq => "SUBQ",
            Phase::Attached => "ATTACHED",
            Phase::Applied => "APPLIED",
            Phase::Flushed => "FLUSHED",
            Phase::Endpoint => "ENDPOINT",
        };
        f.write_str(name)
    }
}

/// A hook invoked when a trace reaches one of its bound phases.
pub trait PhaseTrigger: Send + Sync + 'static {
    fn phase_trigger(&self, phase: Phase, trace: &TraceEvent);
}

impl<F> PhaseTrigger for F
where
    F: Fn(Phase, &TraceEvent) + Send + Sync + 'static,
{
    fn phase_trigger(&self, phase: Phase, trace: &TraceEvent) {
        self(phase, trace)
    }
}

/// Wiring-time description of one trigger: which phases, sync or async, and its label.
pub struct TriggerBinding {
    trigger: Arc<dyn PhaseTrigger>,
    name: String,
    named: bool,
    phases: BTreeSet<Phase>,
    asynchronous: bool,
}

impl TriggerBinding {
    /// Starts a binding with no phases. Unless [`named`](Self::named) is called,
    /// the trigger is labelled with its type name and address.
    pub fn new<T: PhaseTrigger>(trigger: Arc<T>) -> Self {
        let name = format!(
            "{}@{:x}",
            std::any::type_name::<T>(),
            Arc::as_ptr(&trigger) as *const () as usize
        );
        TriggerBinding {
            trigger,
            name,
            named: false,
            phases: BTreeSet::new(),
            asynchronous: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.named = true;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.insert(phase);
        self
    }

    pub fn phases(mut self, phases: &[Phase]) -> Self {
        self.phases.extend(phases.iter().copied());
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
struct BoundTrigger {
    name: Arc<str>,
    trigger: Arc<dyn PhaseTrigger>,
    asynchronous: bool,
}

/// Read-mostly map from phase to the triggers bound to it.
pub struct PhasePipeline {
    bindings: HashMap<Phase, Vec<BoundTrigger>>,
    names: HashSet<Arc<str>>,
    pool: Arc<WorkerPool>,
}

impl fmt::Debug for PhasePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bound: Vec<(Phase, Vec<&str>)> = self
            .bindings
            .iter()
            .map(|(phase, triggers)| (*phase, triggers.iter().map(|t| &*t.name).collect()))
            .collect();
        bound.sort_by_key(|(phase, _)| *phase);
        f.debug_struct("PhasePipeline").field("bindings", &bound).finish()
    }
}

impl PhasePipeline {
    /// Creates an empty pipeline whose asynchronous triggers run on `pool`.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        PhasePipeline {
            bindings: HashMap::new(),
            names: HashSet::new(),
            pool,
        }
    }

    /// Binds a trigger to its phases and returns the label it was registered under.
    ///
    /// Fails with [`TraceError::StateViolation`] when the binding names no
    /// phases or its label is already taken.
    pub fn register(&mut self, binding: TriggerBinding) -> Result<String> {
        if binding.phases.is_empty() {
            return Err(TraceError::StateViolation(format!(
                "trigger '{}' is not bound to any phase",
                binding.name
            )));
        }
        if self.names.contains(binding.name.as_str()) {
            let reason = if binding.named {
                "a trigger with this name is already registered"
            } else {
                "this trigger instance is already registered"
            };
            return Err(TraceError::StateViolation(format!(
                "cannot register trigger '{}': {}",
                binding.name, reason
            )));
        }

        let name: Arc<str> = Arc::from(binding.name.as_str());
        let bound = BoundTrigger {
            name: name.clone(),
            trigger: binding.trigger,
            asynchronous: binding.asynchronous,
        };
        for phase in &binding.phases {
            self.bindings.entry(*phase).or_default().push(bound.clone());
        }
        self.names.insert(name);

        tracing::debug!(
            trigger = %binding.name,
            phases = ?binding.phases,
            asynchronous = binding.asynchronous,
            "Registered phase trigger"
        );
        Ok(binding.name)
    }

    pub fn has_triggers(&self, phase: Phase) -> bool {
        self.bindings.get(&phase).is_some_and(|t| !t.is_empty())
    }

    /// Names of the triggers bound to `phase`, in registration order.
    pub fn triggers_for(&self, phase: Phase) -> Vec<String> {
        self.bindings
            .get(&phase)
            .map(|t| t.iter().map(|b| b.name.to_string()).collect())
            .unwrap_or_default()
    }

    /// Fires every trigger bound to `phase` for one trace.
    ///
    /// Synchronous triggers run in registration order before this returns. A
    /// panicking trigger is logged and does not stop the others.
    pub fn fire(&self, phase: Phase, trace: &TraceEvent) {
        let Some(triggers) = self.bindings.get(&phase) else {
            return;
        };
        for bound in triggers {
            if bound.asynchronous {
                let trigger = bound.trigger.clone();
                let name = bound.name.clone();
                let owned = trace.clone();
                let submitted = self.pool.submit(move || {
                    invoke(&name, &*trigger, phase, &owned);
                });
                if let Err(e) = submitted {
                    // Rejected work runs on the caller rather than being dropped.
                    tracing::debug!(trigger = %bound.name, %phase, "Async trigger running inline: {}", e);
                    invoke(&bound.name, &*bound.trigger, phase, trace);
                }
            } else {
                invoke(&bound.name, &*bound.trigger, phase, trace);
            }
        }
    }

    pub fn fire_all<'a, I>(&self, phase: Phase, traces: I)
    where
        I: IntoIterator<Item = &'a TraceEvent>,
    {
        if !self.has_triggers(phase) {
            return;
        }
        for trace in traces {
            self.fire(phase, trace);
        }
    }
}

fn invoke(name: &str, trigger: &dyn PhaseTrigger, phase: Phase, trace: &TraceEvent) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| trigger.phase_trigger(phase, trace)));
    if outcome.is_err() {
        tracing::warn!(trigger = name, %phase, metric = %trace.metric, "Phase trigger panicked");
    }
}
