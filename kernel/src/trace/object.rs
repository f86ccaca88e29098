//! Named simulation objects and their trace-set attachments
//!
//! Queues, servers, process clocks and user types embed an [`ObjectCore`]
//! and implement [`SimObject`] to get a name, a simulation reference, and
//! trace output through their attached trace sets.

use crate::sim::simulation::Simulation;
use crate::trace::trace_set::TraceSet;
use parking_lot::Mutex;
use std::fmt;

/// Common state of every named simulation object
pub struct ObjectCore {
    sim: Simulation,
    kind: &'static str,
    name: String,
    interned: bool,
    trace_sets: Mutex<Vec<TraceSet>>,
}

impl ObjectCore {
    /// Create the core for an object of `kind`
    ///
    /// Without a name the object is called `"{kind}{n}"`. Interning is the
    /// owner's job (`Simulation::register`) since only it holds the `Arc`.
    pub fn new(sim: &Simulation, kind: &'static str, name: Option<&str>, interned: bool) -> Self {
        let name = match name {
            Some(name) => name.to_string(),
            None => sim.generate_name(kind),
        };
        Self {
            sim: sim.clone(),
            kind,
            name,
            interned,
            trace_sets: Mutex::new(Vec::new()),
        }
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_interned(&self) -> bool {
        self.interned
    }

    /// Attach a trace set; attaching the same set twice is a no-op
    pub fn add_trace_set(&self, set: &TraceSet) {
        let mut sets = self.trace_sets.lock();
        if !sets.iter().any(|s| s.ptr_eq(set)) {
            sets.push(set.clone());
        }
    }

    pub fn remove_trace_set(&self, set: &TraceSet) -> bool {
        let mut sets = self.trace_sets.lock();
        let before = sets.len();
        sets.retain(|s| !s.ptr_eq(set));
        sets.len() != before
    }

    pub fn clear_trace_sets(&self) {
        self.trace_sets.lock().clear();
    }

    pub fn trace_sets(&self) -> Vec<TraceSet> {
        self.trace_sets.lock().clone()
    }

    /// Lowest level among the attached sets, `None` if none is attached
    pub fn trace_level(&self) -> Option<i32> {
        self.trace_sets.lock().iter().map(TraceSet::level).min()
    }

    /// True if a call at `level` would reach at least one attached set
    pub fn trace_level_enabled(&self, level: i32) -> bool {
        self.sim.is_tracing_enabled() && self.trace_level().map_or(false, |min| min <= level)
    }

    /// Write `message` through every attached set accepting `level`
    pub fn trace(&self, level: i32, message: fmt::Arguments<'_>) {
        if !self.sim.is_tracing_enabled() {
            return;
        }
        for set in self.trace_sets() {
            if let Err(err) = set.emit(&self.name, self.interned, level, &message) {
                tracing::warn!(object = %self.name, trace_set = %set.name(), error = %err, "trace output failed");
            }
        }
    }
}

impl fmt::Debug for ObjectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCore")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("interned", &self.interned)
            .finish()
    }
}

/// A named object living in a simulation
pub trait SimObject: Send + Sync {
    fn core(&self) -> &ObjectCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn is_interned(&self) -> bool {
        self.core().is_interned()
    }

    fn simulation(&self) -> &Simulation {
        self.core().simulation()
    }

    fn add_trace_set(&self, set: &TraceSet) {
        self.core().add_trace_set(set)
    }

    fn remove_trace_set(&self, set: &TraceSet) -> bool {
        self.core().remove_trace_set(set)
    }

    fn trace_level_enabled(&self, level: i32) -> bool {
        self.core().trace_level_enabled(level)
    }

    /// Prefer the [`sim_trace!`](crate::sim_trace) macro at call sites
    fn trace(&self, level: i32, message: fmt::Arguments<'_>) {
        self.core().trace(level, message)
    }
}

/// Trace through a [`SimObject`] with `format!`-style arguments
///
/// ```
/// use des_kernel::{sim_trace, ObjectCore, SimObject, Simulation, TraceSet};
///
/// struct Gauge(ObjectCore);
/// impl SimObject for Gauge {
///     fn core(&self) -> &ObjectCore { &self.0 }
/// }
///
/// let sim = Simulation::new();
/// sim.set_trace_output(Vec::new());
/// let gauge = Gauge(ObjectCore::new(&sim, "gauge", Some("p"), false));
/// gauge.add_trace_set(&TraceSet::new(&sim, None, false).unwrap());
/// sim_trace!(gauge, 1, "value is {}", 42);
/// ```
#[macro_export]
macro_rules! sim_trace {
    ($object:expr, $level:expr, $($arg:tt)+) => {
        $crate::SimObject::trace(&$object, $level, format_args!($($arg)+))
    };
}
