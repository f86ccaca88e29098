//! A time-shared resource consumed in slices by cooperating tasks
//!
//! A [`ProcessClock`] models one processor shared by several logical
//! processes. A task calling [`ProcessClock::advance`] asks for `amount`
//! ticks of processing and is suspended until it got them. Consumers are
//! served round-robin in slices of at most `quantum` ticks, so with several
//! consumers each call takes longer than its own `amount` in simulated time.
//!
//! # Example
//!
//! ```
//! use des_kernel::{ProcessClock, Simulation};
//!
//! let sim = Simulation::new();
//! let cpu = ProcessClock::new(&sim, Some("cpu"), false, 2).unwrap();
//! for id in ["a", "b"] {
//!     let cpu = cpu.clone();
//!     sim.schedule_task(move || {
//!         let elapsed = cpu.advance(id, 4)?;
//!         assert!(elapsed >= 4);
//!         Ok(())
//!     }, 0).unwrap();
//! }
//!
//! sim.run().unwrap();
//! assert_eq!(sim.current_ticks(), 8);
//! assert_eq!(cpu.consumed("a"), 4);
//! ```

use crate::core::error::SimError;
use crate::sim::event::SimulationEvent;
use crate::sim::simulation::Simulation;
use crate::task::thread::TaskThread;
use crate::trace::object::{ObjectCore, SimObject};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct Waiter {
    consumer: String,
    task: TaskThread,
    remaining: i64,
    started: i64,
    elapsed: Arc<AtomicI64>,
}

struct Slice {
    waiter: Waiter,
    event: SimulationEvent,
    length: i64,
    began: i64,
}

#[derive(Default)]
struct ClockState {
    consumed: HashMap<String, i64>,
    ring: VecDeque<Waiter>,
    running: Option<Slice>,
}

struct ProcessClockInner {
    object: ObjectCore,
    quantum: i64,
    state: Mutex<ClockState>,
}

/// Shared processor time, handed out round-robin
#[derive(Clone)]
pub struct ProcessClock {
    inner: Arc<ProcessClockInner>,
}

impl ProcessClock {
    /// Create a clock serving slices of at most `quantum` ticks
    ///
    /// # Arguments
    ///
    /// * `name` - Object name; generated as `processClock{n}` if `None`
    /// * `intern` - Register the clock in the simulation's name table
    /// * `quantum` - Maximum slice length, must be positive
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool, quantum: i64) -> Result<Self, SimError> {
        if quantum <= 0 {
            return Err(SimError::InvalidArgument(format!(
                "process clock quantum must be positive, got {quantum}"
            )));
        }
        let clock = Self {
            inner: Arc::new(ProcessClockInner {
                object: ObjectCore::new(sim, "processClock", name, intern),
                quantum,
                state: Mutex::new(ClockState::default()),
            }),
        };
        if intern {
            sim.register(clock.inner.object.name(), Arc::new(clock.clone()))?;
        }
        Ok(clock)
    }

    pub fn quantum(&self) -> i64 {
        self.inner.quantum
    }

    /// Total ticks of processing `consumer` received so far
    pub fn consumed(&self, consumer: &str) -> i64 {
        self.inner
            .state
            .lock()
            .consumed
            .get(consumer)
            .copied()
            .unwrap_or(0)
    }

    /// Consumers currently inside [`advance`](Self::advance)
    pub fn waiting(&self) -> usize {
        let state = self.inner.state.lock();
        state.ring.len() + usize::from(state.running.is_some())
    }

    /// Consume `amount` ticks of processing on behalf of `consumer`
    ///
    /// Suspends the calling task until the processing is done and returns
    /// the simulated ticks that elapsed meanwhile, which is at least
    /// `amount`. A zero amount returns at once.
    pub fn advance(&self, consumer: &str, amount: i64) -> Result<i64, SimError> {
        if amount < 0 {
            return Err(SimError::InvalidArgument(format!(
                "cannot advance a process clock by {amount} ticks"
            )));
        }
        if TaskThread::current().is_none() {
            return Err(SimError::NotTaskThread);
        }
        if amount == 0 {
            return Ok(0);
        }

        let elapsed = Arc::new(AtomicI64::new(0));
        let sim = self.inner.object.simulation().clone();
        let outcome = TaskThread::suspend_with(|task| {
            self.inner.state.lock().ring.push_back(Waiter {
                consumer: consumer.to_string(),
                task: task.clone(),
                remaining: amount,
                started: sim.current_ticks(),
                elapsed: Arc::clone(&elapsed),
            });
            start_slice(&self.inner)?;
            Ok(None)
        });
        match outcome {
            Ok(()) => Ok(elapsed.load(Ordering::SeqCst)),
            Err(err) => {
                if let Some(task) = TaskThread::current() {
                    self.abandon(&task);
                }
                Err(err)
            }
        }
    }

    /// Drop a canceled task's claim, crediting the part of its slice it used
    fn abandon(&self, task: &TaskThread) {
        let now = self.inner.object.simulation().current_ticks();
        let interrupted = {
            let mut state = self.inner.state.lock();
            state.ring.retain(|waiter| !waiter.task.ptr_eq(task));
            let owns_slice = state
                .running
                .as_ref()
                .map_or(false, |slice| slice.waiter.task.ptr_eq(task));
            if owns_slice {
                state.running.take().map(|slice| {
                    let used = now - slice.began;
                    *state.consumed.entry(slice.waiter.consumer.clone()).or_insert(0) += used;
                    slice.event
                })
            } else {
                None
            }
        };
        if let Some(event) = interrupted {
            event.cancel();
            if let Err(err) = start_slice(&self.inner) {
                tracing::warn!(clock = %self.inner.object.name(), error = %err, "could not start next slice");
            }
        }
    }
}

/// Give the processor to the next waiting consumer if it is idle
fn start_slice(inner: &Arc<ProcessClockInner>) -> Result<(), SimError> {
    let sim = inner.object.simulation();
    let mut state = inner.state.lock();
    if state.running.is_some() {
        return Ok(());
    }
    let Some(waiter) = state.ring.pop_front() else {
        return Ok(());
    };
    let length = waiter.remaining.min(inner.quantum);
    let owner = Arc::clone(inner);
    let event = match sim.schedule_action(Box::new(move || end_slice(&owner)), length, 0.0, None) {
        Ok(event) => event,
        Err(err) => {
            state.ring.push_front(waiter);
            return Err(err);
        }
    };
    tracing::trace!(clock = %inner.object.name(), consumer = %waiter.consumer, length, "slice started");
    state.running = Some(Slice {
        waiter,
        event,
        length,
        began: sim.current_ticks(),
    });
    Ok(())
}

fn end_slice(inner: &Arc<ProcessClockInner>) -> Result<(), SimError> {
    let now = inner.object.simulation().current_ticks();
    let finished = {
        let mut state = inner.state.lock();
        let Some(slice) = state.running.take() else {
            return Ok(());
        };
        let mut waiter = slice.waiter;
        *state.consumed.entry(waiter.consumer.clone()).or_insert(0) += slice.length;
        waiter.remaining -= slice.length;
        if waiter.remaining > 0 {
            state.ring.push_back(waiter);
            None
        } else {
            Some(waiter)
        }
    };
    start_slice(inner)?;

    match finished {
        Some(waiter) => {
            let elapsed = now - waiter.started;
            waiter.elapsed.store(elapsed, Ordering::SeqCst);
            inner
                .object
                .trace(1, format_args!("{} done after {} ticks", waiter.consumer, elapsed));
            waiter.task.resume()
        }
        None => Ok(()),
    }
}

impl SimObject for ProcessClock {
    fn core(&self) -> &ObjectCore {
        &self.inner.object
    }
}

impl fmt::Debug for ProcessClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessClock")
            .field("name", &self.inner.object.name())
            .field("quantum", &self.inner.quantum)
            .field("waiting", &self.waiting())
            .finish()
    }
}
