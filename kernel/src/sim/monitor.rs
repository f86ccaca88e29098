//! Run-loop pause policies
//!
//! `Simulation::run_with` asks its monitor whether to pause once before the
//! first event and again after every dispatched event. A monitor may look at
//! `next_event_interval()` and call `advance()` between events.

use crate::sim::simulation::Simulation;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Decides when `run_with` returns even though events remain
pub trait SimulationMonitor {
    /// Return true to stop the run loop
    fn simulation_pauses(&mut self, sim: &Simulation) -> bool;

    /// Called at the top of every `run_with`, before the pre-run check
    fn run_starts(&mut self, _sim: &Simulation) {}
}

impl<F> SimulationMonitor for F
where
    F: FnMut(&Simulation) -> bool,
{
    fn simulation_pauses(&mut self, sim: &Simulation) -> bool {
        self(sim)
    }
}

/// Pauses when an external flag is raised
///
/// # Example
/// ```
/// use des_kernel::{Simulation, StopFlagMonitor};
///
/// let sim = Simulation::new();
/// let mut monitor = StopFlagMonitor::new();
/// let stop = monitor.flag();
/// sim.schedule_call(move || stop.store(true, std::sync::atomic::Ordering::SeqCst), 1).unwrap();
/// sim.schedule_call(|| {}, 2).unwrap();
///
/// sim.run_with(&mut monitor).unwrap();
/// assert_eq!(sim.current_ticks(), 1);
/// assert!(sim.more_events_scheduled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopFlagMonitor {
    flag: Arc<AtomicBool>,
}

impl StopFlagMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared flag; storing `true` pauses the run after the current event
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Lower the flag so the next run continues
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl SimulationMonitor for StopFlagMonitor {
    fn simulation_pauses(&mut self, _sim: &Simulation) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pauses each run after `every` dispatched events
///
/// The count restarts with every `run_with`, whether the previous run paused
/// or drained the queue.
#[derive(Debug, Clone)]
pub struct EventCountMonitor {
    every: u64,
    seen: u64,
    this_run: u64,
    pre_run: bool,
}

impl EventCountMonitor {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
            this_run: 0,
            pre_run: true,
        }
    }

    /// Events observed across all runs
    pub fn events_seen(&self) -> u64 {
        self.seen
    }
}

impl SimulationMonitor for EventCountMonitor {
    fn run_starts(&mut self, _sim: &Simulation) {
        self.this_run = 0;
        self.pre_run = true;
    }

    fn simulation_pauses(&mut self, _sim: &Simulation) -> bool {
        // the pre-run consultation is not an event
        if self.pre_run {
            self.pre_run = false;
            return false;
        }
        self.seen += 1;
        self.this_run += 1;
        self.this_run >= self.every
    }
}

/// Pauses once the clock would move past a tick limit
///
/// Before the next event, if it lies past `limit`, the monitor advances the
/// clock to `limit` and pauses, leaving the event queued.
#[derive(Debug, Clone, Copy)]
pub struct TickLimitMonitor {
    limit: i64,
}

impl TickLimitMonitor {
    pub fn new(limit: i64) -> Self {
        Self { limit }
    }
}

impl SimulationMonitor for TickLimitMonitor {
    fn simulation_pauses(&mut self, sim: &Simulation) -> bool {
        let now = sim.current_ticks();
        match sim.next_event_interval() {
            Some(interval) if now + interval <= self.limit => false,
            _ => {
                if now < self.limit {
                    // capped by the next event, which lies past the limit
                    if let Err(err) = sim.advance(self.limit - now) {
                        tracing::warn!(limit = self.limit, error = %err, "could not advance clock to tick limit");
                    }
                }
                true
            }
        }
    }
}
