//! Simulation: scheduling entry points, run loop and object namespace
//!
//! A `Simulation` is a cheap, cloneable handle. It owns a [`Clock`] for
//! tick/time conversion, a private name table and listener list, and a
//! reference to a [`Timeline`] (current tick plus event queue). A child
//! created with [`Simulation::with_parent`] shares its parent's timeline, so
//! several independently named object spaces advance on one clock.
//!
//! # Dispatch
//!
//! The run loop pops one event at a time in `(tick, priority, sequence)`
//! order, moves the clock to it, and runs its action on the calling thread.
//! Task events hand control to the task's thread and block until the task
//! suspends or finishes, so exactly one body of simulation code runs at a
//! time.
//!
//! # Example
//!
//! ```
//! use des_kernel::Simulation;
//! use std::sync::{Arc, Mutex};
//!
//! let sim = Simulation::new();
//! let order = Arc::new(Mutex::new(Vec::new()));
//!
//! let o = order.clone();
//! sim.schedule_call_wp(move || o.lock().unwrap().push("A"), 1.0).unwrap();
//! let o = order.clone();
//! sim.schedule_call_wp(move || o.lock().unwrap().push("B"), -1.0).unwrap();
//!
//! sim.run().unwrap();
//! assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);
//! ```

use crate::core::clock::Clock;
use crate::core::config::SimulationConfig;
use crate::core::error::SimError;
use crate::events::{SimulationListener, SimulationStateEvent};
use crate::sim::event::SimulationEvent;
use crate::sim::event_queue::{Action, Next, Scheduled, Timeline};
use crate::sim::monitor::SimulationMonitor;
use crate::sim::names::NameTable;
use crate::task::thread::{TaskBody, TaskThread};
use crate::trace::trace_set::{capture_stack, SharedWriter};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;

struct TraceSwitches {
    enabled: bool,
    output: Option<SharedWriter>,
    stack_trace_mode: bool,
}

struct SimInner {
    timeline: Arc<Timeline>,
    parent: Option<Simulation>,
    clock: Clock,
    names: NameTable,
    listeners: Mutex<Vec<Arc<dyn SimulationListener>>>,
    trace: Mutex<TraceSwitches>,
    run_id: Uuid,
}

/// Handle to a simulation
///
/// Clones refer to the same simulation.
#[derive(Clone)]
pub struct Simulation {
    inner: Arc<SimInner>,
}

impl Simulation {
    /// Create a root simulation with one tick per unit of time
    pub fn new() -> Self {
        Self::build(Timeline::new(), None, Clock::default(), Uuid::new_v4())
    }

    /// Create a root simulation with a custom tick resolution
    pub fn with_ticks_per_unit_time(ticks_per_unit_time: f64) -> Result<Self, SimError> {
        let clock = Clock::new(ticks_per_unit_time)?;
        Ok(Self::build(Timeline::new(), None, clock, Uuid::new_v4()))
    }

    /// Create a root simulation from a validated configuration
    ///
    /// # Example
    /// ```
    /// use des_kernel::{Simulation, SimulationConfig};
    ///
    /// let config = SimulationConfig {
    ///     ticks_per_unit_time: 100.0,
    ///     ..Default::default()
    /// };
    /// let sim = Simulation::from_config(&config).unwrap();
    /// assert_eq!(sim.time_to_ticks(1.5), 150);
    /// ```
    pub fn from_config(config: &SimulationConfig) -> Result<Self, SimError> {
        config.validate()?;
        let sim = Self::with_ticks_per_unit_time(config.ticks_per_unit_time)?;
        sim.enable_tracing(config.tracing_enabled);
        sim.set_stack_trace_mode(config.stack_trace_mode);
        Ok(sim)
    }

    /// Create a child that shares `parent`'s timeline and clock resolution
    ///
    /// The child has its own name table and listeners.
    pub fn with_parent(parent: &Simulation) -> Self {
        Self::build(
            Arc::clone(&parent.inner.timeline),
            Some(parent.clone()),
            parent.inner.clock,
            parent.inner.run_id,
        )
    }

    /// Create a child sharing `parent`'s timeline but with its own tick resolution
    pub fn with_parent_and_ticks(
        parent: &Simulation,
        ticks_per_unit_time: f64,
    ) -> Result<Self, SimError> {
        let clock = Clock::new(ticks_per_unit_time)?;
        Ok(Self::build(
            Arc::clone(&parent.inner.timeline),
            Some(parent.clone()),
            clock,
            parent.inner.run_id,
        ))
    }

    fn build(timeline: Arc<Timeline>, parent: Option<Simulation>, clock: Clock, run_id: Uuid) -> Self {
        Self {
            inner: Arc::new(SimInner {
                timeline,
                parent,
                clock,
                names: NameTable::new(),
                listeners: Mutex::new(Vec::new()),
                trace: Mutex::new(TraceSwitches {
                    enabled: true,
                    output: None,
                    stack_trace_mode: false,
                }),
                run_id,
            }),
        }
    }

    pub fn parent(&self) -> Option<Simulation> {
        self.inner.parent.clone()
    }

    /// Identifier shared by a root simulation and all its children
    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    /// True if both handles refer to the same simulation
    pub fn ptr_eq(&self, other: &Simulation) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True if both simulations advance on the same timeline
    pub fn shares_timeline(&self, other: &Simulation) -> bool {
        Arc::ptr_eq(&self.inner.timeline, &other.inner.timeline)
    }

    // ========================================================================
    // Clock
    // ========================================================================

    pub fn clock(&self) -> Clock {
        self.inner.clock
    }

    pub fn current_ticks(&self) -> i64 {
        self.inner.timeline.ticks()
    }

    /// Current simulation time in time units
    pub fn current_time(&self) -> f64 {
        self.inner.clock.time(self.current_ticks())
    }

    /// Priority of the event being dispatched (0 after `advance` or a `run_for` horizon)
    pub fn current_priority(&self) -> f64 {
        self.inner.timeline.now().1
    }

    pub fn ticks_to_time(&self, ticks: i64) -> f64 {
        self.inner.clock.time(ticks)
    }

    pub fn time_to_ticks(&self, time: f64) -> i64 {
        self.inner.clock.ticks(time)
    }

    /// Move the clock forward without dispatching events
    ///
    /// The move stops at the next scheduled event if that is sooner. Returns
    /// the number of ticks actually advanced and resets the current priority.
    pub fn advance(&self, ticks: i64) -> Result<i64, SimError> {
        self.inner.timeline.advance(ticks)
    }

    pub fn more_events_scheduled(&self) -> bool {
        self.inner.timeline.len() > 0
    }

    /// Ticks until the next scheduled event, `None` if nothing is scheduled
    pub fn next_event_interval(&self) -> Option<i64> {
        self.inner.timeline.next_interval()
    }

    /// Number of events waiting on the timeline
    pub fn pending_events(&self) -> usize {
        self.inner.timeline.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.timeline.is_running()
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    pub(crate) fn schedule_action(
        &self,
        action: Action,
        delay: i64,
        priority: f64,
        tag: Option<String>,
    ) -> Result<SimulationEvent, SimError> {
        let stack = if self.stack_trace_mode() {
            Some(Arc::from(capture_stack(0).join("\n")))
        } else {
            None
        };
        self.inner
            .timeline
            .schedule(delay, priority, action, tag, stack)
    }

    /// Schedule `action` to run `delay` ticks from now at priority 0
    pub fn schedule_call<F>(&self, action: F, delay: i64) -> Result<SimulationEvent, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call_with_priority(action, delay, 0.0)
    }

    /// Schedule `action` at the current tick, ordered by `priority`
    pub fn schedule_call_wp<F>(&self, action: F, priority: f64) -> Result<SimulationEvent, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_call_with_priority(action, 0, priority)
    }

    pub fn schedule_call_with_priority<F>(
        &self,
        action: F,
        delay: i64,
        priority: f64,
    ) -> Result<SimulationEvent, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_action(
            Box::new(move || {
                action();
                Ok(())
            }),
            delay,
            priority,
            None,
        )
    }

    /// Schedule a call whose error aborts the run that dispatches it
    pub fn schedule_try_call<F>(
        &self,
        action: F,
        delay: i64,
        priority: f64,
    ) -> Result<SimulationEvent, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.schedule_action(Box::new(action), delay, priority, None)
    }

    /// Schedule a call reported to listeners as `CallStart`/`CallEnd` with `tag`
    pub fn schedule_tagged_call<F>(
        &self,
        tag: &str,
        action: F,
        delay: i64,
        priority: f64,
    ) -> Result<SimulationEvent, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_action(
            Box::new(move || {
                action();
                Ok(())
            }),
            delay,
            priority,
            Some(tag.to_string()),
        )
    }

    /// Queue a call that runs when the next `run*` starts, before any event
    ///
    /// Init calls run in ascending `order`, ties in insertion order, and each
    /// runs once.
    pub fn schedule_init_call<F>(&self, action: F, order: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timeline.push_init(
            order,
            Box::new(move || {
                action();
                Ok(())
            }),
        );
    }

    /// Create a task without scheduling it
    pub fn unscheduled_task<F>(&self, body: F) -> TaskThread
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        TaskThread::new(self, Box::new(body) as TaskBody)
    }

    /// Schedule a task that starts `delay` ticks from now
    ///
    /// # Example
    /// ```
    /// use des_kernel::{Simulation, TaskThread};
    /// use std::sync::{Arc, Mutex};
    ///
    /// let sim = Simulation::new();
    /// let ticks = Arc::new(Mutex::new(Vec::new()));
    /// let (s, t) = (sim.clone(), ticks.clone());
    /// sim.schedule_task(move || {
    ///     t.lock().unwrap().push(s.current_ticks());
    ///     TaskThread::pause(5)?;
    ///     t.lock().unwrap().push(s.current_ticks());
    ///     Ok(())
    /// }, 2).unwrap();
    ///
    /// sim.run().unwrap();
    /// assert_eq!(*ticks.lock().unwrap(), vec![2, 7]);
    /// ```
    pub fn schedule_task<F>(&self, body: F, delay: i64) -> Result<TaskThread, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.schedule_task_with_priority(body, delay, 0.0)
    }

    pub fn schedule_task_wp<F>(&self, body: F, priority: f64) -> Result<TaskThread, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.schedule_task_with_priority(body, 0, priority)
    }

    pub fn schedule_task_with_priority<F>(
        &self,
        body: F,
        delay: i64,
        priority: f64,
    ) -> Result<TaskThread, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        let task = self.unscheduled_task(body);
        task.schedule_start(delay, priority)?;
        Ok(task)
    }

    /// Start a task at once, blocking until its first suspension
    ///
    /// Only valid while the simulation is running.
    pub fn start_immediate_task<F>(&self, body: F) -> Result<TaskThread, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        if !self.is_running() {
            return Err(SimError::IllegalState(
                "start_immediate_task requires a running simulation".to_string(),
            ));
        }
        let task = self.unscheduled_task(body);
        task.start_now()?;
        Ok(task)
    }

    /// Pause the calling task for `delay` ticks
    pub fn pause_task(&self, delay: i64) -> Result<(), SimError> {
        TaskThread::pause(delay)
    }

    pub fn pause_task_wp(&self, delay: i64, priority: f64) -> Result<(), SimError> {
        TaskThread::pause_wp(delay, priority)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Dispatch events until the queue is empty
    pub fn run(&self) -> Result<(), SimError> {
        self.run_loop(None, None)
    }

    /// Dispatch events up to `current + max_ticks`
    ///
    /// Events at the horizon tick are dispatched; later ones stay queued. On
    /// return the clock sits at the horizon.
    pub fn run_for(&self, max_ticks: i64) -> Result<(), SimError> {
        if max_ticks < 0 {
            return Err(SimError::InvalidArgument(format!(
                "run interval must be non-negative, got {}",
                max_ticks
            )));
        }
        let horizon = self.current_ticks().saturating_add(max_ticks);
        self.run_loop(Some(horizon), None)
    }

    /// Dispatch events until the queue is empty or `monitor` asks to pause
    pub fn run_with(&self, monitor: &mut dyn SimulationMonitor) -> Result<(), SimError> {
        self.run_loop(None, Some(monitor))
    }

    fn run_loop(
        &self,
        horizon: Option<i64>,
        monitor: Option<&mut dyn SimulationMonitor>,
    ) -> Result<(), SimError> {
        let guard = self.inner.timeline.begin_run()?;
        for init in self.inner.timeline.take_init_calls() {
            init()?;
        }
        self.fire(SimulationStateEvent::SimulationStart {
            tick: self.current_ticks(),
        });
        tracing::debug!(run_id = %self.inner.run_id, tick = self.current_ticks(), "simulation started");

        let result = self.dispatch_events(horizon, monitor);

        drop(guard);
        tracing::debug!(run_id = %self.inner.run_id, tick = self.current_ticks(), "simulation stopped");
        self.fire(SimulationStateEvent::SimulationStop {
            tick: self.current_ticks(),
        });
        result
    }

    fn dispatch_events(
        &self,
        horizon: Option<i64>,
        mut monitor: Option<&mut dyn SimulationMonitor>,
    ) -> Result<(), SimError> {
        if let Some(monitor) = monitor.as_mut() {
            monitor.run_starts(self);
            if monitor.simulation_pauses(self) {
                return Ok(());
            }
        }
        loop {
            match self.inner.timeline.next_due(horizon) {
                Next::Dispatch(event) => {
                    self.dispatch(event)?;
                    if let Some(monitor) = monitor.as_mut() {
                        if monitor.simulation_pauses(self) {
                            return Ok(());
                        }
                    }
                }
                Next::Horizon | Next::Empty => break,
            }
        }
        if let Some(horizon) = horizon {
            self.inner.timeline.settle_at(horizon);
        }
        Ok(())
    }

    fn dispatch(&self, event: Scheduled) -> Result<(), SimError> {
        let Scheduled {
            key, action, tag, ..
        } = event;
        tracing::trace!(
            tick = key.tick,
            priority = key.priority,
            sequence = key.sequence,
            "dispatching event"
        );
        match tag {
            Some(tag) => {
                self.fire(SimulationStateEvent::CallStart {
                    tick: key.tick,
                    tag: tag.clone(),
                });
                let result = action();
                self.fire(SimulationStateEvent::CallEnd {
                    tick: self.current_ticks(),
                    tag,
                });
                result
            }
            None => action(),
        }
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn add_listener(&self, listener: Arc<dyn SimulationListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Remove a listener previously added; false if it was not registered
    pub fn remove_listener(&self, listener: &Arc<dyn SimulationListener>) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn fire(&self, event: SimulationStateEvent) {
        let listeners = self.inner.listeners.lock().clone();
        for listener in listeners {
            listener.state_changed(&event);
        }
    }

    // ========================================================================
    // Trace switches
    // ========================================================================

    /// Master switch for trace-set output from this simulation's objects
    pub fn enable_tracing(&self, enabled: bool) {
        self.inner.trace.lock().enabled = enabled;
    }

    pub fn is_tracing_enabled(&self) -> bool {
        self.inner.trace.lock().enabled
    }

    /// Default output for trace sets that have none of their own
    pub fn set_trace_output<W>(&self, writer: W)
    where
        W: Write + Send + 'static,
    {
        self.set_shared_trace_output(Arc::new(Mutex::new(writer)));
    }

    pub fn set_shared_trace_output(&self, writer: SharedWriter) {
        self.inner.trace.lock().output = Some(writer);
    }

    pub fn trace_output(&self) -> Option<SharedWriter> {
        self.inner.trace.lock().output.clone()
    }

    /// Capture a backtrace for every event scheduled from now on
    pub fn set_stack_trace_mode(&self, mode: bool) {
        self.inner.trace.lock().stack_trace_mode = mode;
    }

    pub fn stack_trace_mode(&self) -> bool {
        self.inner.trace.lock().stack_trace_mode
    }

    /// Backtrace captured when the event being dispatched was scheduled
    pub fn event_stack_trace(&self) -> Option<String> {
        self.inner.timeline.event_stack().map(|stack| stack.to_string())
    }

    // ========================================================================
    // Name table
    // ========================================================================

    /// Intern `object` under `(name, T)`
    ///
    /// Fails with `IllegalName` if an object of the same type already holds
    /// the name.
    pub fn register<T: Any + Send + Sync>(&self, name: &str, object: Arc<T>) -> Result<(), SimError> {
        self.inner.names.register(name, object)
    }

    pub fn get_object<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.inner.names.get::<T>(name)
    }

    pub fn contains_object<T: Any + Send + Sync>(&self, name: &str) -> bool {
        self.inner.names.contains::<T>(name)
    }

    pub fn object_names<T: Any + Send + Sync>(&self) -> Vec<String> {
        self.inner.names.names::<T>()
    }

    pub fn unregister<T: Any + Send + Sync>(&self, name: &str) -> bool {
        self.inner.names.unregister::<T>(name)
    }

    pub(crate) fn generate_name(&self, kind: &str) -> String {
        self.inner.names.generate_name(kind)
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("run_id", &self.inner.run_id)
            .field("ticks", &self.current_ticks())
            .field("pending_events", &self.pending_events())
            .field("has_parent", &self.inner.parent.is_some())
            .finish()
    }
}
