//! Cooperative tasks backed by OS threads
//!
//! A [`TaskThread`] runs a user body on its own thread, but only while the
//! thread that resumed it is blocked. Control moves through a per-task
//! *baton*: a mutex-protected pair of slots plus a condition variable.
//!
//! - The resumer writes a [`Command`] and waits until the task writes a
//!   [`Report`] (suspended, finished, or panicked).
//! - The task writes its report and waits for the next command.
//!
//! Since each side blocks until the other answers, at most one body of
//! simulation code is runnable at any instant. The thread is spawned lazily
//! when the start event fires, and joined as soon as the body returns.
//!
//! # Lifecycle
//!
//! ```text
//! Runnable --start--> Running --pause--> Paused --wake--> Running --return--> Finished
//!     \                  |                  |
//!      +--cancel---------+--(next pause)----+--cancel--> Canceled
//! ```

use crate::core::error::SimError;
use crate::events::SimulationStateEvent;
use crate::sim::event::SimulationEvent;
use crate::sim::simulation::Simulation;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Body run by a task; returning `Err(TaskCanceled)` ends it normally
pub(crate) type TaskBody = Box<dyn FnOnce() -> Result<(), SimError> + Send>;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not started yet
    Runnable,
    Running,
    /// Suspended, waiting for a wake event or a queue release
    Paused,
    Canceled,
    Finished,
}

enum Command {
    Resume,
    Abort,
}

enum Report {
    Suspended,
    Finished(Result<(), SimError>),
    Panicked(Box<dyn Any + Send>),
}

#[derive(Default)]
struct BatonSlots {
    command: Option<Command>,
    report: Option<Report>,
}

/// Hand-off point between a task and whoever resumes it
#[derive(Default)]
struct Baton {
    slots: Mutex<BatonSlots>,
    signal: Condvar,
}

impl Baton {
    /// Resumer side: pass control and block until the task gives it back
    fn hand_off(&self, command: Command) -> Report {
        let mut slots = self.slots.lock();
        slots.command = Some(command);
        self.signal.notify_all();
        loop {
            if let Some(report) = slots.report.take() {
                return report;
            }
            self.signal.wait(&mut slots);
        }
    }

    /// Task side: give control back and block until the next command
    fn suspend(&self, report: Report) -> Command {
        let mut slots = self.slots.lock();
        slots.report = Some(report);
        self.signal.notify_all();
        Self::await_command(&self.signal, &mut slots)
    }

    fn wait_command(&self) -> Command {
        let mut slots = self.slots.lock();
        Self::await_command(&self.signal, &mut slots)
    }

    fn await_command(
        signal: &Condvar,
        slots: &mut parking_lot::MutexGuard<'_, BatonSlots>,
    ) -> Command {
        loop {
            if let Some(command) = slots.command.take() {
                return command;
            }
            signal.wait(slots);
        }
    }

    /// Task side, last word: report without waiting for a reply
    fn finish(&self, report: Report) {
        let mut slots = self.slots.lock();
        slots.report = Some(report);
        self.signal.notify_all();
    }
}

struct Control {
    state: TaskState,
    body: Option<TaskBody>,
    /// Start event (Runnable) or wake event (Paused), if one is queued
    wake: Option<SimulationEvent>,
    cancel_requested: bool,
    /// Completed suspensions, bumped each time the task parks
    suspensions: u64,
}

struct TaskInner {
    name: String,
    sim: Simulation,
    control: Mutex<Control>,
    baton: Baton,
    handle: Mutex<Option<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<TaskThread>> = const { RefCell::new(None) };
}

/// Handle to a cooperative task
///
/// Clones refer to the same task.
#[derive(Clone)]
pub struct TaskThread {
    inner: Arc<TaskInner>,
}

impl TaskThread {
    pub(crate) fn new(sim: &Simulation, body: TaskBody) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: sim.generate_name("task"),
                sim: sim.clone(),
                control: Mutex::new(Control {
                    state: TaskState::Runnable,
                    body: Some(body),
                    wake: None,
                    cancel_requested: false,
                    suspensions: 0,
                }),
                baton: Baton::default(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// The task running on the calling thread, if any
    pub fn current() -> Option<TaskThread> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn simulation(&self) -> &Simulation {
        &self.inner.sim
    }

    pub fn state(&self) -> TaskState {
        self.inner.control.lock().state
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// True if this task is the one running on the calling thread
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|task| task.ptr_eq(self))
                .unwrap_or(false)
        })
    }

    pub fn ptr_eq(&self, other: &TaskThread) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// How many times the task has suspended so far
    pub(crate) fn suspensions(&self) -> u64 {
        self.inner.control.lock().suspensions
    }

    // ========================================================================
    // Suspension (called on the task's own thread)
    // ========================================================================

    /// Suspend the calling task for `delay` ticks at priority 0
    ///
    /// Returns `Err(TaskCanceled)` if the task was canceled, and
    /// `Err(NotTaskThread)` when called outside a task.
    pub fn pause(delay: i64) -> Result<(), SimError> {
        Self::pause_wp(delay, 0.0)
    }

    /// Suspend the calling task; it resumes at `current + delay` with `priority`
    pub fn pause_wp(delay: i64, priority: f64) -> Result<(), SimError> {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        Self::suspend_with(|task| {
            let resumer = task.clone();
            let wake = task.inner.sim.schedule_action(
                Box::new(move || resumer.resume()),
                delay,
                priority,
                None,
            )?;
            Ok(Some(wake))
        })
    }

    /// Suspend the calling task until someone calls [`TaskThread::resume`]
    ///
    /// `prepare` runs first, on the task's thread, and arranges the wake-up
    /// (a timed event, a queue entry). It may return the wake event so that
    /// `cancel` and `reschedule` can find it.
    pub(crate) fn suspend_with<F>(prepare: F) -> Result<(), SimError>
    where
        F: FnOnce(&TaskThread) -> Result<Option<SimulationEvent>, SimError>,
    {
        let task = Self::current().ok_or(SimError::NotTaskThread)?;
        task.check_cancel()?;
        let wake = prepare(&task)?;
        {
            let mut control = task.inner.control.lock();
            control.state = TaskState::Paused;
            control.wake = wake;
            control.suspensions += 1;
        }
        task.inner.sim.fire(SimulationStateEvent::TaskPause {
            tick: task.inner.sim.current_ticks(),
            task: task.inner.name.clone(),
        });
        match task.inner.baton.suspend(Report::Suspended) {
            Command::Resume => Ok(()),
            Command::Abort => Err(SimError::TaskCanceled),
        }
    }

    fn check_cancel(&self) -> Result<(), SimError> {
        let mut control = self.inner.control.lock();
        if control.state == TaskState::Canceled {
            tracing::warn!(task = %self.inner.name, "canceled task reached another suspension point");
            return Err(SimError::TaskCanceled);
        }
        if control.cancel_requested {
            control.state = TaskState::Canceled;
            tracing::debug!(task = %self.inner.name, "pending cancel taken at suspension point");
            return Err(SimError::TaskCanceled);
        }
        Ok(())
    }

    // ========================================================================
    // Resumption (called by the dispatcher or another task)
    // ========================================================================

    /// Queue the start event `delay` ticks from now
    pub(crate) fn schedule_start(&self, delay: i64, priority: f64) -> Result<SimulationEvent, SimError> {
        let starter = self.clone();
        let event = self.inner.sim.schedule_action(
            Box::new(move || starter.start_now()),
            delay,
            priority,
            None,
        )?;
        self.inner.control.lock().wake = Some(event.clone());
        Ok(event)
    }

    /// Start the body now, blocking the caller until the task first suspends
    ///
    /// A task that is no longer `Runnable` (canceled, already started) is
    /// left alone.
    pub(crate) fn start_now(&self) -> Result<(), SimError> {
        let body = {
            let mut control = self.inner.control.lock();
            if control.state != TaskState::Runnable {
                return Ok(());
            }
            let body = match control.body.take() {
                Some(body) => body,
                None => return Ok(()),
            };
            control.state = TaskState::Running;
            control.wake = None;
            body
        };

        let task = self.clone();
        let spawned = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || task.thread_main(body));
        match spawned {
            Ok(handle) => *self.inner.handle.lock() = Some(handle),
            Err(err) => {
                self.inner.control.lock().state = TaskState::Finished;
                return Err(SimError::IllegalState(format!(
                    "failed to spawn thread for {}: {}",
                    self.inner.name, err
                )));
            }
        }

        tracing::debug!(task = %self.inner.name, tick = self.inner.sim.current_ticks(), "task started");
        self.inner.sim.fire(SimulationStateEvent::TaskStart {
            tick: self.inner.sim.current_ticks(),
            task: self.inner.name.clone(),
        });
        let report = self.inner.baton.hand_off(Command::Resume);
        self.settle(report)
    }

    /// Resume a paused task, blocking the caller until it suspends again
    ///
    /// A task that is not paused (canceled meanwhile) is left alone.
    pub(crate) fn resume(&self) -> Result<(), SimError> {
        {
            let mut control = self.inner.control.lock();
            if control.state != TaskState::Paused {
                return Ok(());
            }
            control.state = TaskState::Running;
            control.wake = None;
        }
        self.inner.sim.fire(SimulationStateEvent::TaskResume {
            tick: self.inner.sim.current_ticks(),
            task: self.inner.name.clone(),
        });
        let report = self.inner.baton.hand_off(Command::Resume);
        self.settle(report)
    }

    fn thread_main(self, body: TaskBody) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        let report = match self.inner.baton.wait_command() {
            Command::Resume => match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(result) => Report::Finished(result),
                Err(payload) => Report::Panicked(payload),
            },
            Command::Abort => Report::Finished(Err(SimError::TaskCanceled)),
        };
        CURRENT.with(|current| current.borrow_mut().take());
        self.inner.baton.finish(report);
    }

    fn settle(&self, report: Report) -> Result<(), SimError> {
        match report {
            Report::Suspended => Ok(()),
            Report::Finished(result) => {
                let canceled = matches!(result, Err(ref err) if err.is_canceled());
                self.end(canceled);
                match result {
                    Err(err) if !err.is_canceled() => Err(SimError::TaskFailed {
                        task: self.inner.name.clone(),
                        source: Box::new(err),
                    }),
                    _ => Ok(()),
                }
            }
            Report::Panicked(payload) => {
                self.end(false);
                panic::resume_unwind(payload)
            }
        }
    }

    fn end(&self, canceled: bool) {
        {
            let mut control = self.inner.control.lock();
            if canceled || control.state == TaskState::Canceled {
                control.state = TaskState::Canceled;
            } else {
                control.state = TaskState::Finished;
            }
            control.wake = None;
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            // the thread has already reported; it only has to unwind its stack
            let _ = handle.join();
        }
        tracing::debug!(task = %self.inner.name, tick = self.inner.sim.current_ticks(), "task ended");
        self.inner.sim.fire(SimulationStateEvent::TaskEnd {
            tick: self.inner.sim.current_ticks(),
            task: self.inner.name.clone(),
        });
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Cancel the task
    ///
    /// - Not started: the start event is removed and the body never runs.
    /// - Paused: the wake event is removed and the pending suspension returns
    ///   `Err(TaskCanceled)` at once; the caller blocks until the task body
    ///   has returned.
    /// - Running: recorded; the task's next suspension point fails.
    ///
    /// Returns false if the task already finished or was already canceled.
    pub fn cancel(&self) -> bool {
        let mut control = self.inner.control.lock();
        match control.state {
            TaskState::Runnable => {
                control.state = TaskState::Canceled;
                let body = control.body.take();
                let wake = control.wake.take();
                drop(control);
                drop(body);
                if let Some(wake) = wake {
                    wake.cancel();
                }
                tracing::debug!(task = %self.inner.name, "task canceled before start");
                true
            }
            TaskState::Paused => {
                control.state = TaskState::Canceled;
                let wake = control.wake.take();
                drop(control);
                if let Some(wake) = wake {
                    wake.cancel();
                }
                tracing::debug!(task = %self.inner.name, "aborting paused task");
                let report = self.inner.baton.hand_off(Command::Abort);
                if let Err(err) = self.settle(report) {
                    tracing::warn!(task = %self.inner.name, error = %err, "canceled task failed while unwinding");
                }
                true
            }
            TaskState::Running => {
                if control.cancel_requested {
                    false
                } else {
                    control.cancel_requested = true;
                    true
                }
            }
            TaskState::Canceled | TaskState::Finished => false,
        }
    }

    /// Move the pending start or wake event to `current + delay`
    ///
    /// Keeps the event's priority. Returns `Ok(false)` if the task has no
    /// timed event pending (running, finished, or waiting in a queue).
    pub fn reschedule(&self, delay: i64) -> Result<bool, SimError> {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        let wake = self.inner.control.lock().wake.clone();
        match wake {
            Some(event) => {
                let priority = event.key().map(|key| key.priority).unwrap_or(0.0);
                event.reschedule(delay, priority)
            }
            None => Ok(false),
        }
    }
}

impl PartialEq for TaskThread {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for TaskThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskThread")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
