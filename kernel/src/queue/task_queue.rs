//! Task queues: FIFO, LIFO and priority queues of calls and tasks
//!
//! A task queue holds three kinds of items:
//! - calls, run when released
//! - tasks, started when released
//! - continuations of tasks that queued themselves with
//!   [`TaskQueue::add_current_task`], resumed when released
//!
//! Items become eligible `delay` ticks after they were added; among eligible
//! items the queue's [`Discipline`] picks the next release.
//!
//! # Example
//!
//! ```
//! use des_kernel::{LifoTaskQueue, Simulation};
//! use std::sync::{Arc, Mutex};
//!
//! let sim = Simulation::new();
//! let queue = LifoTaskQueue::new(&sim, Some("stack"), false).unwrap();
//! let order = Arc::new(Mutex::new(Vec::new()));
//! for label in ["x1", "x2", "x3"] {
//!     let o = order.clone();
//!     queue.add(move || o.lock().unwrap().push(label), 0).unwrap();
//! }
//!
//! sim.run().unwrap();
//! assert_eq!(*order.lock().unwrap(), vec!["x3", "x2", "x1"]);
//! ```

use crate::core::error::SimError;
use crate::events::SimulationStateEvent;
use crate::queue::engine::{self, Discipline, Pending, QueueCore, QueueOwner};
use crate::queue::{DeletePolicy, QueueEntry, QueueStatus};
use crate::sim::event_queue::Action;
use crate::sim::simulation::Simulation;
use crate::task::thread::TaskThread;
use crate::trace::object::{ObjectCore, SimObject};
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) enum TaskItem {
    Call(Action),
    Task(TaskThread),
    Resume {
        task: TaskThread,
        /// Set when the entry is canceled instead of released
        canceled: Arc<AtomicBool>,
    },
}

#[derive(Default)]
pub(crate) struct TaskQueueExtra {
    /// Task released by the queue that has not suspended anywhere else since
    current: Option<Processing>,
}

struct Processing {
    task: TaskThread,
    /// Suspension count when the queue handed the task control
    suspensions: u64,
}

impl Processing {
    fn new(task: &TaskThread) -> Self {
        Self {
            task: task.clone(),
            suspensions: task.suspensions(),
        }
    }

    fn owns(&self, task: &TaskThread) -> bool {
        self.task.ptr_eq(task) && self.suspensions == task.suspensions()
    }
}

pub(crate) struct TaskQueueInner {
    pub(crate) object: ObjectCore,
    pub(crate) state: Mutex<QueueCore<TaskItem, TaskQueueExtra>>,
    unregister: fn(&Simulation, &str) -> bool,
}

impl TaskQueueInner {
    /// Forget the released task once it has suspended outside the queue
    fn release_current(queue: &Arc<Self>) {
        let mut core = queue.state.lock();
        if !core.hold {
            core.extra.current = None;
        }
    }
}

impl QueueOwner for TaskQueueInner {
    type Payload = TaskItem;
    type Extra = TaskQueueExtra;

    fn state(&self) -> &Mutex<QueueCore<TaskItem, TaskQueueExtra>> {
        &self.state
    }

    fn object(&self) -> &ObjectCore {
        &self.object
    }

    fn dispatch(queue: &Arc<Self>, item: Pending<TaskItem>) -> Result<(), SimError> {
        let sim = queue.object.simulation();
        let name = queue.object.name().to_string();
        sim.fire(SimulationStateEvent::TaskQueueStart {
            tick: sim.current_ticks(),
            queue: name.clone(),
        });
        let result = match item.payload {
            TaskItem::Call(action) => action(),
            TaskItem::Task(task) => {
                queue.state.lock().extra.current = Some(Processing::new(&task));
                let started = task.start_now();
                Self::release_current(queue);
                started
            }
            TaskItem::Resume { task, .. } => {
                queue.state.lock().extra.current = Some(Processing::new(&task));
                let resumed = task.resume();
                Self::release_current(queue);
                resumed
            }
        };
        sim.fire(SimulationStateEvent::TaskQueueStop {
            tick: sim.current_ticks(),
            queue: name,
        });
        result
    }

    fn discard(queue: &Arc<Self>, item: Pending<TaskItem>) {
        match item.payload {
            TaskItem::Call(_) => {}
            TaskItem::Task(task) => {
                task.cancel();
            }
            TaskItem::Resume { task, canceled } => {
                canceled.store(true, Ordering::SeqCst);
                let sim = queue.object.simulation();
                let resumed = sim.schedule_action(Box::new(move || task.resume()), 0, 0.0, None);
                if let Err(err) = resumed {
                    tracing::warn!(queue = %queue.object.name(), error = %err, "could not resume task of canceled entry");
                }
            }
        }
    }

    fn unregister(queue: &Arc<Self>) {
        if queue.object.is_interned() {
            (queue.unregister)(queue.object.simulation(), queue.object.name());
        }
    }
}

/// Handle to a task queue of any discipline
///
/// The typed wrappers ([`FifoTaskQueue`], [`LifoTaskQueue`],
/// [`PriorityTaskQueue`], `WaitTaskQueue`) deref to this type.
#[derive(Clone)]
pub struct TaskQueue {
    pub(crate) inner: Arc<TaskQueueInner>,
}

impl TaskQueue {
    pub(crate) fn create(
        sim: &Simulation,
        kind: &'static str,
        name: Option<&str>,
        intern: bool,
        core: QueueCore<TaskItem, TaskQueueExtra>,
        unregister: fn(&Simulation, &str) -> bool,
    ) -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                object: ObjectCore::new(sim, kind, name, intern),
                state: Mutex::new(core),
                unregister,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.object.name()
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.state.lock().discipline
    }

    // ========================================================================
    // Additions
    // ========================================================================

    /// Queue `action`, eligible `delay` ticks from now
    ///
    /// Returns `Ok(None)` if the queue no longer accepts items.
    pub fn add<F>(&self, action: F, delay: i64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_wp(action, delay, 0.0)
    }

    /// Like [`add`](Self::add), with the kernel priority of the release event
    pub fn add_wp<F>(&self, action: F, delay: i64, tpriority: f64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_ranked(action, delay, 0, tpriority)
    }

    pub(crate) fn add_ranked<F>(
        &self,
        action: F,
        delay: i64,
        rank: i64,
        tpriority: f64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        let payload = TaskItem::Call(Box::new(move || {
            action();
            Ok(())
        }));
        engine::enqueue(&self.inner, delay, rank, tpriority, payload)
    }

    /// Queue a new task that starts when released
    pub fn add_task<F>(&self, body: F, delay: i64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.add_task_ranked(body, delay, 0, 0.0)
    }

    pub fn add_task_wp<F>(&self, body: F, delay: i64, tpriority: f64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.add_task_ranked(body, delay, 0, tpriority)
    }

    pub(crate) fn add_task_ranked<F>(
        &self,
        body: F,
        delay: i64,
        rank: i64,
        tpriority: f64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        if !self.inner.state.lock().accepting() {
            return Ok(None);
        }
        let task = self.inner.object.simulation().unscheduled_task(body);
        engine::enqueue(&self.inner, delay, rank, tpriority, TaskItem::Task(task))
    }

    /// Suspend the calling task and queue its continuation
    ///
    /// Returns `Ok(true)` once the queue released the task, `Ok(false)` if
    /// the queue refused the task (deleted) or the entry was canceled.
    pub fn add_current_task(&self, delay: i64) -> Result<bool, SimError> {
        self.add_current_task_ranked(delay, 0, 0.0, |_| {})
    }

    pub fn add_current_task_wp(&self, delay: i64, tpriority: f64) -> Result<bool, SimError> {
        self.add_current_task_ranked(delay, 0, tpriority, |_| {})
    }

    /// Like [`add_current_task_wp`](Self::add_current_task_wp), handing the
    /// entry to `on_queued` before the task suspends
    ///
    /// The callback runs on the task's thread and may, for instance, schedule
    /// a call that cancels the entry after a timeout.
    pub fn add_current_task_with<F>(&self, delay: i64, tpriority: f64, on_queued: F) -> Result<bool, SimError>
    where
        F: FnOnce(&QueueEntry),
    {
        self.add_current_task_ranked(delay, 0, tpriority, on_queued)
    }

    pub(crate) fn add_current_task_ranked<F>(
        &self,
        delay: i64,
        rank: i64,
        tpriority: f64,
        on_queued: F,
    ) -> Result<bool, SimError>
    where
        F: FnOnce(&QueueEntry),
    {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        if TaskThread::current().is_none() {
            return Err(SimError::NotTaskThread);
        }
        if !self.inner.state.lock().accepting() {
            return Ok(false);
        }
        let canceled = Arc::new(AtomicBool::new(false));
        let mut queued: Option<QueueEntry> = None;
        let outcome = TaskThread::suspend_with(|task| {
            let payload = TaskItem::Resume {
                task: task.clone(),
                canceled: Arc::clone(&canceled),
            };
            let entry = engine::enqueue(&self.inner, delay, rank, tpriority, payload)?
                .ok_or_else(|| SimError::IllegalState("queue stopped accepting items".to_string()))?;
            on_queued(&entry);
            queued = Some(entry);
            Ok(None)
        });
        match outcome {
            Ok(()) => Ok(!canceled.load(Ordering::SeqCst)),
            Err(err) => {
                if let Some(entry) = queued {
                    engine::withdraw(&self.inner, entry.seq);
                }
                Err(err)
            }
        }
    }

    /// Pause the task this queue released last, keeping the queue busy
    ///
    /// No further items are released until the task resumes `delay` ticks
    /// later.
    pub fn pause_current_task(&self, delay: i64) -> Result<(), SimError> {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        let task = TaskThread::current().ok_or(SimError::NotTaskThread)?;
        {
            let mut core = self.inner.state.lock();
            let processing = core.extra.current.as_ref().map_or(false, |current| current.owns(&task));
            if !processing {
                return Err(SimError::IllegalState(format!(
                    "{} is not the task being processed by {}",
                    task.name(),
                    self.name()
                )));
            }
            core.hold = true;
        }
        engine::repump(&self.inner)?;

        let sim = self.inner.object.simulation();
        sim.fire(SimulationStateEvent::TaskQueuePause {
            tick: sim.current_ticks(),
            queue: self.name().to_string(),
        });
        let paused = TaskThread::pause(delay);
        {
            let mut core = self.inner.state.lock();
            core.hold = false;
            core.extra.current = paused.is_ok().then(|| Processing::new(&task));
        }
        sim.fire(SimulationStateEvent::TaskQueueResume {
            tick: sim.current_ticks(),
            queue: self.name().to_string(),
        });
        engine::settle(&self.inner)?;
        paused
    }

    // ========================================================================
    // Release control
    // ========================================================================

    /// Suspend (true) or resume (false) releases; additions are still accepted
    pub fn freeze(&self, frozen: bool) -> Result<(), SimError> {
        engine::set_frozen(&self.inner, frozen)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    pub fn can_freeze(&self) -> bool {
        self.inner.state.lock().can_freeze
    }

    /// Let items added during a release round jump ahead of the round
    pub fn set_preempt(&self, preempt: bool) -> Result<(), SimError> {
        engine::set_preempt(&self.inner, preempt)
    }

    pub fn is_preempt(&self) -> bool {
        self.inner.state.lock().preempt
    }

    pub fn can_preempt(&self) -> bool {
        self.inner.state.lock().can_preempt
    }

    /// True while a released task holds the queue via `pause_current_task`
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().hold
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().is_empty()
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete the queue according to its [`DeletePolicy`]
    ///
    /// Returns whether the request was accepted. Under `WhenEmpty` the queue
    /// refuses additions at once but [`is_deleted`](Self::is_deleted) stays
    /// false until the remaining items have been released.
    pub fn delete(&self) -> bool {
        engine::delete(&self.inner)
    }

    pub fn is_deleted(&self) -> bool {
        self.status() == QueueStatus::Deleted
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.state.lock().status
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.inner.state.lock().policy
    }

    pub fn set_delete_policy(&self, policy: DeletePolicy) -> Result<(), SimError> {
        engine::set_delete_policy(&self.inner, policy)
    }
}

impl SimObject for TaskQueue {
    fn core(&self) -> &ObjectCore {
        &self.inner.object
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.state.lock();
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.object.name())
            .field("discipline", &core.discipline)
            .field("size", &core.len())
            .field("status", &core.status)
            .finish()
    }
}

/// Build a typed queue and intern it under its wrapper type
pub(crate) fn build_interned<W, F>(
    sim: &Simulation,
    kind: &'static str,
    name: Option<&str>,
    intern: bool,
    core: QueueCore<TaskItem, TaskQueueExtra>,
    wrap: F,
) -> Result<W, SimError>
where
    W: Clone + Send + Sync + 'static,
    F: FnOnce(TaskQueue) -> W,
{
    let queue = TaskQueue::create(sim, kind, name, intern, core, |sim, name| {
        sim.unregister::<W>(name)
    });
    let wrapped = wrap(queue.clone());
    if intern {
        sim.register(queue.name(), Arc::new(wrapped.clone()))?;
    }
    Ok(wrapped)
}

/// Task queue releasing simultaneously eligible items in insertion order
#[derive(Clone, Debug)]
pub struct FifoTaskQueue(TaskQueue);

impl FifoTaskQueue {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool) -> Result<Self, SimError> {
        let core = QueueCore::new(Discipline::Fifo, TaskQueueExtra::default());
        build_interned(sim, "fifoTaskQueue", name, intern, core, FifoTaskQueue)
    }
}

impl Deref for FifoTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.0
    }
}

/// Task queue releasing the most recently added eligible item first
#[derive(Clone, Debug)]
pub struct LifoTaskQueue(TaskQueue);

impl LifoTaskQueue {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool) -> Result<Self, SimError> {
        let core = QueueCore::new(Discipline::Lifo, TaskQueueExtra::default());
        build_interned(sim, "lifoTaskQueue", name, intern, core, LifoTaskQueue)
    }
}

impl Deref for LifoTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.0
    }
}

/// Task queue releasing eligible items by ascending priority
///
/// Equal priorities release in insertion order. The plain `add*` methods
/// inherited from [`TaskQueue`] use priority 0.
#[derive(Clone, Debug)]
pub struct PriorityTaskQueue(TaskQueue);

impl PriorityTaskQueue {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool) -> Result<Self, SimError> {
        let core = QueueCore::new(Discipline::Priority, TaskQueueExtra::default());
        build_interned(sim, "priorityTaskQueue", name, intern, core, PriorityTaskQueue)
    }

    pub fn add_with_priority<F>(&self, action: F, delay: i64, priority: i64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.add_ranked(action, delay, priority, 0.0)
    }

    pub fn add_task_with_priority<F>(&self, body: F, delay: i64, priority: i64) -> Result<Option<QueueEntry>, SimError>
    where
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.0.add_task_ranked(body, delay, priority, 0.0)
    }

    pub fn add_current_task_with_priority(&self, delay: i64, priority: i64) -> Result<bool, SimError> {
        self.0.add_current_task_ranked(delay, priority, 0.0, |_| {})
    }
}

impl Deref for PriorityTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.0
    }
}
