//! Server queues: jobs bound to a fixed pool of servers
//!
//! A job waits in the queue until it is eligible and a server is idle. The
//! queue's [`Discipline`] picks the job, which is bound to the idle server
//! that has waited longest. Binding happens in two steps at the same tick:
//!
//! 1. the job's interaction callback runs against the server
//! 2. the server stays busy for its [`QueueServer::interval`]
//!
//! When the interval ends the job completes (its call runs, its task starts,
//! or its suspended task resumes) and the server is idle again.
//!
//! # Example
//!
//! ```
//! use des_kernel::{FifoServerQueue, FixedServer, Simulation};
//! use std::sync::{Arc, Mutex};
//!
//! let sim = Simulation::new();
//! let desk = FifoServerQueue::new(&sim, Some("desk"), false, vec![FixedServer::new("clerk", 10)]).unwrap();
//! let done = Arc::new(Mutex::new(Vec::new()));
//! for job in 0..2 {
//!     let d = done.clone();
//!     let s = sim.clone();
//!     desk.add_call(|_| {}, move || d.lock().unwrap().push((job, s.current_ticks())), 0).unwrap();
//! }
//!
//! sim.run().unwrap();
//! assert_eq!(*done.lock().unwrap(), vec![(0, 10), (1, 20)]);
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
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A resource that serves one job at a time
pub trait QueueServer: Send + 'static {
    /// Ticks a job keeps this server busy; read when the job is bound
    fn interval(&self) -> i64;

    /// Name used in listener events; defaults to `server{index}`
    fn label(&self) -> Option<String> {
        None
    }
}

/// Server with a name and a constant processing interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedServer {
    pub name: String,
    pub interval: i64,
}

impl FixedServer {
    pub fn new(name: impl Into<String>, interval: i64) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }
}

impl QueueServer for FixedServer {
    fn interval(&self) -> i64 {
        self.interval
    }

    fn label(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

// ============================================================================
// Server pool and jobs
// ============================================================================

pub(crate) struct ServerPool<S> {
    /// A slot is empty only while its server runs an interaction callback
    slots: Vec<Option<S>>,
    /// Idle server indices, longest idle first
    idle: VecDeque<usize>,
    busy: usize,
}

impl<S> ServerPool<S> {
    fn new(servers: Vec<S>) -> Self {
        let idle = (0..servers.len()).collect();
        Self {
            slots: servers.into_iter().map(Some).collect(),
            idle,
            busy: 0,
        }
    }

    fn claim(&mut self) -> Option<(usize, S)> {
        let index = self.idle.pop_front()?;
        match self.slots.get_mut(index).and_then(Option::take) {
            Some(server) => {
                self.busy += 1;
                Some((index, server))
            }
            None => None,
        }
    }

    fn free(&mut self, index: usize) {
        self.busy = self.busy.saturating_sub(1);
        self.idle.push_back(index);
    }
}

type Interaction<S> = Box<dyn FnOnce(&mut S) + Send>;

pub(crate) enum JobKind {
    Call(Action),
    Task(TaskThread),
    Resume {
        task: TaskThread,
        canceled: Arc<AtomicBool>,
    },
}

pub(crate) struct Job<S> {
    interact: Option<Interaction<S>>,
    kind: JobKind,
}

pub(crate) struct ServerQueueInner<S> {
    object: ObjectCore,
    state: Mutex<QueueCore<Job<S>, ServerPool<S>>>,
    unregister: fn(&Simulation, &str) -> bool,
}

impl<S: QueueServer> QueueOwner for ServerQueueInner<S> {
    type Payload = Job<S>;
    type Extra = ServerPool<S>;

    fn state(&self) -> &Mutex<QueueCore<Job<S>, ServerPool<S>>> {
        &self.state
    }

    fn object(&self) -> &ObjectCore {
        &self.object
    }

    fn gate_open(pool: &ServerPool<S>) -> bool {
        !pool.idle.is_empty()
    }

    fn idle(core: &QueueCore<Job<S>, ServerPool<S>>) -> bool {
        core.extra.busy == 0 && !core.hold
    }

    fn dispatch(queue: &Arc<Self>, item: Pending<Job<S>>) -> Result<(), SimError> {
        let Pending {
            tpriority,
            payload: job,
            ..
        } = item;
        let claimed = queue.state.lock().extra.claim();
        let (index, mut server) =
            claimed.ok_or_else(|| SimError::IllegalState("job released without an idle server".to_string()))?;

        let sim = queue.object.simulation();
        let name = queue.object.name().to_string();
        let label = server.label().unwrap_or_else(|| format!("server{index}"));
        sim.fire(SimulationStateEvent::ServerSelected {
            tick: sim.current_ticks(),
            queue: name.clone(),
            server: label.clone(),
        });
        if let Some(interact) = job.interact {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| interact(&mut server))) {
                {
                    let mut core = queue.state.lock();
                    if let Some(slot) = core.extra.slots.get_mut(index) {
                        *slot = Some(server);
                    }
                    core.extra.free(index);
                }
                abandon(queue, job.kind);
                panic::resume_unwind(payload);
            }
        }
        sim.fire(SimulationStateEvent::ServerInteraction {
            tick: sim.current_ticks(),
            queue: name,
            server: label.clone(),
        });

        let interval = server.interval();
        {
            let mut core = queue.state.lock();
            if let Some(slot) = core.extra.slots.get_mut(index) {
                *slot = Some(server);
            }
            if interval < 0 {
                core.extra.free(index);
            }
        }
        if interval < 0 {
            return Err(SimError::InvalidArgument(format!(
                "server {label} reported negative interval {interval}"
            )));
        }

        let owner = Arc::clone(queue);
        let kind = job.kind;
        sim.schedule_action(
            Box::new(move || complete(&owner, index, label, kind)),
            interval,
            tpriority,
            None,
        )?;
        Ok(())
    }

    fn discard(queue: &Arc<Self>, item: Pending<Job<S>>) {
        abandon(queue, item.payload.kind);
    }

    fn unregister(queue: &Arc<Self>) {
        if queue.object.is_interned() {
            (queue.unregister)(queue.object.simulation(), queue.object.name());
        }
    }
}

/// Drop a job that will never be served; a waiting task resumes unserved
fn abandon<S: QueueServer>(queue: &Arc<ServerQueueInner<S>>, kind: JobKind) {
    match kind {
        JobKind::Call(_) => {}
        JobKind::Task(task) => {
            task.cancel();
        }
        JobKind::Resume { task, canceled } => {
            canceled.store(true, Ordering::SeqCst);
            let sim = queue.object.simulation();
            let resumed = sim.schedule_action(Box::new(move || task.resume()), 0, 0.0, None);
            if let Err(err) = resumed {
                tracing::warn!(queue = %queue.object.name(), error = %err, "could not resume task of abandoned job");
            }
        }
    }
}

/// End of a server's busy interval: free the server, then complete the job
fn complete<S: QueueServer>(
    queue: &Arc<ServerQueueInner<S>>,
    index: usize,
    label: String,
    kind: JobKind,
) -> Result<(), SimError> {
    queue.state.lock().extra.free(index);
    let _unwind = engine::SettleOnUnwind::new(queue);

    let sim = queue.object.simulation();
    let name = queue.object.name().to_string();
    let tick = sim.current_ticks();
    let result = match kind {
        JobKind::Call(action) => {
            sim.fire(SimulationStateEvent::ServerCallable {
                tick,
                queue: name,
                server: label,
            });
            action()
        }
        JobKind::Task(task) => {
            sim.fire(SimulationStateEvent::ServerTask {
                tick,
                queue: name,
                server: label,
            });
            task.start_now()
        }
        JobKind::Resume { task, .. } => {
            sim.fire(SimulationStateEvent::ServerTask {
                tick,
                queue: name,
                server: label,
            });
            task.resume()
        }
    };
    let settled = engine::settle(queue);
    result.and(settled)
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a server queue of any discipline
pub struct ServerQueue<S> {
    inner: Arc<ServerQueueInner<S>>,
}

impl<S> Clone for ServerQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QueueServer> ServerQueue<S> {
    fn build<W, F>(
        sim: &Simulation,
        kind: &'static str,
        name: Option<&str>,
        intern: bool,
        discipline: Discipline,
        servers: Vec<S>,
        wrap: F,
    ) -> Result<W, SimError>
    where
        W: Clone + Send + Sync + 'static,
        F: FnOnce(ServerQueue<S>) -> W,
    {
        if servers.is_empty() {
            return Err(SimError::InvalidArgument(
                "a server queue needs at least one server".to_string(),
            ));
        }
        let queue = ServerQueue {
            inner: Arc::new(ServerQueueInner {
                object: ObjectCore::new(sim, kind, name, intern),
                state: Mutex::new(QueueCore::new(discipline, ServerPool::new(servers))),
                unregister: |sim, name| sim.unregister::<W>(name),
            }),
        };
        let wrapped = wrap(queue.clone());
        if intern {
            sim.register(queue.name(), Arc::new(wrapped.clone()))?;
        }
        Ok(wrapped)
    }

    pub fn name(&self) -> &str {
        self.inner.object.name()
    }

    pub fn discipline(&self) -> Discipline {
        self.inner.state.lock().discipline
    }

    fn add_job(
        &self,
        interact: Option<Interaction<S>>,
        kind: JobKind,
        delay: i64,
        rank: i64,
    ) -> Result<Option<QueueEntry>, SimError> {
        engine::enqueue(&self.inner, delay, rank, 0.0, Job { interact, kind })
    }

    /// Queue a job whose `complete` call runs when its server finishes
    pub fn add_call<I, C>(&self, interact: I, complete: C, delay: i64) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.add_call_ranked(interact, complete, delay, 0)
    }

    fn add_call_ranked<I, C>(
        &self,
        interact: I,
        complete: C,
        delay: i64,
        rank: i64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let action: Action = Box::new(move || {
            complete();
            Ok(())
        });
        self.add_job(Some(Box::new(interact)), JobKind::Call(action), delay, rank)
    }

    /// Queue a job that starts a new task when its server finishes
    pub fn add_task<I, F>(&self, interact: I, body: F, delay: i64) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.add_task_ranked(interact, body, delay, 0)
    }

    fn add_task_ranked<I, F>(
        &self,
        interact: I,
        body: F,
        delay: i64,
        rank: i64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        if !self.inner.state.lock().accepting() {
            return Ok(None);
        }
        let task = self.inner.object.simulation().unscheduled_task(body);
        self.add_job(Some(Box::new(interact)), JobKind::Task(task), delay, rank)
    }

    /// Suspend the calling task until a server has interacted with it and
    /// finished its interval
    ///
    /// Returns `Ok(false)` if the queue refused the task or the job was
    /// canceled before a server took it.
    pub fn add_current_task<I>(&self, interact: I, delay: i64) -> Result<bool, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
    {
        self.add_current_task_ranked(interact, delay, 0)
    }

    fn add_current_task_ranked<I>(&self, interact: I, delay: i64, rank: i64) -> Result<bool, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
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
            let kind = JobKind::Resume {
                task: task.clone(),
                canceled: Arc::clone(&canceled),
            };
            let entry = self
                .add_job(Some(Box::new(interact)), kind, delay, rank)?
                .ok_or_else(|| SimError::IllegalState("queue stopped accepting jobs".to_string()))?;
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

    // ========================================================================
    // Control and inspection
    // ========================================================================

    pub fn freeze(&self, frozen: bool) -> Result<(), SimError> {
        engine::set_frozen(&self.inner, frozen)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    pub fn set_preempt(&self, preempt: bool) -> Result<(), SimError> {
        engine::set_preempt(&self.inner, preempt)
    }

    /// Jobs waiting for a server
    pub fn size(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// Servers currently bound to a job
    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().extra.busy
    }

    pub fn server_count(&self) -> usize {
        self.inner.state.lock().extra.slots.len()
    }

    /// Inspect server `index`; `None` if out of range or mid-interaction
    pub fn with_server<R, F>(&self, index: usize, inspect: F) -> Option<R>
    where
        F: FnOnce(&S) -> R,
    {
        let core = self.inner.state.lock();
        core.extra.slots.get(index).and_then(Option::as_ref).map(inspect)
    }

    /// Delete the queue; under `WhenEmpty` it waits for pending jobs and busy
    /// servers to drain
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

impl<S: QueueServer> SimObject for ServerQueue<S> {
    fn core(&self) -> &ObjectCore {
        &self.inner.object
    }
}

impl<S: QueueServer> fmt::Debug for ServerQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.state.lock();
        f.debug_struct("ServerQueue")
            .field("name", &self.inner.object.name())
            .field("discipline", &core.discipline)
            .field("size", &core.len())
            .field("busy", &core.extra.busy)
            .field("servers", &core.extra.slots.len())
            .finish()
    }
}

// ============================================================================
// Typed wrappers
// ============================================================================

/// Server queue binding jobs in insertion order
pub struct FifoServerQueue<S>(ServerQueue<S>);

impl<S: QueueServer> FifoServerQueue<S> {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool, servers: Vec<S>) -> Result<Self, SimError> {
        ServerQueue::build(sim, "fifoServerQueue", name, intern, Discipline::Fifo, servers, FifoServerQueue)
    }
}

/// Server queue binding the most recently added eligible job first
pub struct LifoServerQueue<S>(ServerQueue<S>);

impl<S: QueueServer> LifoServerQueue<S> {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool, servers: Vec<S>) -> Result<Self, SimError> {
        ServerQueue::build(sim, "lifoServerQueue", name, intern, Discipline::Lifo, servers, LifoServerQueue)
    }
}

/// Server queue binding eligible jobs by ascending priority
pub struct PriorityServerQueue<S>(ServerQueue<S>);

impl<S: QueueServer> PriorityServerQueue<S> {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool, servers: Vec<S>) -> Result<Self, SimError> {
        ServerQueue::build(
            sim,
            "priorityServerQueue",
            name,
            intern,
            Discipline::Priority,
            servers,
            PriorityServerQueue,
        )
    }

    pub fn add_call_with_priority<I, C>(
        &self,
        interact: I,
        complete: C,
        delay: i64,
        priority: i64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.0.add_call_ranked(interact, complete, delay, priority)
    }

    pub fn add_task_with_priority<I, F>(
        &self,
        interact: I,
        body: F,
        delay: i64,
        priority: i64,
    ) -> Result<Option<QueueEntry>, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
        F: FnOnce() -> Result<(), SimError> + Send + 'static,
    {
        self.0.add_task_ranked(interact, body, delay, priority)
    }

    pub fn add_current_task_with_priority<I>(&self, interact: I, delay: i64, priority: i64) -> Result<bool, SimError>
    where
        I: FnOnce(&mut S) + Send + 'static,
    {
        self.0.add_current_task_ranked(interact, delay, priority)
    }
}

macro_rules! server_queue_wrapper {
    ($($wrapper:ident),+) => {
        $(
            impl<S> Clone for $wrapper<S> {
                fn clone(&self) -> Self {
                    Self(self.0.clone())
                }
            }

            impl<S> Deref for $wrapper<S> {
                type Target = ServerQueue<S>;

                fn deref(&self) -> &ServerQueue<S> {
                    &self.0
                }
            }

            impl<S: QueueServer> fmt::Debug for $wrapper<S> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_tuple(stringify!($wrapper)).field(&self.0).finish()
                }
            }
        )+
    };
}

server_queue_wrapper!(FifoServerQueue, LifoServerQueue, PriorityServerQueue);
