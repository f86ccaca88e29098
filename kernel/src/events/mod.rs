//! Simulation state-change events and listeners
//!
//! The kernel reports run-loop and object lifecycle transitions to every
//! [`SimulationListener`] registered on a simulation. Events let a caller:
//! - Audit the order in which calls and tasks actually ran
//! - Follow a queue or server through its busy/idle cycle
//! - Drive external observers (animation, statistics) off the timeline
//!
//! # Event Types
//!
//! - **Run loop**: `SimulationStart`, `SimulationStop`
//! - **Calls**: `CallStart`, `CallEnd` (tagged calls only)
//! - **Tasks**: `TaskStart`, `TaskPause`, `TaskResume`, `TaskEnd`
//! - **Task queues**: `TaskQueueStart`, `TaskQueuePause`, `TaskQueueResume`, `TaskQueueStop`
//! - **Server queues**: `ServerSelected`, `ServerInteraction`, `ServerCallable`, `ServerTask`
//!
//! # Example
//!
//! ```rust
//! use des_kernel::{EventLog, Simulation};
//! use std::sync::Arc;
//!
//! let sim = Simulation::new();
//! let log = Arc::new(EventLog::new());
//! sim.add_listener(log.clone());
//!
//! sim.schedule_tagged_call("hello", || {}, 3, 0.0).unwrap();
//! sim.run().unwrap();
//!
//! assert_eq!(log.events_of_type("CallStart").len(), 1);
//! assert_eq!(log.events_at_tick(3).len(), 2);
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A state change observed by listeners
///
/// All events carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SimulationStateEvent {
    /// A `run*` call started dispatching
    SimulationStart { tick: i64 },

    /// A `run*` call returned
    SimulationStop { tick: i64 },

    /// A tagged call is about to run
    CallStart { tick: i64, tag: String },

    /// A tagged call returned
    CallEnd { tick: i64, tag: String },

    TaskStart { tick: i64, task: String },

    TaskPause { tick: i64, task: String },

    TaskResume { tick: i64, task: String },

    /// Task body returned (normally, with an error, or after cancellation)
    TaskEnd { tick: i64, task: String },

    /// A task queue released an item and is now processing it
    TaskQueueStart { tick: i64, queue: String },

    /// The task a queue is processing paused while holding the queue
    TaskQueuePause { tick: i64, queue: String },

    TaskQueueResume { tick: i64, queue: String },

    /// The queue finished processing an item
    TaskQueueStop { tick: i64, queue: String },

    /// A server was bound to a job
    ServerSelected {
        tick: i64,
        queue: String,
        server: String,
    },

    /// A job's interaction callback ran against its server
    ServerInteraction {
        tick: i64,
        queue: String,
        server: String,
    },

    /// A call job completed on its server
    ServerCallable {
        tick: i64,
        queue: String,
        server: String,
    },

    /// A task job completed on its server and the task was started or resumed
    ServerTask {
        tick: i64,
        queue: String,
        server: String,
    },
}

impl SimulationStateEvent {
    /// Get the tick when this event occurred
    pub fn tick(&self) -> i64 {
        match self {
            SimulationStateEvent::SimulationStart { tick }
            | SimulationStateEvent::SimulationStop { tick }
            | SimulationStateEvent::CallStart { tick, .. }
            | SimulationStateEvent::CallEnd { tick, .. }
            | SimulationStateEvent::TaskStart { tick, .. }
            | SimulationStateEvent::TaskPause { tick, .. }
            | SimulationStateEvent::TaskResume { tick, .. }
            | SimulationStateEvent::TaskEnd { tick, .. }
            | SimulationStateEvent::TaskQueueStart { tick, .. }
            | SimulationStateEvent::TaskQueuePause { tick, .. }
            | SimulationStateEvent::TaskQueueResume { tick, .. }
            | SimulationStateEvent::TaskQueueStop { tick, .. }
            | SimulationStateEvent::ServerSelected { tick, .. }
            | SimulationStateEvent::ServerInteraction { tick, .. }
            | SimulationStateEvent::ServerCallable { tick, .. }
            | SimulationStateEvent::ServerTask { tick, .. } => *tick,
        }
    }

    /// Get event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            SimulationStateEvent::SimulationStart { .. } => "SimulationStart",
            SimulationStateEvent::SimulationStop { .. } => "SimulationStop",
            SimulationStateEvent::CallStart { .. } => "CallStart",
            SimulationStateEvent::CallEnd { .. } => "CallEnd",
            SimulationStateEvent::TaskStart { .. } => "TaskStart",
            SimulationStateEvent::TaskPause { .. } => "TaskPause",
            SimulationStateEvent::TaskResume { .. } => "TaskResume",
            SimulationStateEvent::TaskEnd { .. } => "TaskEnd",
            SimulationStateEvent::TaskQueueStart { .. } => "TaskQueueStart",
            SimulationStateEvent::TaskQueuePause { .. } => "TaskQueuePause",
            SimulationStateEvent::TaskQueueResume { .. } => "TaskQueueResume",
            SimulationStateEvent::TaskQueueStop { .. } => "TaskQueueStop",
            SimulationStateEvent::ServerSelected { .. } => "ServerSelected",
            SimulationStateEvent::ServerInteraction { .. } => "ServerInteraction",
            SimulationStateEvent::ServerCallable { .. } => "ServerCallable",
            SimulationStateEvent::ServerTask { .. } => "ServerTask",
        }
    }

    /// Get task name if the event relates to a task
    pub fn task(&self) -> Option<&str> {
        match self {
            SimulationStateEvent::TaskStart { task, .. }
            | SimulationStateEvent::TaskPause { task, .. }
            | SimulationStateEvent::TaskResume { task, .. }
            | SimulationStateEvent::TaskEnd { task, .. } => Some(task),
            _ => None,
        }
    }

    /// Get queue name if the event relates to a task or server queue
    pub fn queue(&self) -> Option<&str> {
        match self {
            SimulationStateEvent::TaskQueueStart { queue, .. }
            | SimulationStateEvent::TaskQueuePause { queue, .. }
            | SimulationStateEvent::TaskQueueResume { queue, .. }
            | SimulationStateEvent::TaskQueueStop { queue, .. }
            | SimulationStateEvent::ServerSelected { queue, .. }
            | SimulationStateEvent::ServerInteraction { queue, .. }
            | SimulationStateEvent::ServerCallable { queue, .. }
            | SimulationStateEvent::ServerTask { queue, .. } => Some(queue),
            _ => None,
        }
    }

    /// Get call tag for `CallStart`/`CallEnd`
    pub fn tag(&self) -> Option<&str> {
        match self {
            SimulationStateEvent::CallStart { tag, .. }
            | SimulationStateEvent::CallEnd { tag, .. } => Some(tag),
            _ => None,
        }
    }
}

/// Observer of simulation state changes
///
/// Listeners are called with no kernel lock held, on whichever thread is the
/// active logical thread of control at that instant.
pub trait SimulationListener: Send + Sync {
    fn state_changed(&self, event: &SimulationStateEvent);
}

/// Listener that records every event it observes
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SimulationStateEvent>>,
}

impl EventLog {
    /// Create a new empty event log
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the log
    pub fn log(&self, event: SimulationStateEvent) {
        self.events.lock().push(event);
    }

    /// Get the number of events logged
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Snapshot of all events
    pub fn events(&self) -> Vec<SimulationStateEvent> {
        self.events.lock().clone()
    }

    /// Get events for a specific tick
    pub fn events_at_tick(&self, tick: i64) -> Vec<SimulationStateEvent> {
        self.filtered(|e| e.tick() == tick)
    }

    /// Get events of a specific type
    pub fn events_of_type(&self, event_type: &str) -> Vec<SimulationStateEvent> {
        self.filtered(|e| e.event_type() == event_type)
    }

    /// Get events for a specific task
    pub fn events_for_task(&self, task: &str) -> Vec<SimulationStateEvent> {
        self.filtered(|e| e.task() == Some(task))
    }

    /// Get events for a specific queue
    pub fn events_for_queue(&self, queue: &str) -> Vec<SimulationStateEvent> {
        self.filtered(|e| e.queue() == Some(queue))
    }

    /// Clear all events
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn filtered(&self, keep: impl Fn(&SimulationStateEvent) -> bool) -> Vec<SimulationStateEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }
}

impl SimulationListener for EventLog {
    fn state_changed(&self, event: &SimulationStateEvent) {
        self.log(event.clone());
    }
}
