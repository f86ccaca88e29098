//! Discrete-Event Simulation Kernel
//!
//! A virtual clock with a deterministic event queue, cooperative tasks and
//! a family of queueing abstractions built on top of it.
//!
//! # Architecture
//!
//! - **core**: Clock conversion, configuration and errors
//! - **sim**: Event queue, run loop, name table and run monitors
//! - **task**: Cooperative tasks with a strict hand-off protocol
//! - **queue**: Task queues, wait queues and server queues
//! - **process_clock**: Processor time shared round-robin among tasks
//! - **trace**: Trace sets and named simulation objects
//! - **events**: Listener events and the stock event log
//!
//! # Critical Invariants
//!
//! 1. Events fire in strict (tick, priority, sequence) order
//! 2. At most one body of simulation code runs at any instant
//! 3. The clock never moves backwards
//!
//! # Example
//!
//! ```
//! use des_kernel::Simulation;
//! use std::sync::{Arc, Mutex};
//!
//! let sim = Simulation::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let s = seen.clone();
//! let clock = sim.clone();
//! sim.schedule_task(move || {
//!     s.lock().unwrap().push(clock.current_ticks());
//!     clock.pause_task(5)?;
//!     s.lock().unwrap().push(clock.current_ticks());
//!     Ok(())
//! }, 2).unwrap();
//!
//! sim.run().unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![2, 7]);
//! ```

// Module declarations
pub mod core;
pub mod events;
pub mod process_clock;
pub mod queue;
pub mod sim;
pub mod task;
pub mod trace;

// Re-exports for convenience
pub use crate::core::{Clock, SimError, SimulationConfig, TraceFormat, TraceSetConfig};
pub use events::{EventLog, SimulationListener, SimulationStateEvent};
pub use process_clock::ProcessClock;
pub use queue::{
    server::{FifoServerQueue, FixedServer, LifoServerQueue, PriorityServerQueue, QueueServer, ServerQueue},
    task_queue::{FifoTaskQueue, LifoTaskQueue, PriorityTaskQueue, TaskQueue},
    wait::{ReleasePolicy, WaitTaskQueue},
    DeletePolicy, Discipline, QueueEntry, QueueStatus,
};
pub use sim::{
    EventCountMonitor, EventKey, Simulation, SimulationEvent, SimulationMonitor, StopFlagMonitor,
    TickLimitMonitor,
};
pub use task::{TaskState, TaskThread};
pub use trace::{ObjectCore, SharedWriter, SimObject, TraceRecord, TraceSet};
