//! Wait queue: a FIFO task queue whose items need a release credit
//!
//! Items queue up as usual but are only released once [`WaitTaskQueue::release`]
//! granted them a credit. Credits bind to waiting items in FIFO order;
//! credits granted while nothing waits stay available for later arrivals.
//! What happens to the credit of a canceled item is the [`ReleasePolicy`].
//!
//! # Example
//!
//! ```
//! use des_kernel::{Simulation, WaitTaskQueue};
//! use std::sync::{Arc, Mutex};
//!
//! let sim = Simulation::new();
//! let gate = WaitTaskQueue::new(&sim, Some("gate"), false).unwrap();
//! let passed = Arc::new(Mutex::new(Vec::new()));
//! for n in 0..3 {
//!     let p = passed.clone();
//!     gate.add(move || p.lock().unwrap().push(n), 0).unwrap();
//! }
//! let opener = gate.clone();
//! sim.schedule_call(move || opener.release(2).unwrap(), 5).unwrap();
//!
//! sim.run().unwrap();
//! assert_eq!(*passed.lock().unwrap(), vec![0, 1]);
//! assert_eq!(gate.size(), 1);
//! ```

use crate::core::error::SimError;
use crate::queue::engine::{self, Discipline, QueueCore};
use crate::queue::task_queue::{build_interned, TaskQueue, TaskQueueExtra};
use crate::sim::simulation::Simulation;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Fate of the credit bound to an item that is canceled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// The credit returns to the pool and binds to the next waiting item
    #[default]
    CancelsIgnored,
    /// The cancel consumes the credit as if the item had been released
    CancelsAsReleased,
    /// The credit is reserved for the next item added to the queue
    ReplaceCancels,
}

/// FIFO task queue gated by release credits
#[derive(Clone, Debug)]
pub struct WaitTaskQueue(TaskQueue);

impl WaitTaskQueue {
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool) -> Result<Self, SimError> {
        let core = QueueCore::new(Discipline::Fifo, TaskQueueExtra::default()).with_credits();
        build_interned(sim, "waitTaskQueue", name, intern, core, WaitTaskQueue)
    }

    /// Grant `count` more credits
    pub fn release(&self, count: u64) -> Result<(), SimError> {
        self.0.inner.state.lock().release_credits(count);
        engine::settle(&self.0.inner)
    }

    /// Grant credits until `total` have been granted since the last clear
    ///
    /// Does nothing if at least `total` were granted already.
    pub fn release_up_to(&self, total: u64) -> Result<(), SimError> {
        self.0.inner.state.lock().release_credits_up_to(total);
        engine::settle(&self.0.inner)
    }

    /// Credits granted since creation or the last [`clear_release_count`](Self::clear_release_count)
    pub fn granted(&self) -> u64 {
        self.0
            .inner
            .state
            .lock()
            .credits
            .as_ref()
            .map_or(0, |credits| credits.granted)
    }

    /// Credits granted but not bound to any waiting item
    pub fn available_credits(&self) -> u64 {
        let core = self.0.inner.state.lock();
        core.credits
            .as_ref()
            .map_or(0, |credits| credits.available + credits.reserved)
    }

    /// Withdraw every unused credit and reset the granted count
    ///
    /// Items that had a credit bound lose it and wait for a new release.
    pub fn clear_release_count(&self) -> Result<(), SimError> {
        self.0.inner.state.lock().clear_credits();
        engine::settle(&self.0.inner)
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.0
            .inner
            .state
            .lock()
            .credits
            .as_ref()
            .map(|credits| credits.policy)
            .unwrap_or_default()
    }

    /// Change the release policy; only allowed while no credit is outstanding
    pub fn set_release_policy(&self, policy: ReleasePolicy) -> Result<(), SimError> {
        let mut core = self.0.inner.state.lock();
        if core.outstanding_credits() > 0 {
            return Err(SimError::IllegalState(
                "release policy cannot change while credits are outstanding".to_string(),
            ));
        }
        if let Some(credits) = core.credits.as_mut() {
            credits.policy = policy;
        }
        Ok(())
    }
}

impl Deref for WaitTaskQueue {
    type Target = TaskQueue;

    fn deref(&self) -> &TaskQueue {
        &self.0
    }
}
