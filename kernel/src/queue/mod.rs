//! Task queues and server queues
//!
//! Every queue in this module shares one release engine ([`engine`]): queued
//! items carry a ready tick, a discipline rank and an insertion sequence,
//! and a single kernel event (the *pump*) releases one item at a time at
//! the next candidate's ready tick.
//!
//! - [`task_queue`]: FIFO/LIFO/priority queues of calls and task continuations
//! - [`wait`]: a FIFO queue whose items need a release credit
//! - [`server`]: jobs bound to a pool of servers with processing intervals

pub mod engine;
pub mod server;
pub mod task_queue;
pub mod wait;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

pub use self::engine::Discipline;

/// What `delete()` does to a queue that still holds items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse additions at once, become deleted after draining
    #[default]
    WhenEmpty,
    /// Delete only a queue that is already empty and idle
    MustBeEmpty,
    /// Never delete
    Never,
}

/// Deletion progress of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Active,
    /// `delete()` accepted, waiting for the queue to drain
    Deleting,
    Deleted,
}

/// Owner side of a [`QueueEntry`]
pub(crate) trait EntryOwner: Send + Sync {
    fn cancel_entry(self: Arc<Self>, seq: u64) -> bool;
    fn has_entry(&self, seq: u64) -> bool;
}

/// Handle to an item waiting in a queue
#[derive(Clone)]
pub struct QueueEntry {
    owner: Weak<dyn EntryOwner>,
    seq: u64,
}

impl QueueEntry {
    pub(crate) fn new(owner: Weak<dyn EntryOwner>, seq: u64) -> Self {
        Self { owner, seq }
    }

    /// Remove the item before it is released
    ///
    /// Returns true only for the call that removed it. A queued task
    /// continuation is resumed at the current tick and its
    /// `add_current_task` call returns `Ok(false)`.
    pub fn cancel(&self) -> bool {
        match self.owner.upgrade() {
            Some(owner) => owner.cancel_entry(self.seq),
            None => false,
        }
    }

    /// True while the item waits in its queue
    pub fn is_pending(&self) -> bool {
        self.owner
            .upgrade()
            .map(|owner| owner.has_entry(self.seq))
            .unwrap_or(false)
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("seq", &self.seq)
            .field("pending", &self.is_pending())
            .finish()
    }
}
