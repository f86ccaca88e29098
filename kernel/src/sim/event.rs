//! Event ordering key and cancel handle
//!
//! Every scheduling entry point returns a [`SimulationEvent`]. The handle does
//! not own the event: the timeline does, until dispatch removes it. The
//! handle only names it, so canceling after the event fired (or after the
//! simulation was dropped) is a harmless `false`.

use crate::core::error::SimError;
use crate::sim::event_queue::Timeline;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};

/// Stable identity of a scheduled event (survives `reschedule`)
pub(crate) type EventId = u64;

/// Composite ordering key `(tick, priority, sequence)`
///
/// Priorities are compared with `f64::total_cmp`, so the ordering is total
/// even for NaN or signed zeros. The sequence number is unique per timeline,
/// which makes two keys equal only when they are the same insertion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventKey {
    pub tick: i64,
    pub priority: f64,
    pub sequence: u64,
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EventKey {}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tick
            .cmp(&other.tick)
            .then_with(|| self.priority.total_cmp(&other.priority))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

/// Handle to a scheduled event
///
/// Cloning the handle is cheap; every clone names the same event.
#[derive(Clone)]
pub struct SimulationEvent {
    id: EventId,
    timeline: Weak<Timeline>,
}

impl SimulationEvent {
    pub(crate) fn new(id: EventId, timeline: &Arc<Timeline>) -> Self {
        Self {
            id,
            timeline: Arc::downgrade(timeline),
        }
    }

    /// Remove the event from the queue
    ///
    /// Returns true only for the call that actually removed a pending event;
    /// canceling a fired or already-canceled event returns false.
    ///
    /// # Example
    /// ```
    /// use des_kernel::Simulation;
    ///
    /// let sim = Simulation::new();
    /// let event = sim.schedule_call(|| {}, 5).unwrap();
    /// assert!(event.cancel());
    /// assert!(!event.cancel());
    /// ```
    pub fn cancel(&self) -> bool {
        match self.timeline.upgrade() {
            Some(timeline) => timeline.cancel(self.id),
            None => false,
        }
    }

    /// True while the event is still queued
    pub fn is_pending(&self) -> bool {
        self.timeline
            .upgrade()
            .map(|timeline| timeline.contains(self.id))
            .unwrap_or(false)
    }

    /// Move a pending event to `current + delay` with a new priority
    ///
    /// The event receives a fresh sequence number, so it fires after events
    /// already scheduled with the same tick and priority. Returns `Ok(false)`
    /// if the event is no longer pending.
    pub fn reschedule(&self, delay: i64, priority: f64) -> Result<bool, SimError> {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        match self.timeline.upgrade() {
            Some(timeline) => Ok(timeline.reschedule(self.id, delay, priority)),
            None => Ok(false),
        }
    }

    /// Ordering key of the pending event, if it is still queued
    pub fn key(&self) -> Option<EventKey> {
        self.timeline
            .upgrade()
            .and_then(|timeline| timeline.key_of(self.id))
    }

    /// Tick at which the pending event fires
    pub fn tick(&self) -> Option<i64> {
        self.key().map(|key| key.tick)
    }
}

impl PartialEq for SimulationEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.timeline, &other.timeline)
    }
}

impl fmt::Debug for SimulationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationEvent")
            .field("id", &self.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}
