//! Pending-event storage and the shared timeline
//!
//! [`EventQueue`] keeps events ordered by [`EventKey`] in a `BTreeMap`, with
//! a side index from stable event id to entry so a handle can cancel or
//! reschedule its event in `O(log n)`.
//!
//! [`Timeline`] wraps the queue together with the current tick and priority
//! behind a single `parking_lot::Mutex`. A root simulation creates one and
//! child simulations share it. The lock is a leaf: it is never held while
//! an action, a listener, or a task hand-off runs.

use crate::core::error::SimError;
use crate::sim::event::{EventId, EventKey, SimulationEvent};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Work attached to a scheduled event
pub(crate) type Action = Box<dyn FnOnce() -> Result<(), SimError> + Send>;

/// A queued event
pub(crate) struct Scheduled {
    pub key: EventKey,
    pub action: Action,
    /// Surfaced in `CallStart`/`CallEnd` listener events
    pub tag: Option<String>,
    /// Backtrace captured at scheduling time (stack-trace mode)
    pub stack: Option<Arc<str>>,
}

/// Ordered collection of pending events
#[derive(Default)]
pub(crate) struct EventQueue {
    order: BTreeMap<EventKey, EventId>,
    entries: HashMap<EventId, Scheduled>,
    next_sequence: u64,
    next_id: EventId,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_key(&mut self, tick: i64, priority: f64) -> EventKey {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        EventKey {
            tick,
            priority,
            sequence,
        }
    }

    pub fn insert(
        &mut self,
        tick: i64,
        priority: f64,
        action: Action,
        tag: Option<String>,
        stack: Option<Arc<str>>,
    ) -> EventId {
        let key = self.next_key(tick, priority);
        let id = self.next_id;
        self.next_id += 1;
        self.order.insert(key, id);
        self.entries.insert(
            id,
            Scheduled {
                key,
                action,
                tag,
                stack,
            },
        );
        id
    }

    pub fn remove(&mut self, id: EventId) -> Option<Scheduled> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.key);
        Some(entry)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn key_of(&self, id: EventId) -> Option<EventKey> {
        self.entries.get(&id).map(|entry| entry.key)
    }

    pub fn peek_key(&self) -> Option<EventKey> {
        self.order.keys().next().copied()
    }

    pub fn pop_first(&mut self) -> Option<Scheduled> {
        let (_, id) = self.order.pop_first()?;
        self.entries.remove(&id)
    }

    /// Re-key a pending event; the event gets a fresh sequence number
    pub fn reschedule(&mut self, id: EventId, tick: i64, priority: f64) -> bool {
        let old_key = match self.entries.get(&id) {
            Some(entry) => entry.key,
            None => return false,
        };
        self.order.remove(&old_key);
        let key = self.next_key(tick, priority);
        self.order.insert(key, id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = key;
        }
        true
    }
}

/// Result of asking the timeline for the next event to dispatch
pub(crate) enum Next {
    Dispatch(Scheduled),
    /// The next event lies beyond the run horizon and stays queued
    Horizon,
    Empty,
}

pub(crate) struct TimelineState {
    pub tick: i64,
    pub priority: f64,
    pub queue: EventQueue,
    pub running: bool,
    init_calls: BTreeMap<(i64, u64), Action>,
    next_init: u64,
    pub event_stack: Option<Arc<str>>,
}

/// Clock position plus event queue, shared by a simulation and its children
pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
}

impl Timeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TimelineState {
                tick: 0,
                priority: 0.0,
                queue: EventQueue::new(),
                running: false,
                init_calls: BTreeMap::new(),
                next_init: 0,
                event_stack: None,
            }),
        })
    }

    pub fn schedule(
        self: &Arc<Self>,
        delay: i64,
        priority: f64,
        action: Action,
        tag: Option<String>,
        stack: Option<Arc<str>>,
    ) -> Result<SimulationEvent, SimError> {
        if delay < 0 {
            return Err(SimError::negative_delay(delay));
        }
        let mut state = self.state.lock();
        let tick = state.tick.saturating_add(delay);
        let id = state.queue.insert(tick, priority, action, tag, stack);
        Ok(SimulationEvent::new(id, self))
    }

    pub fn cancel(&self, id: EventId) -> bool {
        // The removed action is dropped after the lock is released; it may
        // own handles whose destructors touch this timeline.
        let removed = self.state.lock().queue.remove(id);
        removed.is_some()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.state.lock().queue.contains(id)
    }

    pub fn key_of(&self, id: EventId) -> Option<EventKey> {
        self.state.lock().queue.key_of(id)
    }

    pub fn reschedule(&self, id: EventId, delay: i64, priority: f64) -> bool {
        let mut state = self.state.lock();
        let tick = state.tick.saturating_add(delay);
        state.queue.reschedule(id, tick, priority)
    }

    pub fn now(&self) -> (i64, f64) {
        let state = self.state.lock();
        (state.tick, state.priority)
    }

    pub fn ticks(&self) -> i64 {
        self.state.lock().tick
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn next_interval(&self) -> Option<i64> {
        let state = self.state.lock();
        state.queue.peek_key().map(|key| key.tick - state.tick)
    }

    pub fn event_stack(&self) -> Option<Arc<str>> {
        self.state.lock().event_stack.clone()
    }

    /// Move the clock forward without dispatching, stopping at the next event
    pub fn advance(&self, ticks: i64) -> Result<i64, SimError> {
        if ticks < 0 {
            return Err(SimError::InvalidArgument(format!(
                "advance interval must be non-negative, got {}",
                ticks
            )));
        }
        let mut state = self.state.lock();
        let mut interval = ticks;
        if let Some(key) = state.queue.peek_key() {
            interval = interval.min(key.tick - state.tick);
        }
        state.tick += interval;
        state.priority = 0.0;
        Ok(interval)
    }

    /// Claim the timeline for a run; the guard releases it on drop
    pub fn begin_run(self: &Arc<Self>) -> Result<RunGuard, SimError> {
        let mut state = self.state.lock();
        if state.running {
            return Err(SimError::AlreadyRunning);
        }
        state.running = true;
        Ok(RunGuard {
            timeline: Arc::clone(self),
        })
    }

    /// Pop the next event unless it lies beyond `horizon`, moving the clock to it
    pub fn next_due(&self, horizon: Option<i64>) -> Next {
        let mut state = self.state.lock();
        let key = match state.queue.peek_key() {
            Some(key) => key,
            None => return Next::Empty,
        };
        if matches!(horizon, Some(limit) if key.tick > limit) {
            return Next::Horizon;
        }
        match state.queue.pop_first() {
            Some(event) => {
                if event.key.tick >= state.tick {
                    state.tick = event.key.tick;
                    state.priority = event.key.priority;
                }
                state.event_stack = event.stack.clone();
                Next::Dispatch(event)
            }
            None => Next::Empty,
        }
    }

    /// Park the clock at the end of a bounded run
    pub fn settle_at(&self, horizon: i64) {
        let mut state = self.state.lock();
        if horizon > state.tick {
            state.tick = horizon;
        }
        state.priority = 0.0;
    }

    pub fn push_init(&self, order: i64, action: Action) {
        let mut state = self.state.lock();
        let seq = state.next_init;
        state.next_init += 1;
        state.init_calls.insert((order, seq), action);
    }

    pub fn take_init_calls(&self) -> Vec<Action> {
        let mut state = self.state.lock();
        std::mem::take(&mut state.init_calls).into_values().collect()
    }
}

/// Clears the running flag even if a dispatched action panics
pub(crate) struct RunGuard {
    timeline: Arc<Timeline>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.timeline.state.lock();
        state.running = false;
        state.event_stack = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Action {
        Box::new(|| Ok(()))
    }

    #[test]
    fn test_pop_order() {
        let mut queue = EventQueue::new();
        let late = queue.insert(10, 0.0, noop(), None, None);
        let high = queue.insert(5, 1.0, noop(), None, None);
        let low = queue.insert(5, -1.0, noop(), None, None);

        let first = queue.pop_first().unwrap();
        assert_eq!(first.key.tick, 5);
        assert_eq!(first.key.priority, -1.0);
        assert!(!queue.contains(low));
        assert!(queue.contains(high));
        assert!(queue.contains(late));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reschedule_gets_fresh_sequence() {
        let mut queue = EventQueue::new();
        let a = queue.insert(3, 0.0, noop(), None, None);
        let b = queue.insert(3, 0.0, noop(), None, None);
        assert!(queue.reschedule(a, 3, 0.0));

        assert_eq!(queue.peek_key(), queue.key_of(b));
        assert!(queue.remove(a).is_some());
        assert!(!queue.reschedule(a, 1, 0.0));
    }

    #[test]
    fn test_advance_capped_by_next_event() {
        let timeline = Timeline::new();
        timeline.schedule(4, 0.0, noop(), None, None).unwrap();
        assert_eq!(timeline.advance(10).unwrap(), 4);
        assert_eq!(timeline.ticks(), 4);
        assert_eq!(timeline.advance(3).unwrap(), 0);
        assert!(timeline.advance(-1).is_err());
    }

    #[test]
    fn test_horizon_keeps_event_queued() {
        let timeline = Timeline::new();
        timeline.schedule(7, 0.0, noop(), None, None).unwrap();
        assert!(matches!(timeline.next_due(Some(6)), Next::Horizon));
        assert_eq!(timeline.len(), 1);
        assert!(matches!(timeline.next_due(Some(7)), Next::Dispatch(_)));
        assert!(matches!(timeline.next_due(None), Next::Empty));
    }

    #[test]
    fn test_run_guard_releases() {
        let timeline = Timeline::new();
        let guard = timeline.begin_run().unwrap();
        assert!(matches!(timeline.begin_run(), Err(SimError::AlreadyRunning)));
        drop(guard);
        assert!(!timeline.is_running());
    }
}
