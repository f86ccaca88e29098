//! Discipline-agnostic release engine shared by every queue
//!
//! [`QueueCore`] is the plain data: pending items, the current release
//! round, freeze/preempt/hold flags, deletion status and (for wait queues)
//! release credits. The free functions drive it against the timeline:
//! [`repump`] keeps exactly one pump event scheduled at the next release
//! target, and the pump releases one item per firing through
//! [`QueueOwner::dispatch`].
//!
//! # Rounds
//!
//! Without preemption a queue drains *rounds*: when a release finds no
//! remaining member of the current round, every eligible item forms the new
//! round, and items arriving meanwhile wait for the next one. With
//! preemption the candidate is recomputed from all eligible items at every
//! release, so a newer LIFO item or a better-ranked priority item jumps
//! ahead.

use crate::core::error::SimError;
use crate::queue::wait::ReleasePolicy;
use crate::queue::{DeletePolicy, EntryOwner, QueueEntry, QueueStatus};
use crate::sim::event::SimulationEvent;
use crate::trace::object::ObjectCore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Order in which simultaneously eligible items are released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discipline {
    /// Insertion order
    Fifo,
    /// Most recently added first
    Lifo,
    /// Ascending rank, ties in insertion order
    Priority,
}

/// A queued item
pub(crate) struct Pending<P> {
    pub seq: u64,
    pub ready_tick: i64,
    pub rank: i64,
    /// Kernel priority of the pump event that releases this item
    pub tpriority: f64,
    pub credited: bool,
    pub payload: P,
}

/// Release credits of a wait queue
#[derive(Debug, Default)]
pub(crate) struct Credits {
    pub policy: ReleasePolicy,
    /// Total granted since the last clear
    pub granted: u64,
    /// Granted but not bound to an item
    pub available: u64,
    /// Freed by cancellation, kept for the next added items
    pub reserved: u64,
}

struct Pump {
    event: SimulationEvent,
    tick: i64,
    priority: f64,
}

pub(crate) struct QueueCore<P, X> {
    pub discipline: Discipline,
    items: Vec<Pending<P>>,
    next_seq: u64,
    round: Vec<u64>,
    pub frozen: bool,
    pub can_freeze: bool,
    pub preempt: bool,
    pub can_preempt: bool,
    /// A released task paused while keeping the queue busy
    pub hold: bool,
    pub status: QueueStatus,
    pub policy: DeletePolicy,
    pub credits: Option<Credits>,
    pump: Option<Pump>,
    pub extra: X,
}

impl<P, X> QueueCore<P, X> {
    pub fn new(discipline: Discipline, extra: X) -> Self {
        Self {
            discipline,
            items: Vec::new(),
            next_seq: 0,
            round: Vec::new(),
            frozen: false,
            can_freeze: true,
            preempt: false,
            can_preempt: discipline != Discipline::Fifo,
            hold: false,
            status: QueueStatus::Active,
            policy: DeletePolicy::default(),
            credits: None,
            pump: None,
            extra,
        }
    }

    /// Gate every item behind a release credit
    pub fn with_credits(mut self) -> Self {
        self.credits = Some(Credits::default());
        self.can_freeze = false;
        self.can_preempt = false;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn accepting(&self) -> bool {
        self.status == QueueStatus::Active
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.items.iter().any(|item| item.seq == seq)
    }

    pub fn push(&mut self, ready_tick: i64, rank: i64, tpriority: f64, payload: P) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut credited = false;
        if let Some(credits) = self.credits.as_mut() {
            if credits.reserved > 0 {
                credits.reserved -= 1;
                credited = true;
            } else if credits.available > 0 {
                credits.available -= 1;
                credited = true;
            }
        }
        self.items.push(Pending {
            seq,
            ready_tick,
            rank,
            tpriority,
            credited,
            payload,
        });
        seq
    }

    /// Remove an item before release, applying the release policy to its credit
    pub fn cancel(&mut self, seq: u64) -> Option<Pending<P>> {
        let index = self.items.iter().position(|item| item.seq == seq)?;
        let item = self.items.remove(index);
        self.round.retain(|s| *s != seq);
        if item.credited {
            if let Some(credits) = self.credits.as_mut() {
                match credits.policy {
                    ReleasePolicy::CancelsIgnored => {
                        credits.available += 1;
                        self.bind_credits();
                    }
                    ReleasePolicy::CancelsAsReleased => {}
                    ReleasePolicy::ReplaceCancels => credits.reserved += 1,
                }
            }
        }
        Some(item)
    }

    fn bind_credits(&mut self) {
        if let Some(credits) = self.credits.as_mut() {
            for item in self.items.iter_mut() {
                if credits.available == 0 {
                    break;
                }
                if !item.credited {
                    item.credited = true;
                    credits.available -= 1;
                }
            }
        }
    }

    pub fn release_credits(&mut self, count: u64) {
        if let Some(credits) = self.credits.as_mut() {
            credits.granted += count;
            credits.available += count;
        }
        self.bind_credits();
    }

    pub fn release_credits_up_to(&mut self, total: u64) {
        let granted = self.credits.as_ref().map_or(0, |credits| credits.granted);
        if granted < total {
            self.release_credits(total - granted);
        }
    }

    pub fn clear_credits(&mut self) {
        if let Some(credits) = self.credits.as_mut() {
            credits.granted = 0;
            credits.available = 0;
            credits.reserved = 0;
            for item in self.items.iter_mut() {
                item.credited = false;
            }
        }
    }

    /// Credits bound to waiting items, unbound, or reserved
    pub fn outstanding_credits(&self) -> u64 {
        match &self.credits {
            Some(credits) => {
                let bound = self.items.iter().filter(|item| item.credited).count() as u64;
                bound + credits.available + credits.reserved
            }
            None => 0,
        }
    }

    fn credit_ok(&self, item: &Pending<P>) -> bool {
        self.credits.is_none() || item.credited
    }

    fn eligible(&self, item: &Pending<P>, now: i64) -> bool {
        item.ready_tick <= now && self.credit_ok(item)
    }

    /// True if `a` releases before `b`
    fn precedes(&self, a: &Pending<P>, b: &Pending<P>) -> bool {
        match self.discipline {
            Discipline::Fifo => a.seq < b.seq,
            Discipline::Lifo => a.seq > b.seq,
            Discipline::Priority => (a.rank, a.seq) < (b.rank, b.seq),
        }
    }

    fn best<F>(&self, keep: F) -> Option<usize>
    where
        F: Fn(&Pending<P>) -> bool,
    {
        let mut best: Option<usize> = None;
        for (index, item) in self.items.iter().enumerate() {
            if !keep(item) {
                continue;
            }
            best = match best {
                Some(current) if !self.precedes(item, &self.items[current]) => Some(current),
                _ => Some(index),
            };
        }
        best
    }

    fn candidate(&self, now: i64) -> Option<usize> {
        if !self.preempt {
            let in_round =
                self.best(|item| self.round.contains(&item.seq) && self.eligible(item, now));
            if in_round.is_some() {
                return in_round;
            }
        }
        self.best(|item| self.eligible(item, now))
    }

    /// Whether releases may happen at all right now
    pub fn releasable(&self, gate_open: bool) -> bool {
        self.status != QueueStatus::Deleted && !self.frozen && !self.hold && gate_open
    }

    /// Remove and return the next item to release
    pub fn take(&mut self, now: i64) -> Option<Pending<P>> {
        if !self.preempt {
            let items = &self.items;
            self.round.retain(|seq| items.iter().any(|item| item.seq == *seq));
            if self.round.is_empty() {
                let round: Vec<u64> = self
                    .items
                    .iter()
                    .filter(|item| self.eligible(item, now))
                    .map(|item| item.seq)
                    .collect();
                self.round = round;
            }
        }
        let index = self.candidate(now)?;
        let item = self.items.remove(index);
        self.round.retain(|seq| *seq != item.seq);
        Some(item)
    }

    /// Tick and kernel priority at which the pump should next fire
    pub fn next_target(&self, now: i64, gate_open: bool) -> Option<(i64, f64)> {
        if !self.releasable(gate_open) {
            return None;
        }
        if let Some(index) = self.candidate(now) {
            return Some((now, self.items[index].tpriority));
        }
        let tick = self
            .items
            .iter()
            .filter(|item| item.ready_tick > now && self.credit_ok(item))
            .map(|item| item.ready_tick)
            .min()?;
        let index = self.best(|item| item.ready_tick == tick && self.credit_ok(item))?;
        Some((tick, self.items[index].tpriority))
    }

    /// Apply `delete()`; returns (accepted, deleted now)
    pub fn delete(&mut self, idle: bool) -> (bool, bool) {
        let drained = self.items.is_empty() && idle;
        match (self.policy, self.status) {
            (_, QueueStatus::Deleted) => (true, false),
            (DeletePolicy::Never, _) => (false, false),
            (DeletePolicy::MustBeEmpty, _) | (DeletePolicy::WhenEmpty, _) if drained => {
                self.status = QueueStatus::Deleted;
                (true, true)
            }
            (DeletePolicy::MustBeEmpty, _) => (false, false),
            (DeletePolicy::WhenEmpty, _) => {
                self.status = QueueStatus::Deleting;
                (true, false)
            }
        }
    }

    /// Finish a pending `WhenEmpty` deletion once drained; true if it finished now
    pub fn settle_deleted(&mut self, idle: bool) -> bool {
        if self.status == QueueStatus::Deleting && self.items.is_empty() && idle {
            self.status = QueueStatus::Deleted;
            true
        } else {
            false
        }
    }
}

/// A queue type driven by the release engine
pub(crate) trait QueueOwner: Send + Sync + Sized + 'static {
    type Payload: Send + 'static;
    type Extra: Send + 'static;

    fn state(&self) -> &Mutex<QueueCore<Self::Payload, Self::Extra>>;

    fn object(&self) -> &ObjectCore;

    /// Extra release gate, e.g. an idle server
    fn gate_open(_extra: &Self::Extra) -> bool {
        true
    }

    /// No released work still in progress
    fn idle(core: &QueueCore<Self::Payload, Self::Extra>) -> bool {
        !core.hold
    }

    /// Process a released item; runs with no lock held
    fn dispatch(queue: &Arc<Self>, item: Pending<Self::Payload>) -> Result<(), SimError>;

    /// Clean up after an item canceled before release
    fn discard(queue: &Arc<Self>, item: Pending<Self::Payload>);

    /// Remove the queue from its simulation's name table
    fn unregister(queue: &Arc<Self>);
}

impl<Q: QueueOwner> EntryOwner for Q {
    fn cancel_entry(self: Arc<Self>, seq: u64) -> bool {
        cancel_item(&self, seq)
    }

    fn has_entry(&self, seq: u64) -> bool {
        self.state().lock().contains(seq)
    }
}

pub(crate) fn entry_handle<Q: QueueOwner>(queue: &Arc<Q>, seq: u64) -> QueueEntry {
    let weak: Weak<Q> = Arc::downgrade(queue);
    QueueEntry::new(weak, seq)
}

/// Queue an item `delay` ticks from now; `None` if the queue refuses additions
pub(crate) fn enqueue<Q: QueueOwner>(
    queue: &Arc<Q>,
    delay: i64,
    rank: i64,
    tpriority: f64,
    payload: Q::Payload,
) -> Result<Option<QueueEntry>, SimError> {
    if delay < 0 {
        return Err(SimError::negative_delay(delay));
    }
    let now = queue.object().simulation().current_ticks();
    let seq = {
        let mut core = queue.state().lock();
        if !core.accepting() {
            return Ok(None);
        }
        core.push(now.saturating_add(delay), rank, tpriority, payload)
    };
    repump(queue)?;
    Ok(Some(entry_handle(queue, seq)))
}

/// Reconcile the pump event with the queue's current release target
pub(crate) fn repump<Q: QueueOwner>(queue: &Arc<Q>) -> Result<(), SimError> {
    let sim = queue.object().simulation();
    let now = sim.current_ticks();
    let mut core = queue.state().lock();
    let gate = Q::gate_open(&core.extra);
    let target = core.next_target(now, gate);
    if let (Some(pump), Some((tick, priority))) = (&core.pump, target) {
        if pump.tick == tick && pump.priority.total_cmp(&priority).is_eq() && pump.event.is_pending() {
            return Ok(());
        }
    }
    let stale = core.pump.take();
    if let Some((tick, priority)) = target {
        let owner = Arc::clone(queue);
        let event = sim.schedule_action(
            Box::new(move || pump_fired(&owner)),
            tick - now,
            priority,
            None,
        )?;
        core.pump = Some(Pump {
            event,
            tick,
            priority,
        });
    }
    drop(core);
    if let Some(stale) = stale {
        stale.event.cancel();
    }
    Ok(())
}

fn pump_fired<Q: QueueOwner>(queue: &Arc<Q>) -> Result<(), SimError> {
    let now = queue.object().simulation().current_ticks();
    let item = {
        let mut core = queue.state().lock();
        core.pump = None;
        let gate = Q::gate_open(&core.extra);
        if core.releasable(gate) {
            core.take(now)
        } else {
            None
        }
    };
    let result = {
        let _unwind = SettleOnUnwind::new(queue);
        match item {
            Some(item) => Q::dispatch(queue, item),
            None => Ok(()),
        }
    };
    let settled = settle(queue);
    result.and(settled)
}

/// Settles the queue if a user callback unwinds past it, so the pump is rearmed
pub(crate) struct SettleOnUnwind<'a, Q: QueueOwner> {
    queue: &'a Arc<Q>,
}

impl<'a, Q: QueueOwner> SettleOnUnwind<'a, Q> {
    pub(crate) fn new(queue: &'a Arc<Q>) -> Self {
        Self { queue }
    }
}

impl<Q: QueueOwner> Drop for SettleOnUnwind<'_, Q> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if let Err(err) = settle(self.queue) {
            tracing::warn!(queue = %self.queue.object().name(), error = %err, "repump after panicking callback failed");
        }
    }
}

/// Complete a pending deletion if the queue drained, then repump
pub(crate) fn settle<Q: QueueOwner>(queue: &Arc<Q>) -> Result<(), SimError> {
    let deleted = {
        let mut core = queue.state().lock();
        let idle = Q::idle(&core);
        core.settle_deleted(idle)
    };
    if deleted {
        tracing::debug!(queue = %queue.object().name(), "queue drained and deleted");
        Q::unregister(queue);
    }
    repump(queue)
}

pub(crate) fn cancel_item<Q: QueueOwner>(queue: &Arc<Q>, seq: u64) -> bool {
    let removed = queue.state().lock().cancel(seq);
    match removed {
        Some(item) => {
            Q::discard(queue, item);
            if let Err(err) = settle(queue) {
                tracing::warn!(queue = %queue.object().name(), error = %err, "repump after cancel failed");
            }
            true
        }
        None => false,
    }
}

/// Remove an item without the owner's cancel side effects
pub(crate) fn withdraw<Q: QueueOwner>(queue: &Arc<Q>, seq: u64) -> bool {
    let removed = queue.state().lock().cancel(seq);
    if removed.is_none() {
        return false;
    }
    drop(removed);
    if let Err(err) = settle(queue) {
        tracing::warn!(queue = %queue.object().name(), error = %err, "repump after withdraw failed");
    }
    true
}

pub(crate) fn delete<Q: QueueOwner>(queue: &Arc<Q>) -> bool {
    let (accepted, deleted) = {
        let mut core = queue.state().lock();
        let idle = Q::idle(&core);
        core.delete(idle)
    };
    if deleted {
        tracing::debug!(queue = %queue.object().name(), "queue deleted");
        Q::unregister(queue);
    }
    if accepted {
        if let Err(err) = repump(queue) {
            tracing::warn!(queue = %queue.object().name(), error = %err, "repump after delete failed");
        }
    }
    accepted
}

pub(crate) fn set_frozen<Q: QueueOwner>(queue: &Arc<Q>, frozen: bool) -> Result<(), SimError> {
    {
        let mut core = queue.state().lock();
        if !core.can_freeze {
            return Err(SimError::Unsupported("freeze is not supported by this queue"));
        }
        core.frozen = frozen;
    }
    repump(queue)
}

pub(crate) fn set_preempt<Q: QueueOwner>(queue: &Arc<Q>, preempt: bool) -> Result<(), SimError> {
    {
        let mut core = queue.state().lock();
        if !core.can_preempt {
            return Err(SimError::Unsupported("preempt is not supported by this queue"));
        }
        core.preempt = preempt;
    }
    repump(queue)
}

pub(crate) fn set_delete_policy<Q: QueueOwner>(queue: &Arc<Q>, policy: DeletePolicy) -> Result<(), SimError> {
    let mut core = queue.state().lock();
    if core.status != QueueStatus::Active {
        return Err(SimError::IllegalState(
            "delete policy cannot change once deletion started".to_string(),
        ));
    }
    core.policy = policy;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(discipline: Discipline) -> QueueCore<&'static str, ()> {
        QueueCore::new(discipline, ())
    }

    fn drain(core: &mut QueueCore<&'static str, ()>, now: i64) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Some(item) = core.take(now) {
            out.push(item.payload);
        }
        out
    }

    #[test]
    fn test_discipline_orders() {
        let mut fifo = core(Discipline::Fifo);
        let mut lifo = core(Discipline::Lifo);
        for label in ["x1", "x2", "x3"] {
            fifo.push(0, 0, 0.0, label);
            lifo.push(0, 0, 0.0, label);
        }
        assert_eq!(drain(&mut fifo, 0), vec!["x1", "x2", "x3"]);
        assert_eq!(drain(&mut lifo, 0), vec!["x3", "x2", "x1"]);
    }

    #[test]
    fn test_priority_rank_then_insertion() {
        let mut q = core(Discipline::Priority);
        q.push(0, 5, 0.0, "a");
        q.push(0, 1, 0.0, "b");
        q.push(0, 5, 0.0, "c");
        assert_eq!(drain(&mut q, 0), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_round_excludes_late_arrivals() {
        let mut q = core(Discipline::Lifo);
        q.push(0, 0, 0.0, "a");
        q.push(0, 0, 0.0, "b");
        assert_eq!(q.take(0).unwrap().payload, "b");
        q.push(0, 0, 0.0, "late");
        assert_eq!(q.take(0).unwrap().payload, "a");
        assert_eq!(q.take(0).unwrap().payload, "late");
    }

    #[test]
    fn test_preempt_lets_late_arrivals_jump() {
        let mut q = core(Discipline::Lifo);
        q.preempt = true;
        q.push(0, 0, 0.0, "a");
        q.push(0, 0, 0.0, "b");
        assert_eq!(q.take(0).unwrap().payload, "b");
        q.push(0, 0, 0.0, "late");
        assert_eq!(q.take(0).unwrap().payload, "late");
    }

    #[test]
    fn test_next_target_waits_for_ready_tick() {
        let mut q = core(Discipline::Fifo);
        q.push(7, 0, 2.5, "later");
        assert_eq!(q.next_target(0, true), Some((7, 2.5)));
        assert!(q.take(0).is_none());
        q.frozen = true;
        assert_eq!(q.next_target(7, true), None);
    }

    #[test]
    fn test_credit_binding_and_policies() {
        let mut q = core(Discipline::Fifo).with_credits();
        let first = q.push(0, 0, 0.0, "a");
        q.push(0, 0, 0.0, "b");
        q.push(0, 0, 0.0, "c");
        q.release_credits(1);
        assert_eq!(q.outstanding_credits(), 1);

        // default policy hands the credit to the next waiting item
        q.cancel(first);
        assert_eq!(q.take(0).unwrap().payload, "b");
        assert!(q.take(0).is_none());

        q.release_credits_up_to(1);
        assert!(q.take(0).is_none());
        q.release_credits_up_to(2);
        assert_eq!(q.take(0).unwrap().payload, "c");
    }

    #[test]
    fn test_replace_cancels_reserves_for_new_item() {
        let mut q = core(Discipline::Fifo).with_credits();
        q.credits.as_mut().unwrap().policy = ReleasePolicy::ReplaceCancels;
        let first = q.push(0, 0, 0.0, "a");
        q.push(0, 0, 0.0, "b");
        q.release_credits(1);
        q.cancel(first);
        assert!(q.take(0).is_none());
        q.push(0, 0, 0.0, "new");
        assert_eq!(q.take(0).unwrap().payload, "new");
    }

    #[test]
    fn test_delete_policies() {
        let mut q = core(Discipline::Fifo);
        q.push(0, 0, 0.0, "a");
        q.policy = DeletePolicy::MustBeEmpty;
        assert_eq!(q.delete(true), (false, false));
        assert!(q.accepting());

        q.policy = DeletePolicy::WhenEmpty;
        assert_eq!(q.delete(true), (true, false));
        assert_eq!(q.status, QueueStatus::Deleting);
        q.take(0);
        assert!(q.settle_deleted(true));
        assert_eq!(q.status, QueueStatus::Deleted);

        let mut never = core(Discipline::Fifo);
        never.policy = DeletePolicy::Never;
        assert_eq!(never.delete(true), (false, false));
    }
}
