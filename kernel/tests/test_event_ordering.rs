//! Event ordering, cancellation and rescheduling
//!
//! Events fire in (tick, priority, insertion) order no matter how they were
//! scheduled.

use des_kernel::{SimError, Simulation};
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Helpers
// ============================================================================

type Log = Arc<Mutex<Vec<&'static str>>>;

fn push(log: &Log, label: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().unwrap().push(label)
}

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_same_tick_lower_priority_first() {
    let sim = Simulation::new();
    let log = new_log();
    sim.schedule_call_wp(push(&log, "A"), 1.0).unwrap();
    sim.schedule_call_wp(push(&log, "B"), -1.0).unwrap();

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
}

#[test]
fn test_priority_at_future_tick() {
    let sim = Simulation::new();
    let log = new_log();
    let s = sim.clone();
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let t = ticks.clone();
    sim.schedule_call_with_priority(push(&log, "A"), 10, 1.0).unwrap();
    sim.schedule_call_with_priority(push(&log, "B"), 10, -1.0).unwrap();
    sim.schedule_call_with_priority(move || t.lock().unwrap().push(s.current_ticks()), 10, 5.0)
        .unwrap();

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
    assert_eq!(*ticks.lock().unwrap(), vec![10]);
}

#[test]
fn test_equal_keys_fire_in_insertion_order() {
    let sim = Simulation::new();
    let log = new_log();
    for label in ["first", "second", "third"] {
        sim.schedule_call_with_priority(push(&log, label), 3, 0.5).unwrap();
    }
    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_earlier_tick_beats_lower_priority() {
    let sim = Simulation::new();
    let log = new_log();
    sim.schedule_call_with_priority(push(&log, "late"), 5, -100.0).unwrap();
    sim.schedule_call_with_priority(push(&log, "early"), 4, 100.0).unwrap();
    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
}

#[test]
fn test_event_scheduled_during_dispatch_at_same_tick() {
    let sim = Simulation::new();
    let log = new_log();
    let (s, l) = (sim.clone(), log.clone());
    sim.schedule_call(
        move || {
            l.lock().unwrap().push("outer");
            s.schedule_call(push(&l, "inner"), 0).unwrap();
        },
        2,
    )
    .unwrap();
    sim.schedule_call_with_priority(push(&log, "peer"), 2, 1.0).unwrap();

    sim.run().unwrap();
    // inner (priority 0) sorts ahead of peer (priority 1)
    assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "peer"]);
    assert_eq!(sim.current_ticks(), 2);
}

#[test]
fn test_current_priority_during_dispatch() {
    let sim = Simulation::new();
    let seen = Arc::new(Mutex::new(None));
    let (s, p) = (sim.clone(), seen.clone());
    sim.schedule_call_with_priority(move || *p.lock().unwrap() = Some(s.current_priority()), 1, 2.5)
        .unwrap();
    sim.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(2.5));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancel_is_idempotent() {
    let sim = Simulation::new();
    let log = new_log();
    let event = sim.schedule_call(push(&log, "never"), 5).unwrap();

    assert!(event.is_pending());
    assert!(event.cancel());
    assert!(!event.cancel());
    assert!(!event.is_pending());

    sim.run().unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_cancel_after_fire_returns_false() {
    let sim = Simulation::new();
    let event = sim.schedule_call(|| {}, 1).unwrap();
    sim.run().unwrap();
    assert!(!event.cancel());
    assert_eq!(event.tick(), None);
}

#[test]
fn test_cancel_from_another_event() {
    let sim = Simulation::new();
    let log = new_log();
    let victim = sim.schedule_call(push(&log, "victim"), 10).unwrap();
    sim.schedule_call(move || assert!(victim.cancel()), 3).unwrap();
    sim.run().unwrap();
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(sim.current_ticks(), 3);
}

// ============================================================================
// Rescheduling
// ============================================================================

#[test]
fn test_reschedule_moves_event() {
    let sim = Simulation::new();
    let log = new_log();
    let a = sim.schedule_call(push(&log, "A"), 2).unwrap();
    sim.schedule_call(push(&log, "B"), 5).unwrap();

    assert!(a.reschedule(8, 0.0).unwrap());
    assert_eq!(a.tick(), Some(8));
    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
    assert_eq!(sim.current_ticks(), 8);
}

#[test]
fn test_reschedule_goes_behind_equal_keys() {
    let sim = Simulation::new();
    let log = new_log();
    let a = sim.schedule_call(push(&log, "A"), 4).unwrap();
    sim.schedule_call(push(&log, "B"), 4).unwrap();
    assert!(a.reschedule(4, 0.0).unwrap());
    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
}

#[test]
fn test_reschedule_rejects_negative_and_fired() {
    let sim = Simulation::new();
    let event = sim.schedule_call(|| {}, 1).unwrap();
    assert!(matches!(
        event.reschedule(-3, 0.0),
        Err(SimError::InvalidArgument(_))
    ));
    sim.run().unwrap();
    assert!(!event.reschedule(1, 0.0).unwrap());
    assert!(!sim.more_events_scheduled());
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_dispatch_order_is_total(
        specs in prop::collection::vec((0i64..20, -3i32..3), 1..40)
    ) {
        let sim = Simulation::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (index, (delay, priority)) in specs.iter().enumerate() {
            let f = fired.clone();
            let s = sim.clone();
            sim.schedule_call_with_priority(
                move || f.lock().unwrap().push((s.current_ticks(), index)),
                *delay,
                *priority as f64,
            ).unwrap();
        }
        sim.run().unwrap();

        let mut expected: Vec<(i64, i32, usize)> = specs
            .iter()
            .enumerate()
            .map(|(index, (delay, priority))| (*delay, *priority, index))
            .collect();
        expected.sort();
        let expected: Vec<(i64, usize)> = expected.into_iter().map(|(tick, _, index)| (tick, index)).collect();

        prop_assert_eq!(fired.lock().unwrap().clone(), expected);
    }

    #[test]
    fn prop_canceled_events_never_fire(
        delays in prop::collection::vec(0i64..30, 1..30),
        mask in prop::collection::vec(any::<bool>(), 30)
    ) {
        let sim = Simulation::new();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut events = Vec::new();
        for (index, delay) in delays.iter().enumerate() {
            let f = fired.clone();
            events.push(sim.schedule_call(move || f.lock().unwrap().push(index), *delay).unwrap());
        }
        let mut kept = Vec::new();
        for (index, event) in events.iter().enumerate() {
            if mask[index] {
                prop_assert!(event.cancel());
            } else {
                kept.push(index);
            }
        }
        sim.run().unwrap();

        let mut fired = fired.lock().unwrap().clone();
        fired.sort();
        prop_assert_eq!(fired, kept);
    }

    #[test]
    fn prop_clock_never_moves_backwards(
        delays in prop::collection::vec(0i64..50, 1..25)
    ) {
        let sim = Simulation::new();
        let ticks = Arc::new(Mutex::new(Vec::new()));
        for delay in delays {
            let (t, s) = (ticks.clone(), sim.clone());
            sim.schedule_call(move || {
                let now = s.current_ticks();
                t.lock().unwrap().push(now);
                // a follow-up scheduled from inside dispatch
                let (t2, s2) = (t.clone(), s.clone());
                s.schedule_call(move || t2.lock().unwrap().push(s2.current_ticks()), delay % 7).unwrap();
            }, delay).unwrap();
        }
        sim.run().unwrap();

        let ticks = ticks.lock().unwrap();
        prop_assert!(ticks.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
