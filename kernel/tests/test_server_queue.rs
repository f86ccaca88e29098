//! Server queues: jobs held until a server is free, then busy for its interval

use des_kernel::{
    EventLog, FifoServerQueue, FixedServer, LifoServerQueue, PriorityServerQueue, QueueServer, SimError, Simulation,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Helpers
// ============================================================================

type Log = Arc<Mutex<Vec<(usize, i64)>>>;

fn completion(log: &Log, sim: &Simulation, job: usize) -> impl FnOnce() + Send + 'static {
    let (log, sim) = (log.clone(), sim.clone());
    move || log.lock().unwrap().push((job, sim.current_ticks()))
}

/// A server whose pace is fixed and which counts the jobs it served
struct Teller {
    name: &'static str,
    pace: i64,
    served: u32,
}

impl Teller {
    fn new(name: &'static str, pace: i64) -> Self {
        Self { name, pace, served: 0 }
    }
}

impl QueueServer for Teller {
    fn interval(&self) -> i64 {
        self.pace
    }

    fn label(&self) -> Option<String> {
        Some(self.name.to_string())
    }
}

// ============================================================================
// Service
// ============================================================================

#[test]
fn test_single_server_serves_jobs_back_to_back() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 10)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call(|_| {}, completion(&log, &sim, 0), 0).unwrap();
    queue.add_call(|_| {}, completion(&log, &sim, 1), 0).unwrap();

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(0, 10), (1, 20)]);
    assert_eq!(queue.in_use_count(), 0);
}

#[test]
fn test_longest_idle_server_takes_next_job() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(
        &sim,
        Some("bank"),
        false,
        vec![Teller::new("ann", 3), Teller::new("bob", 5)],
    )
    .unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    for job in 0..4 {
        queue
            .add_call(|teller: &mut Teller| teller.served += 1, completion(&log, &sim, job), 0)
            .unwrap();
    }

    let q = queue.clone();
    sim.schedule_call(move || assert_eq!(q.in_use_count(), 2), 1).unwrap();
    sim.run().unwrap();

    assert_eq!(*log.lock().unwrap(), vec![(0, 3), (1, 5), (2, 6), (3, 10)]);
    assert_eq!(queue.with_server(0, |teller| teller.served), Some(2));
    assert_eq!(queue.with_server(1, |teller| teller.served), Some(2));
    assert_eq!(queue.with_server(2, |teller| teller.served), None);
    assert_eq!(queue.server_count(), 2);
}

#[test]
fn test_jobs_wait_for_their_delay() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 4)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call(|_| {}, completion(&log, &sim, 0), 6).unwrap();
    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(0, 10)]);
}

#[test]
fn test_priority_server_queue_picks_lowest_priority() {
    let sim = Simulation::new();
    let queue = PriorityServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 1)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call_with_priority(|_| {}, completion(&log, &sim, 0), 0, 7).unwrap();
    queue.add_call_with_priority(|_| {}, completion(&log, &sim, 1), 0, 2).unwrap();
    queue.add_call_with_priority(|_| {}, completion(&log, &sim, 2), 0, 2).unwrap();

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(1, 1), (2, 2), (0, 3)]);
}

#[test]
fn test_lifo_server_queue_serves_newest_waiting_job() {
    let sim = Simulation::new();
    let queue = LifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 2)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call(|_| {}, completion(&log, &sim, 0), 0).unwrap();
    let (q, l, s) = (queue.clone(), log.clone(), sim.clone());
    sim.schedule_call(
        move || {
            q.add_call(|_| {}, completion(&l, &s, 1), 0).unwrap();
            q.add_call(|_| {}, completion(&l, &s, 2), 0).unwrap();
        },
        1,
    )
    .unwrap();

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(0, 2), (2, 4), (1, 6)]);
}

// ============================================================================
// Tasks
// ============================================================================

#[test]
fn test_task_job_starts_when_service_completes() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 5)]).unwrap();
    let started = Arc::new(Mutex::new(None));
    let (s, st) = (sim.clone(), started.clone());
    queue
        .add_task(
            |_| {},
            move || {
                *st.lock().unwrap() = Some(s.current_ticks());
                Ok(())
            },
            1,
        )
        .unwrap();
    sim.run().unwrap();
    assert_eq!(*started.lock().unwrap(), Some(6));
}

#[test]
fn test_current_task_is_served() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![Teller::new("ann", 4)]).unwrap();
    let finished = Arc::new(Mutex::new(Vec::new()));
    for customer in ["c1", "c2"] {
        let (q, f, s) = (queue.clone(), finished.clone(), sim.clone());
        sim.schedule_task(
            move || {
                let served = q.add_current_task(|teller: &mut Teller| teller.served += 1, 0)?;
                f.lock().unwrap().push((customer, served, s.current_ticks()));
                Ok(())
            },
            0,
        )
        .unwrap();
    }

    sim.run().unwrap();
    assert_eq!(*finished.lock().unwrap(), vec![("c1", true, 4), ("c2", true, 8)]);
    assert_eq!(queue.with_server(0, |teller| teller.served), Some(2));
}

#[test]
fn test_delete_lets_waiting_customers_finish() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 10)]).unwrap();
    let first = queue.add_call(|_| {}, || {}, 0).unwrap().unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let (q, o, s) = (queue.clone(), outcome.clone(), sim.clone());
    sim.schedule_task(
        move || {
            let served = q.add_current_task(|_| {}, 0)?;
            *o.lock().unwrap() = Some((served, s.current_ticks()));
            Ok(())
        },
        0,
    )
    .unwrap();
    let q = queue.clone();
    sim.schedule_call(
        move || {
            assert_eq!(q.size(), 1);
            assert_eq!(q.in_use_count(), 1);
        },
        3,
    )
    .unwrap();

    sim.run_for(3).unwrap();
    assert!(!first.is_pending());
    assert_eq!(queue.size(), 1);
    assert!(queue.delete());
    assert!(!queue.is_deleted());
    sim.run().unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some((true, 20)));
    assert!(queue.is_deleted());
}

// ============================================================================
// Events and errors
// ============================================================================

#[test]
fn test_server_events_in_order() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, Some("desk"), false, vec![FixedServer::new("clerk", 3)]).unwrap();
    let events = Arc::new(EventLog::new());
    sim.add_listener(events.clone());
    queue.add_call(|_| {}, || {}, 0).unwrap();
    queue.add_task(|_| {}, || Ok(()), 0).unwrap();

    sim.run().unwrap();
    let seen: Vec<(&str, i64)> = events
        .events_for_queue("desk")
        .iter()
        .map(|event| (event.event_type(), event.tick()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("ServerSelected", 0),
            ("ServerInteraction", 0),
            ("ServerCallable", 3),
            ("ServerSelected", 3),
            ("ServerInteraction", 3),
            ("ServerTask", 6),
        ]
    );
}

#[test]
fn test_negative_interval_stops_run() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("broken", -1)]).unwrap();
    queue.add_call(|_| {}, || panic!("never completes"), 0).unwrap();
    assert!(matches!(sim.run(), Err(SimError::InvalidArgument(_))));
    assert_eq!(queue.in_use_count(), 0);
}

#[test]
fn test_frozen_server_queue_holds_jobs() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 1)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.freeze(true).unwrap();
    queue.add_call(|_| {}, completion(&log, &sim, 0), 0).unwrap();
    let q = queue.clone();
    sim.schedule_call(move || q.freeze(false).unwrap(), 4).unwrap();

    sim.run().unwrap();
    assert!(!queue.is_frozen());
    assert_eq!(*log.lock().unwrap(), vec![(0, 5)]);
}

// ============================================================================
// Failing callbacks
// ============================================================================

#[test]
fn test_panicking_interaction_returns_server_to_pool() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 3)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call(|_| panic!("interaction failed"), completion(&log, &sim, 0), 0).unwrap();
    queue.add_call(|_| {}, completion(&log, &sim, 1), 0).unwrap();

    assert!(panic::catch_unwind(AssertUnwindSafe(|| sim.run())).is_err());
    assert_eq!(queue.in_use_count(), 0);
    assert_eq!(queue.size(), 1);

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(1, 3)]);
    assert_eq!(queue.in_use_count(), 0);
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_panicking_completion_frees_server_for_next_job() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 3)]).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    queue.add_call(|_| {}, || panic!("completion failed"), 0).unwrap();
    queue.add_call(|_| {}, completion(&log, &sim, 1), 0).unwrap();

    assert!(panic::catch_unwind(AssertUnwindSafe(|| sim.run())).is_err());
    assert_eq!(sim.current_ticks(), 3);
    assert_eq!(queue.in_use_count(), 0);

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![(1, 6)]);
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_waiting_task_resumes_unserved_when_interaction_panics() {
    let sim = Simulation::new();
    let queue = FifoServerQueue::new(&sim, None, false, vec![FixedServer::new("clerk", 3)]).unwrap();
    let outcome = Arc::new(Mutex::new(None));
    let (q, o) = (queue.clone(), outcome.clone());
    sim.schedule_task(
        move || {
            let served = q.add_current_task(|_| panic!("interaction failed"), 0)?;
            *o.lock().unwrap() = Some(served);
            Ok(())
        },
        0,
    )
    .unwrap();

    assert!(panic::catch_unwind(AssertUnwindSafe(|| sim.run())).is_err());
    sim.run().unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some(false));
    assert_eq!(queue.in_use_count(), 0);
}
