//! Run loop, monitors, listeners and the object name table

use des_kernel::{
    EventCountMonitor, EventLog, SimError, Simulation, SimulationListener, SimulationStateEvent,
    StopFlagMonitor, TickLimitMonitor,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

// ============================================================================
// Test Helpers
// ============================================================================

/// Schedule a no-op call at each tick and return a log of dispatch ticks
fn schedule_at(sim: &Simulation, ticks: &[i64]) -> Arc<Mutex<Vec<i64>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for &tick in ticks {
        let (l, s) = (log.clone(), sim.clone());
        sim.schedule_call(move || l.lock().unwrap().push(s.current_ticks()), tick)
            .unwrap();
    }
    log
}

// ============================================================================
// Bounded runs
// ============================================================================

#[test]
fn test_run_for_includes_horizon_and_settles_clock() {
    let sim = Simulation::new();
    let log = schedule_at(&sim, &[5, 10, 15]);

    sim.run_for(10).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![5, 10]);
    assert_eq!(sim.current_ticks(), 10);

    sim.run_for(3).unwrap();
    assert_eq!(sim.current_ticks(), 13);
    assert_eq!(sim.current_priority(), 0.0);
    assert_eq!(sim.next_event_interval(), Some(2));

    sim.run().unwrap();
    assert_eq!(*log.lock().unwrap(), vec![5, 10, 15]);
    assert!(matches!(sim.run_for(-1), Err(SimError::InvalidArgument(_))));
}

#[test]
fn test_run_for_on_empty_queue_moves_clock() {
    let sim = Simulation::new();
    sim.run_for(42).unwrap();
    assert_eq!(sim.current_ticks(), 42);
}

#[test]
fn test_stop_flag_monitor_pauses_after_event() {
    let sim = Simulation::new();
    let mut monitor = StopFlagMonitor::new();
    let flag = monitor.flag();
    let log = schedule_at(&sim, &[1, 2, 3]);
    sim.schedule_call(move || flag.store(true, Ordering::SeqCst), 2).unwrap();

    sim.run_with(&mut monitor).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    assert_eq!(sim.current_ticks(), 2);

    monitor.reset();
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_monitor_consulted_before_first_event() {
    let sim = Simulation::new();
    let log = schedule_at(&sim, &[1]);
    let mut calls = 0;
    let mut always = |_: &Simulation| {
        calls += 1;
        true
    };
    sim.run_with(&mut always).unwrap();
    assert_eq!(calls, 1);
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn test_event_count_monitor() {
    let sim = Simulation::new();
    let log = schedule_at(&sim, &[1, 2, 3, 4, 5]);
    let mut monitor = EventCountMonitor::new(2);

    sim.run_with(&mut monitor).unwrap();
    assert_eq!(log.lock().unwrap().len(), 2);
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(log.lock().unwrap().len(), 4);
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(log.lock().unwrap().len(), 5);
    assert_eq!(monitor.events_seen(), 5);
}

#[test]
fn test_event_count_restarts_after_drained_run() {
    let sim = Simulation::new();
    let mut monitor = EventCountMonitor::new(2);
    let first = schedule_at(&sim, &[1]);
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(first.lock().unwrap().len(), 1);
    assert!(!sim.more_events_scheduled());

    let second = schedule_at(&sim, &[1, 2, 3]);
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(second.lock().unwrap().len(), 2);
    assert_eq!(monitor.events_seen(), 3);
    sim.run_with(&mut monitor).unwrap();
    assert_eq!(second.lock().unwrap().len(), 3);
}

#[test]
fn test_tick_limit_monitor_advances_to_limit() {
    let sim = Simulation::new();
    let log = schedule_at(&sim, &[5, 10, 20]);
    let mut monitor = TickLimitMonitor::new(12);

    sim.run_with(&mut monitor).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![5, 10]);
    assert_eq!(sim.current_ticks(), 12);
    assert_eq!(sim.next_event_interval(), Some(8));
}

#[test]
fn test_closure_monitor() {
    let sim = Simulation::new();
    let log = schedule_at(&sim, &[3, 6, 9]);
    let mut past_five = |sim: &Simulation| sim.current_ticks() > 5;
    sim.run_with(&mut past_five).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![3, 6]);
}

// ============================================================================
// Errors during dispatch
// ============================================================================

#[test]
fn test_task_error_surfaces_as_task_failed() {
    let sim = Simulation::new();
    let task = sim
        .schedule_task(|| Err(SimError::IllegalState("broken".to_string())), 1)
        .unwrap();

    match sim.run() {
        Err(SimError::TaskFailed { task: name, source }) => {
            assert_eq!(name, task.name());
            assert!(matches!(*source, SimError::IllegalState(_)));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }
    assert!(task.is_finished());
    assert!(!sim.is_running());
}

#[test]
#[should_panic(expected = "boom")]
fn test_task_panic_reaches_run_caller() {
    let sim = Simulation::new();
    sim.schedule_task(|| panic!("boom"), 0).unwrap();
    let _ = sim.run();
}

#[test]
fn test_start_immediate_task_requires_running() {
    let sim = Simulation::new();
    assert!(matches!(
        sim.start_immediate_task(|| Ok(())),
        Err(SimError::IllegalState(_))
    ));

    let order = Arc::new(Mutex::new(Vec::new()));
    let (s, o) = (sim.clone(), order.clone());
    sim.schedule_call(
        move || {
            o.lock().unwrap().push("caller before");
            let inner = o.clone();
            s.start_immediate_task(move || {
                inner.lock().unwrap().push("task");
                Ok(())
            })
            .unwrap();
            o.lock().unwrap().push("caller after");
        },
        1,
    )
    .unwrap();
    sim.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["caller before", "task", "caller after"]);
}

// ============================================================================
// Listeners
// ============================================================================

#[test]
fn test_listener_sees_run_and_tagged_calls() {
    let sim = Simulation::new();
    let log = Arc::new(EventLog::new());
    sim.add_listener(log.clone());
    sim.schedule_tagged_call("greet", || {}, 4, 0.0).unwrap();
    sim.schedule_call(|| {}, 6).unwrap();

    sim.run().unwrap();
    let events = log.events();
    assert_eq!(
        events,
        vec![
            SimulationStateEvent::SimulationStart { tick: 0 },
            SimulationStateEvent::CallStart {
                tick: 4,
                tag: "greet".to_string()
            },
            SimulationStateEvent::CallEnd {
                tick: 4,
                tag: "greet".to_string()
            },
            SimulationStateEvent::SimulationStop { tick: 6 },
        ]
    );
}

#[test]
fn test_task_lifecycle_events() {
    let sim = Simulation::new();
    let log = Arc::new(EventLog::new());
    sim.add_listener(log.clone());
    let task = sim
        .schedule_task(
            || {
                des_kernel::TaskThread::pause(3)?;
                Ok(())
            },
            1,
        )
        .unwrap();
    sim.run().unwrap();

    let kinds: Vec<&str> = log
        .events_for_task(task.name())
        .iter()
        .map(|event| event.event_type())
        .collect();
    assert_eq!(kinds, vec!["TaskStart", "TaskPause", "TaskResume", "TaskEnd"]);
    let ticks: Vec<i64> = log.events_for_task(task.name()).iter().map(|e| e.tick()).collect();
    assert_eq!(ticks, vec![1, 1, 4, 4]);
}

#[test]
fn test_remove_listener() {
    let sim = Simulation::new();
    let log = Arc::new(EventLog::new());
    let listener: Arc<dyn SimulationListener> = log.clone();
    sim.add_listener(listener.clone());
    assert!(sim.remove_listener(&listener));
    assert!(!sim.remove_listener(&listener));

    sim.schedule_call(|| {}, 1).unwrap();
    sim.run().unwrap();
    assert!(log.is_empty());
}

// ============================================================================
// Stack trace mode
// ============================================================================

#[test]
fn test_event_stack_trace_only_in_stack_trace_mode() {
    let sim = Simulation::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (s, v) = (sim.clone(), seen.clone());
    sim.schedule_call(move || v.lock().unwrap().push(s.event_stack_trace().is_some()), 1)
        .unwrap();
    sim.set_stack_trace_mode(true);
    let (s, v) = (sim.clone(), seen.clone());
    sim.schedule_call(move || v.lock().unwrap().push(s.event_stack_trace().is_some()), 2)
        .unwrap();

    sim.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    assert!(sim.event_stack_trace().is_none());
}

// ============================================================================
// Name table
// ============================================================================

#[derive(Debug, PartialEq)]
struct Widget(u32);

#[derive(Debug, PartialEq)]
struct Gadget(u32);

#[test]
fn test_names_are_unique_per_type() {
    let sim = Simulation::new();
    sim.register("alpha", Arc::new(Widget(1))).unwrap();
    sim.register("alpha", Arc::new(Gadget(2))).unwrap();
    sim.register("beta", Arc::new(Widget(3))).unwrap();

    match sim.register("alpha", Arc::new(Widget(4))) {
        Err(SimError::IllegalName { name, kind }) => {
            assert_eq!(name, "alpha");
            assert_eq!(kind, "Widget");
        }
        other => panic!("expected IllegalName, got {other:?}"),
    }

    assert_eq!(*sim.get_object::<Widget>("alpha").unwrap(), Widget(1));
    assert_eq!(*sim.get_object::<Gadget>("alpha").unwrap(), Gadget(2));
    assert_eq!(sim.object_names::<Widget>(), vec!["alpha", "beta"]);
    assert!(sim.contains_object::<Gadget>("alpha"));
    assert!(!sim.contains_object::<Gadget>("beta"));

    assert!(sim.unregister::<Widget>("alpha"));
    assert!(!sim.unregister::<Widget>("alpha"));
    assert!(sim.get_object::<Widget>("alpha").is_none());
}
