//! Virtual clock, event queue and run loop

pub mod event;
pub mod event_queue;
pub mod monitor;
pub mod names;
pub mod simulation;

pub use event::{EventKey, SimulationEvent};
pub use monitor::{EventCountMonitor, SimulationMonitor, StopFlagMonitor, TickLimitMonitor};
pub use simulation::Simulation;
