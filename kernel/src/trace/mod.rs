//! Simulation-level tracing: trace sets and the objects that use them

pub mod object;
pub mod trace_set;

pub use object::{ObjectCore, SimObject};
pub use trace_set::{SharedWriter, TraceRecord, TraceSet};
