//! Clock, configuration and error types shared by the whole kernel

pub mod clock;
pub mod config;
pub mod error;

pub use clock::Clock;
pub use config::{SimulationConfig, TraceFormat, TraceSetConfig};
pub use error::SimError;
