//! Cooperative tasks backed by OS threads

pub mod thread;

pub use thread::{TaskState, TaskThread};
