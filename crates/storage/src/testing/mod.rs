//! Testing utilities for crash recovery
//!
//! - **Crash Harness**: a backend wrapper that fails operations on a schedule,
//!   used to interrupt a flush at every possible point

mod crash_harness;

pub use crash_harness::{CrashSchedule, FailableStorage};
