//! kitrace runtime - BuildKit client and the push/run reproducer.
//!
//! This crate talks to buildkitd over its control API, builds the two LLB
//! graphs of the reproducer and schedules the overlapping invocations.

#![allow(clippy::result_large_err)]

pub mod client;
pub mod llb;
pub mod progress;
pub mod proto;
pub mod reproducer;
pub mod scheduler;

// Re-export common types
pub use client::{BuildService, Connector, GrpcConnector, StatusStream};
pub use llb::{ExecSpec, Marshaled, Platform, State};
pub use progress::{LogCapture, PlainPrinter, StatusObserver};
pub use reproducer::{
    InvocationReport, ListingObservation, Reproducer, RunOutcome, RunReport, MARKER_DIR,
};
pub use scheduler::Scheduler;

/// kitrace runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
