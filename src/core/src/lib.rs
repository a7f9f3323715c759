//! kitrace core - foundational types
//!
//! Error type, configuration, endpoint addresses and the event emitter
//! shared by the runtime and the CLI.

pub mod address;
pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use address::{BuildkitAddress, DEFAULT_ADDRESS};
pub use config::ReproConfig;
pub use error::{ReproError, Result};
pub use event::{EventEmitter, ReproEvent};

/// kitrace version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
