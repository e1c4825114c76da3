//! Common Utilities and Types Library
//!
//! This crate provides shared types, the frame codec and the logging sink
//! used across the protocol stack simulator.

pub mod codec;
pub mod logging;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use codec::{CodecError, SequenceNumber};
pub use logging::{LayerLogger, LogLevel, LogSink};
pub use types::*;
pub use utils::*;
