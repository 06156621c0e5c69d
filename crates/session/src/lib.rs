//! BrainChat Session
//!
//! Interactive chat loop on top of the engine: one loaded model, one worker
//! pool, one reply per input line.

pub mod session;

pub use session::{ChatSession, SessionSummary, EXIT_COMMAND};
