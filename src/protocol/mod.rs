//! Wire protocol spoken between a caller-side client and the voice agent.
//!
//! Every frame is a JSON envelope `{ "type": ..., "data": ... }`. The set of
//! tags is closed: anything else is rejected at parse time and dropped by the
//! receiving side.

pub mod audio;
pub mod messages;

pub use audio::{AudioConfig, AudioEncoding};
pub use messages::{Message, StopReason, now_ms};
