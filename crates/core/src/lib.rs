//! `bulwark-core`: foundation types shared by every bulwark crate.
//!
//! This crate contains **pure** primitives (no I/O): identifiers, the clock
//! abstraction, and the error taxonomy used to classify upstream faults.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{chrono_duration, Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ErrorKind, ParseIdError, UpstreamError};
pub use id::{CallerId, CorrelationId, JobId};
