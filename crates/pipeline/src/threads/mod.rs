//! The long-lived loops of a running pipeline.
//!
//! Each loop owns its half of the rings it touches, checks a shared stop flag between
//! units of work and sleeps for [`POLL_INTERVAL`](crate::sync::POLL_INTERVAL) when there
//! is nothing to do.

mod producer;
mod pump;
mod transformer;
mod trigger;

pub use producer::Producer;
pub use pump::{ReaderPump, ReaderSink};
pub use transformer::Transformer;
pub use trigger::{DiskRecorder, Trigger};
