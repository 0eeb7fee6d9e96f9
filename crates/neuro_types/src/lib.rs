//! Shared types for the neural acquisition system
//!
//! This crate holds the data model that every other crate speaks: controller variants,
//! channel addressing, TTL and stimulation bitsets, spike classification, hoop
//! definitions, and the configuration structs that make up a recording session.

pub mod config;
pub mod data;
pub mod session;
pub mod spike;
pub mod variant;

pub use config::*;
pub use data::*;
pub use session::*;
pub use spike::*;
pub use variant::*;

use thiserror::Error;

/// Errors raised while validating shared configuration and addressing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unsupported stream count {requested} for {variant} (maximum {max})")]
    UnsupportedStreamCount {
        variant: ControllerVariant,
        requested: usize,
        max: usize,
    },

    #[error("Channel {0} is not part of this session")]
    UnknownChannel(StreamChannelAddress),
}
