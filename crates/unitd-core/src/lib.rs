//! unitd core - platform-independent supervision types
//!
//! This crate provides the launch configuration, readiness strategies,
//! lifecycle states, handshake wire format and error types shared by the
//! Unix process layer and the supervision engine.

pub mod command;
pub mod config;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod process;
pub mod readiness;

pub use command::*;
pub use config::*;
pub use definition::*;
pub use endpoint::*;
pub use error::*;
pub use handshake::*;
pub use process::*;
pub use readiness::*;
