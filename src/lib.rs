//! Core library for the rust_rig application.
//!
//! This library contains the motion-control state machine, the hardware
//! access abstraction with its deterministic simulator, and the serial
//! scale poller for the rig. It is used by the `rust_rig` binary and by
//! the integration tests.

pub mod config;
pub mod console;
pub mod error;
pub mod hardware;
pub mod motor;
pub mod scale;
