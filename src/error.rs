//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failures the rig can produce, from
//! configuration issues to vendor hardware error codes.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps errors from the `config` crate (file parsing,
//!   format issues).
//! - **`Configuration`**: semantic errors in the configuration. Values that
//!   parse but are logically wrong (zero poll interval, negative limits) are
//!   caught during validation.
//! - **`Io`**: wraps `std::io::Error` for file and port I/O.
//! - **`Connect`**: device enumeration or open failed; the axis stays OFF.
//! - **`Busy`**: a motion command was issued while another operation was in
//!   flight on the same axis. Surfaced immediately, no state change.
//! - **`NotConnected`**: a command was issued before `connect()`.
//! - **`Hardware`**: a vendor call returned a non-success code. Fatal to the
//!   current operation (safety stop + ERROR state), never fatal to the
//!   process.
//! - **`Scale`**: serial scale communication or frame decoding failure.
//!
//! All hardware/driver failures are converted to typed results at the
//! [`crate::hardware::MotionPort`] boundary; no vendor error code crosses it
//! as anything other than a `HardwareError`.

use thiserror::Error;

use crate::hardware::HardwareError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device connect failed: {0}")]
    Connect(String),

    #[error("Device is busy: an operation is already in flight")]
    Busy,

    #[error("No device bound: connect() must succeed first")]
    NotConnected,

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Scale error: {0}")]
    Scale(String),

    #[error("Serial support not enabled. Rebuild with --features scale_serial")]
    SerialFeatureDisabled,

    #[error("Vendor EPOS support not enabled. Rebuild with --features vendor_epos")]
    VendorFeatureDisabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::Connect("no device with serial 12345".to_string());
        assert_eq!(
            err.to_string(),
            "Device connect failed: no device with serial 12345"
        );
    }

    #[test]
    fn test_hardware_error_passthrough() {
        let err = RigError::from(HardwareError::new(0x1000_0001, "generic error"));
        assert!(err.to_string().contains("0x10000001"));
    }

    #[test]
    fn test_busy_is_not_fatal_looking() {
        let err = RigError::Busy;
        assert!(err.to_string().contains("in flight"));
    }
}
