//! Hardware access layer for the motion controller.
//!
//! The rig core consumes motion hardware through the [`MotionPort`] trait and
//! never talks to a vendor library directly. Two implementations exist:
//!
//! - [`sim::SimAxis`]: a deterministic simulator used by the default build
//!   and by the test suite.
//! - `epos::EposPort` (feature `vendor_epos`): the real vendor command
//!   library binding.
//!
//! Every trait method returns `Result<_, HardwareError>`. Vendor error codes
//! are mapped at this boundary; a failed call is fatal to the current
//! operation but never to the process.

pub mod registry;
pub mod sim;

#[cfg(feature = "vendor_epos")]
pub mod epos;

use async_trait::async_trait;
use thiserror::Error;

/// A vendor call returned a non-success code.
///
/// `code` is the raw vendor error code; `message` is the vendor text (or our
/// own description for simulated faults).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hardware error 0x{code:08X}: {message}")]
pub struct HardwareError {
    pub code: u32,
    pub message: String,
}

impl HardwareError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result alias for the hardware boundary.
pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Vendor operating modes activated before issuing motion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileKind {
    /// Absolute positioning (profile position mode).
    Position,
    /// Continuous-speed jogging (profile velocity mode).
    Velocity,
    /// Homing mode, used to redefine the reference origin.
    Homing,
}

/// Decoded device state code.
///
/// The vendor reports the drive state as a small integer; the only value the
/// watchdog cares about is the quick-stop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Disabled,
    Enabled,
    QuickStop,
    Fault,
    Other(u16),
}

impl DeviceState {
    /// Vendor state code for the quick-stop state.
    pub const QUICK_STOP_CODE: u16 = 0x0002;

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DeviceState::Disabled,
            0x0001 => DeviceState::Enabled,
            Self::QUICK_STOP_CODE => DeviceState::QuickStop,
            0x0003 => DeviceState::Fault,
            other => DeviceState::Other(other),
        }
    }
}

/// Statusword bit pattern for the quick-stop state: `xxxx xxxx x00x 0111`.
///
/// Low nibble must read `0111` (ready-to-switch-on, switched-on, operation
/// enabled) while bits 5..=6 (quick-stop, switch-on-disabled) are both clear.
pub fn statusword_quick_stop(status: u16) -> bool {
    (status & 0x0F) == 0b0111 && ((status >> 5) & 0x03) == 0b00
}

/// Statusword bit 10: target reached within tolerance.
pub fn statusword_target_reached(status: u16) -> bool {
    status & (1 << 10) != 0
}

/// Opaque interface to one motion-control axis.
///
/// Calls may block briefly on driver I/O and can fail with a vendor error
/// code. The caller is responsible for serializing access to one port: the
/// axis holds the port behind a single low-level mutex so that telemetry
/// reads never interleave with a half-issued motion command.
#[async_trait]
pub trait MotionPort: Send {
    /// Clear latched faults on the drive.
    async fn clear_faults(&mut self) -> HwResult<()>;

    /// Actual position in device units (encoder counts).
    async fn position(&mut self) -> HwResult<i32>;

    /// Actual velocity in rpm.
    async fn velocity(&mut self) -> HwResult<i32>;

    /// Actual current in mA (signed).
    async fn actual_current(&mut self) -> HwResult<i16>;

    /// Activate a vendor operating mode.
    async fn activate_profile(&mut self, kind: ProfileKind) -> HwResult<()>;

    /// Enable the power stage.
    async fn set_enabled(&mut self) -> HwResult<()>;

    /// Disable the power stage.
    async fn set_disabled(&mut self) -> HwResult<()>;

    /// Configure the position profile (velocity, acceleration, deceleration).
    async fn set_position_profile(&mut self, velocity: u32, accel: u32, decel: u32)
        -> HwResult<()>;

    /// Configure the velocity profile (acceleration, deceleration).
    async fn set_velocity_profile(&mut self, accel: u32, decel: u32) -> HwResult<()>;

    /// Start an absolute move to `position`.
    async fn move_to_position(&mut self, position: i32) -> HwResult<()>;

    /// Start a continuous move at `velocity` rpm (sign = direction).
    async fn move_with_velocity(&mut self, velocity: i32) -> HwResult<()>;

    /// Halt the in-flight movement of the given profile kind.
    async fn halt(&mut self, kind: ProfileKind) -> HwResult<()>;

    /// Target-reached flag (statusword bit 10, as reported by the vendor).
    async fn target_reached(&mut self) -> HwResult<bool>;

    /// Dedicated quick-stop status flag.
    async fn quick_stop_active(&mut self) -> HwResult<bool>;

    /// Raw statusword (object 0x6041).
    async fn status_word(&mut self) -> HwResult<u16>;

    /// Decoded drive state.
    async fn device_state(&mut self) -> HwResult<DeviceState>;

    /// Engage the hardware quick-stop.
    async fn set_quick_stop(&mut self) -> HwResult<()>;

    /// Redefine the current position as `position` (homing origin).
    async fn define_position(&mut self, position: i32) -> HwResult<()>;

    /// Release the device handle. Called once on teardown.
    async fn disconnect(&mut self) -> HwResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statusword_quick_stop_decode() {
        // Operation enabled, quick-stop bit clear: 0b0000_0000_0010_0111 is
        // NOT quick-stop (bit 5 set means quick-stop inactive per vendor
        // polarity, encoded in the pattern requiring bits 5..6 == 00).
        assert!(statusword_quick_stop(0b0000_0000_0000_0111));
        assert!(!statusword_quick_stop(0b0000_0000_0010_0111));
        assert!(!statusword_quick_stop(0b0000_0000_0000_0110));
        // High bits are ignored.
        assert!(statusword_quick_stop(0b1000_0100_0000_0111));
    }

    #[test]
    fn test_statusword_target_reached() {
        assert!(statusword_target_reached(1 << 10));
        assert!(!statusword_target_reached(0b0111));
    }

    #[test]
    fn test_device_state_from_code() {
        assert_eq!(DeviceState::from_code(0x0002), DeviceState::QuickStop);
        assert_eq!(DeviceState::from_code(0x0003), DeviceState::Fault);
        assert_eq!(DeviceState::from_code(0x00FF), DeviceState::Other(0x00FF));
    }

    #[test]
    fn test_hardware_error_display() {
        let err = HardwareError::new(0x0600_0041, "object does not exist");
        assert_eq!(
            err.to_string(),
            "hardware error 0x06000041: object does not exist"
        );
    }
}
