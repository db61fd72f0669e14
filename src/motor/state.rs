//! Axis lifecycle states.

use std::fmt;

/// State of one servo axis.
///
/// Only the command surface and the watchdog mutate this; everyone else
/// observes it through `MotorAxis::state` or `RigEvent::StateChanged`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MotionState {
    /// No hardware attached.
    #[default]
    Off,
    /// Connected, no operation in flight.
    Idle,
    /// An operation is in flight and its watchdog is alive.
    Running,
    /// Running, but a diagnostic anomaly was observed (quick-stop source
    /// mismatch). Cleared by the next operation outcome.
    Warning,
    /// The last operation failed. Cleared by the next accepted command.
    Error,
}

impl MotionState {
    /// True while a watchdog owns the axis.
    pub fn is_busy(self) -> bool {
        matches!(self, MotionState::Running | MotionState::Warning)
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, MotionState::Off)
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MotionState::Off => "off",
            MotionState::Idle => "idle",
            MotionState::Running => "running",
            MotionState::Warning => "warning",
            MotionState::Error => "error",
        };
        write!(f, "{name}")
    }
}
