//! Motion state machine for a single servo axis.
//!
//! The [`MotorAxis`] owns the hardware port and enforces the core invariant
//! of the rig: at most one motion operation in flight per axis. Each accepted
//! operation spawns a [`watchdog`] task that decides when the motion has
//! finished and with what outcome. Telemetry and state changes stream out on
//! a broadcast channel; per-operation results arrive on the bounded
//! [`CompletionChannel`].

pub mod axis;
pub mod guard;
pub mod notify;
pub mod state;
pub(crate) mod watchdog;

pub use axis::MotorAxis;
pub use guard::OpGuard;
pub use notify::CompletionChannel;
pub use state::MotionState;

/// Jog direction, mapped to the sign of the commanded velocity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn signum(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Parameters for one motion operation.
///
/// Velocity zero is a halt request, not a zero-speed move; the axis
/// short-circuits through the stop sequence without spawning a watchdog.
#[derive(Clone, Copy, Debug)]
pub struct OpRequest {
    /// Commanded speed magnitude, in rpm.
    pub velocity: u32,
    /// Profile acceleration, in rpm/s.
    pub acceleration: u32,
    /// Profile deceleration, in rpm/s.
    pub deceleration: u32,
    /// Operator stall request, carried through from the command protocol
    /// and recorded for diagnostics; a halt is requested with velocity
    /// zero, not with this flag.
    pub stall: bool,
    /// Operation bound. Expiry completes a jog successfully; a position
    /// move that hits the bound outside the target window fails.
    pub timeout: Option<std::time::Duration>,
}

impl OpRequest {
    /// Request with the configured profile defaults.
    pub fn from_settings(motor: &crate::config::MotorSettings) -> Self {
        Self {
            velocity: motor.operating_speed_rpm,
            acceleration: motor.acceleration,
            deceleration: motor.deceleration,
            stall: false,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stall(mut self, stall: bool) -> Self {
        self.stall = stall;
        self
    }

    pub fn with_velocity(mut self, velocity: u32) -> Self {
        self.velocity = velocity;
        self
    }
}

/// Events broadcast to the operator console and any other subscriber.
#[derive(Clone, Debug)]
pub enum RigEvent {
    StateChanged(MotionState),
    PositionChanged(i32),
    VelocityChanged(i32),
    CurrentChanged(i16),
    OperationFinished { success: bool, message: String },
    Error(String),
}
