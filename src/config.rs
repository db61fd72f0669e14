//! Application settings.
//!
//! Settings are loaded from a TOML file plus `RIG_`-prefixed environment
//! variables, with the file optional so the rig runs on built-in defaults.
//! Every numeric default mirrors the values the axis was commissioned with;
//! change them in `rig.toml` rather than here.
//!
//! ```toml
//! [motor]
//! current_limit_ma = 300
//! operating_speed_rpm = 640
//!
//! [watchdog]
//! poll_interval = "100ms"
//! settle_delay = "250ms"
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{AppResult, RigError};

/// Motion profile and abort thresholds for the servo axis.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Abort threshold for the continuous-current watchdog check, in mA.
    pub current_limit_ma: i16,
    /// Profile speed used for absolute moves, in rpm.
    pub operating_speed_rpm: u32,
    /// Profile acceleration, in rpm/s.
    pub acceleration: u32,
    /// Profile deceleration, in rpm/s.
    pub deceleration: u32,
    /// Half-width of the window around the target inside which a current
    /// excess is treated as arrival rather than a stall, in encoder counts.
    pub position_window: i32,
    /// CANopen node id of the axis.
    pub node_id: u16,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            current_limit_ma: 300,
            operating_speed_rpm: 640,
            acceleration: 3000,
            deceleration: 3000,
            position_window: 100,
            node_id: 1,
        }
    }
}

/// Timing knobs for the per-operation watchdog task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    /// Pause between hardware observations.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wait after kicking off an operation before the first observation.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Completions earlier than this after the settle delay are suspect and
    /// reported as failures.
    #[serde(with = "humantime_serde")]
    pub min_op_duration: Duration,
    /// Grace period before current/velocity idleness counts as completion.
    #[serde(with = "humantime_serde")]
    pub current_wait: Duration,
    /// Current at or below this is idle, in mA.
    pub idle_current_ma: i16,
    /// Speed at or below this is idle, in rpm.
    pub idle_velocity_rpm: i32,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(250),
            min_op_duration: Duration::from_millis(250),
            current_wait: Duration::from_secs(2),
            idle_current_ma: 1,
            idle_velocity_rpm: 10,
        }
    }
}

/// Serial scale connection and smoothing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScaleSettings {
    /// Serial device path, e.g. `/dev/ttyACM0`. Empty means autodetect by
    /// USB vendor id.
    pub port: String,
    pub baud_rate: u32,
    /// USB vendor id used for autodetection.
    pub usb_vid: u16,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Window length of the rate-of-change moving average, in samples.
    pub rate_window: usize,
}

impl Default for ScaleSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            usb_vid: 1155,
            poll_interval: Duration::from_millis(500),
            rate_window: 10,
        }
    }
}

/// Top-level settings for the rig.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub motor: MotorSettings,
    pub watchdog: WatchdogSettings,
    pub scale: ScaleSettings,
}

impl Settings {
    /// Load settings from `path` (optional) overlaid with `RIG_*` environment
    /// variables, e.g. `RIG_MOTOR__CURRENT_LIMIT_MA=250`.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("RIG").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.motor.current_limit_ma <= 0 {
            return Err(RigError::Configuration(
                "motor.current_limit_ma must be positive".to_string(),
            ));
        }
        if self.motor.operating_speed_rpm == 0 {
            return Err(RigError::Configuration(
                "motor.operating_speed_rpm must be positive".to_string(),
            ));
        }
        if self.motor.position_window < 0 {
            return Err(RigError::Configuration(
                "motor.position_window must not be negative".to_string(),
            ));
        }
        if self.watchdog.poll_interval.is_zero() {
            return Err(RigError::Configuration(
                "watchdog.poll_interval must be positive".to_string(),
            ));
        }
        if self.scale.rate_window == 0 {
            return Err(RigError::Configuration(
                "scale.rate_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
