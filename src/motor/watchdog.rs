//! Per-operation termination detection.
//!
//! One watchdog task is spawned for every accepted motion operation. It
//! decides when the motion has finished and with what outcome, then runs the
//! epilogue that makes the protocol safe: safety stop (unless the canceller
//! already stopped the hardware), cached-position refresh, guard release and
//! exactly one completion notification, in that order.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::hardware::{
    statusword_quick_stop, DeviceState, HardwareError, HwResult, MotionPort, ProfileKind,
};
use crate::motor::axis::AxisShared;
use crate::motor::{MotionState, RigEvent};

/// What kind of motion the watchdog is supervising.
#[derive(Clone, Copy, Debug)]
pub(crate) enum OpMode {
    Position { target: i32 },
    Velocity,
}

/// One poll's worth of hardware status.
struct Observation {
    position: i32,
    velocity: i32,
    current_ma: i16,
    quick_stop_flag: bool,
    status_word: u16,
    device_state: DeviceState,
    target_reached: bool,
}

async fn observe(port: &mut (dyn MotionPort + 'static), mode: OpMode) -> HwResult<Observation> {
    Ok(Observation {
        position: port.position().await?,
        velocity: port.velocity().await?,
        current_ma: port.actual_current().await?,
        quick_stop_flag: port.quick_stop_active().await?,
        status_word: port.status_word().await?,
        device_state: port.device_state().await?,
        target_reached: match mode {
            OpMode::Position { .. } => port.target_reached().await?,
            OpMode::Velocity => false,
        },
    })
}

pub(crate) fn spawn(
    shared: Arc<AxisShared>,
    mode: OpMode,
    timeout: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(run(shared, mode, timeout))
}

async fn run(shared: Arc<AxisShared>, mode: OpMode, timeout: Option<Duration>) {
    let cfg = shared.watchdog.clone();
    let current_limit = shared.motor.current_limit_ma;
    let position_window = shared.motor.position_window;

    // Let the drive actually start moving before judging it.
    tokio::time::sleep(cfg.settle_delay).await;
    let started = Instant::now();

    let mut externally_stopped = false;
    let mut mismatch_warned = false;
    let mut peak_current_ma: i16 = 0;
    let mut last_position = shared.last_position.load(Ordering::Acquire);

    let (mut success, mut message) = loop {
        if shared.cancelled.load(Ordering::Acquire) {
            externally_stopped = true;
            let clean = shared.cancel_success.load(Ordering::Acquire);
            break (clean, "operation cancelled by stop".to_string());
        }

        if let Some(bound) = timeout {
            if started.elapsed() >= bound {
                break match mode {
                    // Time-controlled jogs complete by timeout.
                    OpMode::Velocity => {
                        (true, "timed operation ran to its bound".to_string())
                    }
                    OpMode::Position { target }
                        if (last_position - target).abs() <= position_window =>
                    {
                        (true, format!("deadline hit inside the window of target {target}"))
                    }
                    OpMode::Position { target } => (
                        false,
                        format!(
                            "timed out {} counts short of target {target}",
                            (last_position - target).abs()
                        ),
                    ),
                };
            }
        }

        let obs = {
            let mut slot = shared.port.lock().await;
            match slot.as_mut() {
                Some(port) => observe(port.as_mut(), mode).await,
                None => Err(HardwareError::new(0, "port detached during operation")),
            }
        };
        let obs = match obs {
            Ok(obs) => obs,
            Err(err) => {
                // The loop must never leave the guard held; a failed read
                // fails the operation instead.
                error!(%err, "watchdog observation failed");
                break (false, format!("hardware fault while polling: {err}"));
            }
        };
        peak_current_ma = peak_current_ma.max(obs.current_ma.abs());
        last_position = obs.position;

        if obs.current_ma.abs() > current_limit {
            break match mode {
                OpMode::Position { target } if (obs.position - target).abs() <= position_window => {
                    // Pushing against the stop at the target counts as
                    // arrival.
                    (true, "current excess inside target window".to_string())
                }
                _ => (
                    false,
                    format!(
                        "current excess: {} mA at position {}",
                        obs.current_ma, obs.position
                    ),
                ),
            };
        }

        if obs.device_state == DeviceState::Fault {
            break (false, "drive dropped to the fault state".to_string());
        }

        let decoded = statusword_quick_stop(obs.status_word);
        if obs.quick_stop_flag != decoded && !mismatch_warned {
            warn!(
                flag = obs.quick_stop_flag,
                decoded,
                status_word = format_args!("{:#06x}", obs.status_word),
                "quick-stop status sources disagree"
            );
            shared.set_state(MotionState::Warning);
            mismatch_warned = true;
        }

        let quick_stopped = obs.quick_stop_flag
            || decoded
            || obs.device_state == DeviceState::QuickStop;
        if quick_stopped {
            break (true, "quick-stop engaged".to_string());
        }
        let settled = started.elapsed() >= cfg.current_wait
            && (obs.current_ma.abs() <= cfg.idle_current_ma
                || obs.velocity.abs() <= cfg.idle_velocity_rpm);
        if settled {
            break (true, "drive settled to idle".to_string());
        }

        if let OpMode::Position { target } = mode {
            if obs.target_reached {
                break (true, format!("target {target} reached"));
            }
        }

        tokio::time::sleep(cfg.poll_interval).await;
    };

    // A completion faster than the configured minimum is a misfire, whatever
    // the exit path said.
    if success && started.elapsed() < cfg.min_op_duration {
        warn!(
            elapsed = ?started.elapsed(),
            minimum = ?cfg.min_op_duration,
            "operation finished suspiciously fast, flagging as failed"
        );
        success = false;
        message = format!("finished before minimum duration ({message})");
    }

    if !externally_stopped {
        let kind = match mode {
            OpMode::Position { .. } => ProfileKind::Position,
            OpMode::Velocity => ProfileKind::Velocity,
        };
        let mut slot = shared.port.lock().await;
        if let Some(port) = slot.as_mut() {
            if let Err(err) = port.halt(kind).await {
                warn!(%err, "safety halt failed");
            }
        }
    }

    // Refresh the cache before notifying so a waiting caller observes
    // consistent state.
    {
        let mut slot = shared.port.lock().await;
        if let Some(port) = slot.as_mut() {
            match port.position().await {
                Ok(position) => {
                    shared.last_position.store(position, Ordering::Release);
                    shared.emit(RigEvent::PositionChanged(position));
                }
                Err(err) => warn!(%err, "final position refresh failed"),
            }
        }
    }

    if success {
        info!(peak_current_ma, %message, "operation finished");
        shared.set_state(MotionState::Idle);
    } else {
        error!(peak_current_ma, %message, "operation failed");
        shared.set_state(MotionState::Error);
        shared.emit(RigEvent::Error(message.clone()));
    }
    shared.guard.release();
    shared.completions.push(success);
    shared.emit(RigEvent::OperationFinished { success, message });
    debug!("watchdog exit");
}
