//! Command surface and shared state for one servo axis.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{MotorSettings, Settings, WatchdogSettings};
use crate::error::{AppResult, RigError};
use crate::hardware::{MotionPort, ProfileKind};
use crate::motor::watchdog::{self, OpMode};
use crate::motor::{CompletionChannel, Direction, MotionState, OpGuard, OpRequest, RigEvent};

const EVENT_CAPACITY: usize = 64;

/// State shared between the command surface and the watchdog task.
pub(crate) struct AxisShared {
    /// Low-level access mutex. Serializes every hardware call so telemetry
    /// reads never interleave with a half-issued motion command.
    pub(crate) port: Mutex<Option<Box<dyn MotionPort>>>,
    state: RwLock<MotionState>,
    pub(crate) guard: OpGuard,
    /// Set by `stop()` while an operation is in flight. The watchdog must
    /// observe it within one poll interval.
    pub(crate) cancelled: AtomicBool,
    /// Whether the canceller's own hardware stop succeeded; becomes the
    /// operation outcome on the cancellation path.
    pub(crate) cancel_success: AtomicBool,
    pub(crate) last_position: AtomicI32,
    events: broadcast::Sender<RigEvent>,
    pub(crate) completions: CompletionChannel,
    pub(crate) motor: MotorSettings,
    pub(crate) watchdog: WatchdogSettings,
}

impl AxisShared {
    pub(crate) fn state(&self) -> MotionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => **poisoned.get_ref(),
        }
    }

    pub(crate) fn set_state(&self, next: MotionState) {
        let changed = {
            let mut state = match self.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            debug!(state = %next, "axis state changed");
            self.emit(RigEvent::StateChanged(next));
        }
    }

    /// Broadcast an event; lagging or absent subscribers are fine.
    pub(crate) fn emit(&self, event: RigEvent) {
        let _ = self.events.send(event);
    }
}

/// One servo axis and its motion state machine.
///
/// All commands return immediately; completion of an accepted motion
/// operation is reported exactly once through [`wait_complete`] and as an
/// `OperationFinished` event.
///
/// [`wait_complete`]: MotorAxis::wait_complete
pub struct MotorAxis {
    shared: Arc<AxisShared>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl MotorAxis {
    pub fn new(settings: &Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(AxisShared {
                port: Mutex::new(None),
                state: RwLock::new(MotionState::Off),
                guard: OpGuard::new(),
                cancelled: AtomicBool::new(false),
                cancel_success: AtomicBool::new(false),
                last_position: AtomicI32::new(0),
                events,
                completions: CompletionChannel::new(),
                motor: settings.motor.clone(),
                watchdog: settings.watchdog.clone(),
            }),
            watchdog_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MotionState {
        self.shared.state()
    }

    /// Subscribe to state and telemetry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RigEvent> {
        self.shared.events.subscribe()
    }

    /// Await the outcome of the in-flight operation. Synchronous-style
    /// wrapper used by the console worker layer.
    pub async fn wait_complete(&self) -> Option<bool> {
        self.shared.completions.wait().await
    }

    /// Most recent known position, without touching the hardware.
    pub fn last_position(&self) -> i32 {
        self.shared.last_position.load(Ordering::Acquire)
    }

    /// Attach a hardware port and bring the drive up.
    pub async fn connect(&self, port: Box<dyn MotionPort>) -> AppResult<()> {
        if self.state().is_connected() {
            return Err(RigError::Connect("axis already connected".to_string()));
        }
        let mut slot = self.shared.port.lock().await;
        *slot = Some(port);
        let port = match slot.as_mut() {
            Some(port) => port,
            None => return Err(RigError::NotConnected),
        };

        let brought_up: AppResult<i32> = async {
            port.clear_faults().await?;
            port.set_enabled().await?;
            Ok(port.position().await?)
        }
        .await;
        match brought_up {
            Ok(position) => {
                drop(slot);
                self.shared
                    .last_position
                    .store(position, Ordering::Release);
                self.shared.set_state(MotionState::Idle);
                self.shared.emit(RigEvent::PositionChanged(position));
                info!(position, "axis connected");
                Ok(())
            }
            Err(err) => {
                // Leave nothing half-attached.
                *slot = None;
                error!(%err, "axis bring-up failed");
                Err(err)
            }
        }
    }

    /// Move to an absolute position in encoder counts.
    ///
    /// Velocity zero in the request is a halt, as in [`jog`].
    ///
    /// [`jog`]: MotorAxis::jog
    pub async fn move_absolute(&self, target: i32, request: OpRequest) -> AppResult<()> {
        if request.velocity == 0 {
            debug!("zero-velocity move treated as halt request");
            return self.stop().await;
        }
        self.begin_operation(request, OpMode::Position { target }, move |port, request| {
            Box::pin(async move {
                port.activate_profile(ProfileKind::Position).await?;
                port.set_position_profile(
                    request.velocity,
                    request.acceleration,
                    request.deceleration,
                )
                .await?;
                port.set_enabled().await?;
                port.move_to_position(target).await?;
                Ok(())
            })
        })
        .await?;
        info!(target, stall = request.stall, "absolute move started");
        Ok(())
    }

    /// Jog at constant speed, optionally bounded by `request.timeout`.
    pub async fn jog(&self, direction: Direction, request: OpRequest) -> AppResult<()> {
        if request.velocity == 0 {
            debug!("zero-velocity jog treated as halt request");
            return self.stop().await;
        }
        let signed = direction.signum() * request.velocity as i32;
        self.begin_operation(request, OpMode::Velocity, move |port, request| {
            Box::pin(async move {
                port.activate_profile(ProfileKind::Velocity).await?;
                port.set_velocity_profile(request.acceleration, request.deceleration)
                    .await?;
                port.set_enabled().await?;
                port.move_with_velocity(signed).await?;
                Ok(())
            })
        })
        .await?;
        info!(
            velocity = signed,
            stall = request.stall,
            timeout = ?request.timeout,
            "jog started"
        );
        Ok(())
    }

    /// Halt the axis. The only cancellation primitive; safe in any state and
    /// idempotent. With no operation in flight this changes state but emits
    /// no completion notification.
    pub async fn stop(&self) -> AppResult<()> {
        if !self.state().is_connected() {
            return Ok(());
        }

        if self.shared.guard.is_held() {
            // An operation is in flight: issue the stall release here and
            // hand the outcome to the watchdog via the cancellation flags.
            let released = self.stall_release().await;
            self.shared
                .cancel_success
                .store(released.is_ok(), Ordering::Release);
            self.shared.cancelled.store(true, Ordering::Release);
            info!(clean = released.is_ok(), "in-flight operation cancelled");
            return released;
        }

        self.stall_release().await?;
        self.refresh_position().await;
        self.shared.set_state(MotionState::Idle);
        Ok(())
    }

    /// Define the current position as origin 0.
    pub async fn home(&self) -> AppResult<()> {
        if !self.state().is_connected() {
            return Err(RigError::NotConnected);
        }
        if !self.shared.guard.try_acquire() {
            return Err(RigError::Busy);
        }

        let homed: AppResult<()> = async {
            // Any residual motion must be stalled out before the origin is
            // redefined.
            self.stall_release().await?;
            let mut slot = self.shared.port.lock().await;
            let port = slot.as_mut().ok_or(RigError::NotConnected)?;
            port.clear_faults().await?;
            port.activate_profile(ProfileKind::Homing).await?;
            port.set_enabled().await?;
            port.define_position(0).await?;
            Ok(())
        }
        .await;
        self.shared.guard.release();

        match homed {
            Ok(()) => {
                self.shared.last_position.store(0, Ordering::Release);
                self.shared.set_state(MotionState::Idle);
                self.shared.emit(RigEvent::PositionChanged(0));
                info!("axis homed, origin defined");
                Ok(())
            }
            Err(err) => {
                error!(%err, "homing failed");
                self.shared.set_state(MotionState::Error);
                self.shared.emit(RigEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Stop any in-flight operation, shut the drive down and detach the
    /// port.
    pub async fn disconnect(&self) -> AppResult<()> {
        if !self.state().is_connected() {
            return Ok(());
        }
        if self.shared.guard.is_held() {
            if let Err(err) = self.stop().await {
                warn!(%err, "hardware stop during disconnect failed");
            }
            // Consume the cancelled operation's outcome so the watchdog is
            // done with the port before we tear it down.
            let _ = self.shared.completions.wait().await;
        }
        if let Some(task) = self.watchdog_task.lock().await.take() {
            let _ = task.await;
        }

        let mut slot = self.shared.port.lock().await;
        if let Some(port) = slot.as_mut() {
            if let Err(err) = port.set_disabled().await {
                warn!(%err, "drive disable during disconnect failed");
            }
            if let Err(err) = port.disconnect().await {
                warn!(%err, "port close failed");
            }
        }
        *slot = None;
        drop(slot);
        self.shared.set_state(MotionState::Off);
        info!("axis disconnected");
        Ok(())
    }

    /// Actual position. Telemetry reads never fail the caller: on a
    /// hardware error this logs and returns 0.
    pub async fn position(&self) -> i32 {
        let value = self.read_telemetry("position", |port| Box::pin(port.position())).await;
        self.shared.last_position.store(value, Ordering::Release);
        self.shared.emit(RigEvent::PositionChanged(value));
        value
    }

    /// Actual velocity in rpm. Logs and returns 0 on a hardware error.
    pub async fn velocity(&self) -> i32 {
        let value = self.read_telemetry("velocity", |port| Box::pin(port.velocity())).await;
        self.shared.emit(RigEvent::VelocityChanged(value));
        value
    }

    /// Actual current in mA. Logs and returns 0 on a hardware error.
    pub async fn actual_current(&self) -> i16 {
        let value = self
            .read_telemetry("current", |port| Box::pin(port.actual_current()))
            .await;
        self.shared.emit(RigEvent::CurrentChanged(value));
        value
    }

    /// Common prologue and launch for both motion operations: guard
    /// acquisition, channel drain, hardware kick-off, watchdog spawn.
    async fn begin_operation<F>(
        &self,
        request: OpRequest,
        mode: OpMode,
        kick_off: F,
    ) -> AppResult<()>
    where
        F: for<'a> FnOnce(
            &'a mut Box<dyn MotionPort>,
            OpRequest,
        ) -> futures::future::BoxFuture<'a, AppResult<()>>,
    {
        if !self.state().is_connected() {
            return Err(RigError::NotConnected);
        }
        if self.shared.guard.is_held() {
            return Err(RigError::Busy);
        }
        // Cleared before the guard is taken: a `stop()` that observes the
        // guard held always runs after this point, so its cancellation flags
        // survive to the watchdog.
        self.shared.cancelled.store(false, Ordering::Release);
        self.shared.cancel_success.store(false, Ordering::Release);
        if !self.shared.guard.try_acquire() {
            return Err(RigError::Busy);
        }

        self.shared.completions.drain().await;

        let issued: AppResult<()> = async {
            let mut slot = self.shared.port.lock().await;
            let port = slot.as_mut().ok_or(RigError::NotConnected)?;
            port.clear_faults().await?;
            kick_off(port, request).await?;
            Ok(())
        }
        .await;
        if let Err(err) = issued {
            self.shared.guard.release();
            error!(%err, "operation kick-off failed");
            self.shared.set_state(MotionState::Error);
            self.shared.emit(RigEvent::Error(err.to_string()));
            return Err(err);
        }

        self.shared.set_state(MotionState::Running);
        let task = watchdog::spawn(Arc::clone(&self.shared), mode, request.timeout);
        if let Some(stale) = self.watchdog_task.lock().await.replace(task) {
            // Previous watchdog already released the guard, so it is done or
            // about to be; awaiting it would be redundant.
            drop(stale);
        }
        Ok(())
    }

    /// Quick-stop followed by drive disable, the "stall release" sequence.
    async fn stall_release(&self) -> AppResult<()> {
        let mut slot = self.shared.port.lock().await;
        let port = slot.as_mut().ok_or(RigError::NotConnected)?;
        port.set_quick_stop().await?;
        port.set_disabled().await?;
        Ok(())
    }

    async fn refresh_position(&self) {
        let mut slot = self.shared.port.lock().await;
        if let Some(port) = slot.as_mut() {
            match port.position().await {
                Ok(position) => {
                    self.shared
                        .last_position
                        .store(position, Ordering::Release);
                    self.shared.emit(RigEvent::PositionChanged(position));
                }
                Err(err) => warn!(%err, "position refresh failed"),
            }
        }
    }

    async fn read_telemetry<T, F>(&self, what: &'static str, read: F) -> T
    where
        T: Default,
        F: for<'a> FnOnce(
            &'a mut (dyn MotionPort + 'static),
        ) -> futures::future::BoxFuture<'a, crate::hardware::HwResult<T>>,
    {
        let mut slot = self.shared.port.lock().await;
        let port = match slot.as_mut() {
            Some(port) => port,
            None => {
                warn!(what, "telemetry read while disconnected");
                return T::default();
            }
        };
        match read(port.as_mut()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(what, %err, "telemetry read failed");
                T::default()
            }
        }
    }
}
