//! Deterministic motion-hardware simulator.
//!
//! `SimAxis` implements [`MotionPort`] without any vendor library. It serves
//! two purposes: the default build runs the whole rig against it, and the
//! test suite scripts it to reproduce the exact hardware conditions the
//! watchdog protocol must handle (current excess, quick-stop, spurious
//! target-reached, dead air).
//!
//! The axis half is handed to `MotorAxis` as a `Box<dyn MotionPort>`; the
//! [`SimHandle`] half stays with the caller for scripting and inspection.
//! By default the simulator runs simple kinematics (position creeps toward
//! the commanded target, jogs integrate velocity). Tests that need full
//! control call [`SimHandle::set_manual`] to freeze the kinematics and drive
//! every status flag by hand.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::registry::{DeviceDescriptor, DeviceRegistry};
use super::{DeviceState, HardwareError, HwResult, MotionPort, ProfileKind};

/// Commands recorded by the simulator, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimCall {
    ClearFaults,
    ActivateProfile(ProfileKind),
    SetEnabled,
    SetDisabled,
    SetPositionProfile { velocity: u32, accel: u32, decel: u32 },
    SetVelocityProfile { accel: u32, decel: u32 },
    MoveToPosition(i32),
    MoveWithVelocity(i32),
    Halt(ProfileKind),
    SetQuickStop,
    DefinePosition(i32),
    Disconnect,
}

/// Statusword while operation-enabled, quick-stop inactive.
const OPERATIONAL_STATUS: u16 = 0b0000_0000_0010_0111;

/// Statusword while the quick-stop state is active.
const QUICK_STOP_STATUS: u16 = 0b0000_0000_0000_0111;

#[derive(Debug)]
struct SimState {
    position: i32,
    velocity: i32,
    current_ma: i16,
    target: Option<i32>,
    commanded_velocity: i32,
    profile_velocity: u32,
    target_reached: bool,
    quick_stop_flag: bool,
    status_word: u16,
    device_state: DeviceState,
    enabled: bool,
    manual: bool,
    fail_queue: VecDeque<HardwareError>,
    journal: Vec<SimCall>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            position: 0,
            velocity: 0,
            current_ma: 40,
            target: None,
            commanded_velocity: 0,
            profile_velocity: 640,
            target_reached: false,
            quick_stop_flag: false,
            status_word: OPERATIONAL_STATUS,
            device_state: DeviceState::Enabled,
            enabled: false,
            manual: false,
            fail_queue: VecDeque::new(),
            journal: Vec::new(),
        }
    }
}

impl SimState {
    /// Advance the built-in kinematics by one observation.
    fn step(&mut self) {
        if self.manual || !self.enabled {
            return;
        }
        if let Some(target) = self.target {
            let remaining = target - self.position;
            if remaining == 0 {
                self.target_reached = true;
                self.velocity = 0;
                return;
            }
            // Close a quarter of the gap per observation, at least one count.
            let step = remaining / 4;
            let step = if step == 0 { remaining.signum() } else { step };
            self.position += step;
            self.velocity = self.profile_velocity as i32 * remaining.signum();
            if self.position == target {
                self.target_reached = true;
                self.velocity = 0;
            }
        } else if self.commanded_velocity != 0 {
            // Jogging: integrate one tenth of the commanded rpm per poll.
            let step = self.commanded_velocity / 10;
            self.position += if step == 0 {
                self.commanded_velocity.signum()
            } else {
                step
            };
            self.velocity = self.commanded_velocity;
        }
    }

    fn take_fault(&mut self) -> HwResult<()> {
        match self.fail_queue.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Scripting/inspection handle shared with the simulated axis.
#[derive(Clone, Debug)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Freeze or unfreeze the built-in kinematics.
    pub fn set_manual(&self, manual: bool) {
        self.lock().manual = manual;
    }

    pub fn set_position(&self, position: i32) {
        self.lock().position = position;
    }

    pub fn position(&self) -> i32 {
        self.lock().position
    }

    pub fn set_velocity(&self, velocity: i32) {
        self.lock().velocity = velocity;
    }

    pub fn set_current(&self, current_ma: i16) {
        self.lock().current_ma = current_ma;
    }

    pub fn set_target_reached(&self, reached: bool) {
        self.lock().target_reached = reached;
    }

    /// Drive both quick-stop sources coherently.
    pub fn engage_quick_stop(&self) {
        let mut state = self.lock();
        state.quick_stop_flag = true;
        state.status_word = QUICK_STOP_STATUS;
        state.device_state = DeviceState::QuickStop;
    }

    /// Drive only the dedicated flag, leaving the statusword disagreeing.
    pub fn set_quick_stop_flag(&self, engaged: bool) {
        self.lock().quick_stop_flag = engaged;
    }

    pub fn set_status_word(&self, status: u16) {
        self.lock().status_word = status;
    }

    pub fn set_device_state(&self, state: DeviceState) {
        self.lock().device_state = state;
    }

    /// Make the next port call fail with the given vendor error.
    pub fn fail_next_call(&self, err: HardwareError) {
        self.lock().fail_queue.push_back(err);
    }

    /// Commands issued so far, in order.
    pub fn journal(&self) -> Vec<SimCall> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }
}

/// Simulated motion axis.
pub struct SimAxis {
    state: Arc<Mutex<SimState>>,
}

impl SimAxis {
    /// Create an axis/handle pair.
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn command(&self, call: SimCall) -> HwResult<()> {
        let mut state = self.lock();
        state.take_fault()?;
        state.journal.push(call);
        Ok(())
    }
}

/// Enumerate the simulated rig: one axis on a stub USB port.
pub fn enumerate() -> DeviceRegistry {
    DeviceRegistry::new(vec![DeviceDescriptor {
        device_name: "EPOS4".to_string(),
        protocol: "MAXON SERIAL V2".to_string(),
        interface: "USB".to_string(),
        port: "SIM0".to_string(),
        baud_rate: 1_000_000,
        serial_number: 12345,
        node_id: 1,
        sensor_type: 1,
    }])
}

#[async_trait]
impl MotionPort for SimAxis {
    async fn clear_faults(&mut self) -> HwResult<()> {
        self.command(SimCall::ClearFaults)?;
        let mut state = self.lock();
        state.quick_stop_flag = false;
        if matches!(state.device_state, DeviceState::QuickStop | DeviceState::Fault) {
            state.device_state = DeviceState::Disabled;
        }
        Ok(())
    }

    async fn position(&mut self) -> HwResult<i32> {
        let mut state = self.lock();
        state.take_fault()?;
        state.step();
        Ok(state.position)
    }

    async fn velocity(&mut self) -> HwResult<i32> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.velocity)
    }

    async fn actual_current(&mut self) -> HwResult<i16> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.current_ma)
    }

    async fn activate_profile(&mut self, kind: ProfileKind) -> HwResult<()> {
        self.command(SimCall::ActivateProfile(kind))
    }

    async fn set_enabled(&mut self) -> HwResult<()> {
        self.command(SimCall::SetEnabled)?;
        let mut state = self.lock();
        state.enabled = true;
        // Enabling leaves the quick-stop state, as the real drive does.
        state.quick_stop_flag = false;
        state.device_state = DeviceState::Enabled;
        state.status_word = OPERATIONAL_STATUS;
        Ok(())
    }

    async fn set_disabled(&mut self) -> HwResult<()> {
        self.command(SimCall::SetDisabled)?;
        let mut state = self.lock();
        state.enabled = false;
        state.velocity = 0;
        state.commanded_velocity = 0;
        state.target = None;
        Ok(())
    }

    async fn set_position_profile(
        &mut self,
        velocity: u32,
        accel: u32,
        decel: u32,
    ) -> HwResult<()> {
        self.command(SimCall::SetPositionProfile {
            velocity,
            accel,
            decel,
        })?;
        self.lock().profile_velocity = velocity;
        Ok(())
    }

    async fn set_velocity_profile(&mut self, accel: u32, decel: u32) -> HwResult<()> {
        self.command(SimCall::SetVelocityProfile { accel, decel })
    }

    async fn move_to_position(&mut self, position: i32) -> HwResult<()> {
        self.command(SimCall::MoveToPosition(position))?;
        let mut state = self.lock();
        state.target = Some(position);
        state.target_reached = false;
        Ok(())
    }

    async fn move_with_velocity(&mut self, velocity: i32) -> HwResult<()> {
        self.command(SimCall::MoveWithVelocity(velocity))?;
        let mut state = self.lock();
        state.target = None;
        state.commanded_velocity = velocity;
        Ok(())
    }

    async fn halt(&mut self, kind: ProfileKind) -> HwResult<()> {
        self.command(SimCall::Halt(kind))?;
        let mut state = self.lock();
        state.commanded_velocity = 0;
        state.velocity = 0;
        state.target = None;
        Ok(())
    }

    async fn target_reached(&mut self) -> HwResult<bool> {
        let mut state = self.lock();
        state.take_fault()?;
        state.step();
        Ok(state.target_reached)
    }

    async fn quick_stop_active(&mut self) -> HwResult<bool> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.quick_stop_flag)
    }

    async fn status_word(&mut self) -> HwResult<u16> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.status_word)
    }

    async fn device_state(&mut self) -> HwResult<DeviceState> {
        let mut state = self.lock();
        state.take_fault()?;
        Ok(state.device_state)
    }

    async fn set_quick_stop(&mut self) -> HwResult<()> {
        self.command(SimCall::SetQuickStop)?;
        let mut state = self.lock();
        state.velocity = 0;
        state.commanded_velocity = 0;
        state.target = None;
        state.quick_stop_flag = true;
        state.status_word = QUICK_STOP_STATUS;
        state.device_state = DeviceState::QuickStop;
        Ok(())
    }

    async fn define_position(&mut self, position: i32) -> HwResult<()> {
        self.command(SimCall::DefinePosition(position))?;
        let mut state = self.lock();
        state.position = position;
        Ok(())
    }

    async fn disconnect(&mut self) -> HwResult<()> {
        self.command(SimCall::Disconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kinematics_reach_target() {
        let (mut axis, _handle) = SimAxis::new();
        axis.set_enabled().await.unwrap();
        axis.move_to_position(100).await.unwrap();

        let mut reached = false;
        for _ in 0..64 {
            if axis.target_reached().await.unwrap() {
                reached = true;
                break;
            }
        }
        assert!(reached);
        assert_eq!(axis.position().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_manual_mode_freezes_kinematics() {
        let (mut axis, handle) = SimAxis::new();
        handle.set_manual(true);
        axis.set_enabled().await.unwrap();
        axis.move_to_position(100).await.unwrap();

        for _ in 0..8 {
            assert!(!axis.target_reached().await.unwrap());
        }
        assert_eq!(axis.position().await.unwrap(), 0);

        handle.set_target_reached(true);
        assert!(axis.target_reached().await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_next_call() {
        let (mut axis, handle) = SimAxis::new();
        handle.fail_next_call(HardwareError::new(0x2000_0001, "port busy"));

        let err = axis.clear_faults().await.unwrap_err();
        assert_eq!(err.code, 0x2000_0001);
        // Subsequent calls succeed again.
        axis.clear_faults().await.unwrap();
        assert_eq!(
            handle.journal(),
            vec![SimCall::ClearFaults],
            "failed call must not be journaled"
        );
    }

    #[tokio::test]
    async fn test_jog_integrates_velocity() {
        let (mut axis, _handle) = SimAxis::new();
        axis.set_enabled().await.unwrap();
        axis.move_with_velocity(-640).await.unwrap();

        let p1 = axis.position().await.unwrap();
        let p2 = axis.position().await.unwrap();
        assert!(p2 < p1);
        assert_eq!(axis.velocity().await.unwrap(), -640);
    }

    #[tokio::test]
    async fn test_enable_releases_quick_stop() {
        let (mut axis, _handle) = SimAxis::new();
        axis.set_quick_stop().await.unwrap();
        assert!(axis.quick_stop_active().await.unwrap());
        assert_eq!(axis.device_state().await.unwrap(), DeviceState::QuickStop);

        axis.clear_faults().await.unwrap();
        assert!(!axis.quick_stop_active().await.unwrap());
        axis.set_enabled().await.unwrap();
        assert_eq!(axis.device_state().await.unwrap(), DeviceState::Enabled);
        assert!(!crate::hardware::statusword_quick_stop(
            axis.status_word().await.unwrap()
        ));
    }

    #[test]
    fn test_sim_enumeration() {
        let registry = enumerate();
        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_serial(12345).is_some());
    }
}
