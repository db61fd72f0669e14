//! Vendor EPOS command-library backend.
//!
//! Binds the proprietary `EposCmd64` shared library and adapts it to
//! [`MotionPort`]. Only compiled with the `vendor_epos` feature since the
//! library is not redistributable; every other build runs against
//! [`super::sim`].
//!
//! All vendor calls are short blocking FFI; they run inline on the polling
//! cadence rather than through `spawn_blocking`.

#![allow(unsafe_code)]

use std::ffi::{c_char, c_void, CStr, CString};

use async_trait::async_trait;

use super::registry::{DeviceDescriptor, DeviceRegistry};
use super::{DeviceState, HardwareError, HwResult, MotionPort, ProfileKind};

type KeyHandle = *mut c_void;

/// CANopen object: statusword.
const OBJ_STATUSWORD: (u16, u8, u32) = (0x6041, 0x00, 2);
/// CANopen object: identity, serial number.
const OBJ_SERIAL_NUMBER: (u16, u8, u32) = (0x1018, 0x04, 4);

const SELECTION_BUF: usize = 100;
const PROTOCOL_TIMEOUT_MS: u32 = 500;

#[link(name = "EposCmd64")]
extern "C" {
    fn VCS_OpenDevice(
        device_name: *const c_char,
        protocol_stack_name: *const c_char,
        interface_name: *const c_char,
        port_name: *const c_char,
        error_code: *mut u32,
    ) -> KeyHandle;
    fn VCS_CloseDevice(handle: KeyHandle, error_code: *mut u32) -> u32;
    fn VCS_SetProtocolStackSettings(
        handle: KeyHandle,
        baudrate: u32,
        timeout_ms: u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetErrorInfo(error_code: u32, text: *mut c_char, size: u16) -> u32;

    fn VCS_ClearFault(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;
    fn VCS_SetEnableState(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;
    fn VCS_SetDisableState(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;
    fn VCS_SetQuickStopState(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;

    fn VCS_GetPositionIs(
        handle: KeyHandle,
        node_id: u16,
        position: *mut i32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetVelocityIs(
        handle: KeyHandle,
        node_id: u16,
        velocity: *mut i32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetCurrentIs(
        handle: KeyHandle,
        node_id: u16,
        current: *mut i16,
        error_code: *mut u32,
    ) -> u32;

    fn VCS_ActivateProfilePositionMode(
        handle: KeyHandle,
        node_id: u16,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_ActivateProfileVelocityMode(
        handle: KeyHandle,
        node_id: u16,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_ActivateHomingMode(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;

    fn VCS_SetPositionProfile(
        handle: KeyHandle,
        node_id: u16,
        velocity: u32,
        acceleration: u32,
        deceleration: u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_SetVelocityProfile(
        handle: KeyHandle,
        node_id: u16,
        acceleration: u32,
        deceleration: u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_MoveToPosition(
        handle: KeyHandle,
        node_id: u16,
        target_position: i32,
        absolute: u32,
        immediately: u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_MoveWithVelocity(
        handle: KeyHandle,
        node_id: u16,
        target_velocity: i32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_HaltPositionMovement(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;
    fn VCS_HaltVelocityMovement(handle: KeyHandle, node_id: u16, error_code: *mut u32) -> u32;

    fn VCS_GetMovementState(
        handle: KeyHandle,
        node_id: u16,
        target_reached: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetQuickStopState(
        handle: KeyHandle,
        node_id: u16,
        quick_stop_active: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetState(
        handle: KeyHandle,
        node_id: u16,
        state: *mut u16,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_DefinePosition(
        handle: KeyHandle,
        node_id: u16,
        position: i32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetObject(
        handle: KeyHandle,
        node_id: u16,
        index: u16,
        sub_index: u8,
        data: *mut c_void,
        bytes_to_read: u32,
        bytes_read: *mut u32,
        error_code: *mut u32,
    ) -> u32;

    fn VCS_GetDeviceNameSelection(
        start_of_selection: u32,
        name: *mut c_char,
        size: u16,
        end_of_selection: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetProtocolStackNameSelection(
        device_name: *const c_char,
        start_of_selection: u32,
        name: *mut c_char,
        size: u16,
        end_of_selection: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetInterfaceNameSelection(
        device_name: *const c_char,
        protocol_stack_name: *const c_char,
        start_of_selection: u32,
        name: *mut c_char,
        size: u16,
        end_of_selection: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetPortNameSelection(
        device_name: *const c_char,
        protocol_stack_name: *const c_char,
        interface_name: *const c_char,
        start_of_selection: u32,
        name: *mut c_char,
        size: u16,
        end_of_selection: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetBaudrateSelection(
        device_name: *const c_char,
        protocol_stack_name: *const c_char,
        interface_name: *const c_char,
        port_name: *const c_char,
        start_of_selection: u32,
        baudrate: *mut u32,
        end_of_selection: *mut u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_FindDeviceCommunicationSettings(
        handle: *mut KeyHandle,
        device_name: *mut c_char,
        protocol_stack_name: *mut c_char,
        interface_name: *mut c_char,
        port_name: *mut c_char,
        size: u16,
        baudrate: *mut u32,
        timeout_ms: *mut u32,
        node_id: *mut u16,
        options: u32,
        error_code: *mut u32,
    ) -> u32;
    fn VCS_GetSensorType(
        handle: KeyHandle,
        node_id: u16,
        sensor_type: *mut u16,
        error_code: *mut u32,
    ) -> u32;
}

fn vendor_error(code: u32, what: &str) -> HardwareError {
    let mut text = [0u8; 128];
    let described = unsafe {
        VCS_GetErrorInfo(code, text.as_mut_ptr().cast::<c_char>(), text.len() as u16)
    };
    let detail = if described != 0 {
        CStr::from_bytes_until_nul(&text)
            .ok()
            .map(|s| s.to_string_lossy().into_owned())
    } else {
        None
    };
    match detail {
        Some(detail) => HardwareError::new(code, format!("{what}: {detail}")),
        None => HardwareError::new(code, what),
    }
}

fn check(ok: u32, code: u32, what: &str) -> HwResult<()> {
    if ok != 0 {
        Ok(())
    } else {
        Err(vendor_error(code, what))
    }
}

fn c_string(value: &str, what: &str) -> HwResult<CString> {
    CString::new(value).map_err(|_| HardwareError::new(0, format!("{what} contains NUL")))
}

fn buf_to_string(buf: &[u8]) -> String {
    CStr::from_bytes_until_nul(buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One open EPOS axis.
pub struct EposPort {
    handle: KeyHandle,
    node_id: u16,
}

// The key handle is an opaque token the vendor library accepts from any
// thread as long as calls on it are serialized, which the port mutex in
// the axis guarantees.
unsafe impl Send for EposPort {}

impl EposPort {
    /// Open the device described by `descriptor`.
    pub fn open(descriptor: &DeviceDescriptor) -> HwResult<Self> {
        let device = c_string(&descriptor.device_name, "device name")?;
        let protocol = c_string(&descriptor.protocol, "protocol name")?;
        let interface = c_string(&descriptor.interface, "interface name")?;
        let port = c_string(&descriptor.port, "port name")?;

        let mut code = 0u32;
        let handle = unsafe {
            VCS_OpenDevice(
                device.as_ptr(),
                protocol.as_ptr(),
                interface.as_ptr(),
                port.as_ptr(),
                &mut code,
            )
        };
        if handle.is_null() {
            return Err(vendor_error(code, "VCS_OpenDevice"));
        }
        let configured = unsafe {
            VCS_SetProtocolStackSettings(
                handle,
                descriptor.baud_rate,
                PROTOCOL_TIMEOUT_MS,
                &mut code,
            )
        };
        if configured == 0 {
            unsafe { VCS_CloseDevice(handle, &mut code) };
            return Err(vendor_error(code, "VCS_SetProtocolStackSettings"));
        }
        Ok(Self {
            handle,
            node_id: descriptor.node_id,
        })
    }

    fn read_object(&self, object: (u16, u8, u32), what: &str) -> HwResult<u64> {
        let (index, sub_index, len) = object;
        let mut data = 0u64;
        let mut read = 0u32;
        let mut code = 0u32;
        let ok = unsafe {
            VCS_GetObject(
                self.handle,
                self.node_id,
                index,
                sub_index,
                std::ptr::addr_of_mut!(data).cast::<c_void>(),
                len,
                &mut read,
                &mut code,
            )
        };
        check(ok, code, what)?;
        Ok(data)
    }
}

impl Drop for EposPort {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            let mut code = 0u32;
            unsafe { VCS_CloseDevice(self.handle, &mut code) };
            self.handle = std::ptr::null_mut();
        }
    }
}

macro_rules! node_call {
    ($self:ident, $func:ident) => {{
        let mut code = 0u32;
        let ok = unsafe { $func($self.handle, $self.node_id, &mut code) };
        check(ok, code, stringify!($func))
    }};
    ($self:ident, $func:ident, $($arg:expr),+) => {{
        let mut code = 0u32;
        let ok = unsafe { $func($self.handle, $self.node_id, $($arg),+, &mut code) };
        check(ok, code, stringify!($func))
    }};
}

#[async_trait]
impl MotionPort for EposPort {
    async fn clear_faults(&mut self) -> HwResult<()> {
        node_call!(self, VCS_ClearFault)
    }

    async fn position(&mut self) -> HwResult<i32> {
        let mut position = 0i32;
        node_call!(self, VCS_GetPositionIs, &mut position)?;
        Ok(position)
    }

    async fn velocity(&mut self) -> HwResult<i32> {
        let mut velocity = 0i32;
        node_call!(self, VCS_GetVelocityIs, &mut velocity)?;
        Ok(velocity)
    }

    async fn actual_current(&mut self) -> HwResult<i16> {
        let mut current = 0i16;
        node_call!(self, VCS_GetCurrentIs, &mut current)?;
        Ok(current)
    }

    async fn activate_profile(&mut self, kind: ProfileKind) -> HwResult<()> {
        match kind {
            ProfileKind::Position => node_call!(self, VCS_ActivateProfilePositionMode),
            ProfileKind::Velocity => node_call!(self, VCS_ActivateProfileVelocityMode),
            ProfileKind::Homing => node_call!(self, VCS_ActivateHomingMode),
        }
    }

    async fn set_enabled(&mut self) -> HwResult<()> {
        node_call!(self, VCS_SetEnableState)
    }

    async fn set_disabled(&mut self) -> HwResult<()> {
        node_call!(self, VCS_SetDisableState)
    }

    async fn set_position_profile(
        &mut self,
        velocity: u32,
        accel: u32,
        decel: u32,
    ) -> HwResult<()> {
        node_call!(self, VCS_SetPositionProfile, velocity, accel, decel)
    }

    async fn set_velocity_profile(&mut self, accel: u32, decel: u32) -> HwResult<()> {
        node_call!(self, VCS_SetVelocityProfile, accel, decel)
    }

    async fn move_to_position(&mut self, position: i32) -> HwResult<()> {
        // Absolute target, start immediately.
        node_call!(self, VCS_MoveToPosition, position, 1, 1)
    }

    async fn move_with_velocity(&mut self, velocity: i32) -> HwResult<()> {
        node_call!(self, VCS_MoveWithVelocity, velocity)
    }

    async fn halt(&mut self, kind: ProfileKind) -> HwResult<()> {
        match kind {
            ProfileKind::Velocity => node_call!(self, VCS_HaltVelocityMovement),
            _ => node_call!(self, VCS_HaltPositionMovement),
        }
    }

    async fn target_reached(&mut self) -> HwResult<bool> {
        let mut reached = 0u32;
        node_call!(self, VCS_GetMovementState, &mut reached)?;
        Ok(reached != 0)
    }

    async fn quick_stop_active(&mut self) -> HwResult<bool> {
        let mut active = 0u32;
        node_call!(self, VCS_GetQuickStopState, &mut active)?;
        Ok(active != 0)
    }

    async fn status_word(&mut self) -> HwResult<u16> {
        Ok(self.read_object(OBJ_STATUSWORD, "statusword read")? as u16)
    }

    async fn device_state(&mut self) -> HwResult<DeviceState> {
        let mut state = 0u16;
        node_call!(self, VCS_GetState, &mut state)?;
        Ok(DeviceState::from_code(state))
    }

    async fn set_quick_stop(&mut self) -> HwResult<()> {
        node_call!(self, VCS_SetQuickStopState)
    }

    async fn define_position(&mut self, position: i32) -> HwResult<()> {
        node_call!(self, VCS_DefinePosition, position)
    }

    async fn disconnect(&mut self) -> HwResult<()> {
        let mut code = 0u32;
        let ok = unsafe { VCS_CloseDevice(self.handle, &mut code) };
        self.handle = std::ptr::null_mut();
        check(ok, code, "VCS_CloseDevice")
    }
}

/// Walk the vendor selection tables and describe every reachable axis.
pub fn enumerate() -> HwResult<DeviceRegistry> {
    let mut devices = Vec::new();
    for device_name in selection(|start, buf, end, code| unsafe {
        VCS_GetDeviceNameSelection(start, buf, SELECTION_BUF as u16, end, code)
    })? {
        let device = c_string(&device_name, "device name")?;
        for protocol_name in selection(|start, buf, end, code| unsafe {
            VCS_GetProtocolStackNameSelection(
                device.as_ptr(),
                start,
                buf,
                SELECTION_BUF as u16,
                end,
                code,
            )
        })? {
            let protocol = c_string(&protocol_name, "protocol name")?;
            for interface_name in selection(|start, buf, end, code| unsafe {
                VCS_GetInterfaceNameSelection(
                    device.as_ptr(),
                    protocol.as_ptr(),
                    start,
                    buf,
                    SELECTION_BUF as u16,
                    end,
                    code,
                )
            })? {
                let interface = c_string(&interface_name, "interface name")?;
                for port_name in selection(|start, buf, end, code| unsafe {
                    VCS_GetPortNameSelection(
                        device.as_ptr(),
                        protocol.as_ptr(),
                        interface.as_ptr(),
                        start,
                        buf,
                        SELECTION_BUF as u16,
                        end,
                        code,
                    )
                })? {
                    if let Some(descriptor) =
                        probe_port(&device_name, &protocol_name, &interface_name, &port_name)?
                    {
                        devices.push(descriptor);
                    }
                }
            }
        }
    }
    Ok(DeviceRegistry::new(devices))
}

/// Drive one `VCS_Get*Selection` cursor to exhaustion.
fn selection(
    mut fetch: impl FnMut(u32, *mut c_char, *mut u32, *mut u32) -> u32,
) -> HwResult<Vec<String>> {
    let mut names = Vec::new();
    let mut buf = [0u8; SELECTION_BUF];
    let mut end = 0u32;
    let mut code = 0u32;
    let mut start = 1u32;
    loop {
        let ok = fetch(start, buf.as_mut_ptr().cast::<c_char>(), &mut end, &mut code);
        if ok == 0 {
            // An empty table reports failure on the first cursor step.
            if start == 1 {
                break;
            }
            return Err(vendor_error(code, "selection walk"));
        }
        names.push(buf_to_string(&buf));
        if end != 0 {
            break;
        }
        start = 0;
    }
    Ok(names)
}

/// Open a candidate port briefly and read its identity.
fn probe_port(
    device_name: &str,
    protocol_name: &str,
    interface_name: &str,
    port_name: &str,
) -> HwResult<Option<DeviceDescriptor>> {
    let device = c_string(device_name, "device name")?;
    let protocol = c_string(protocol_name, "protocol name")?;
    let interface = c_string(interface_name, "interface name")?;
    let port = c_string(port_name, "port name")?;

    let mut baud_rate = 0u32;
    let mut end = 0u32;
    let mut code = 0u32;
    let baud_found = unsafe {
        VCS_GetBaudrateSelection(
            device.as_ptr(),
            protocol.as_ptr(),
            interface.as_ptr(),
            port.as_ptr(),
            1,
            &mut baud_rate,
            &mut end,
            &mut code,
        )
    };
    if baud_found == 0 {
        return Ok(None);
    }

    let mut handle: KeyHandle = std::ptr::null_mut();
    let mut dev_buf = [0u8; SELECTION_BUF];
    let mut proto_buf = [0u8; SELECTION_BUF];
    let mut iface_buf = [0u8; SELECTION_BUF];
    let mut port_buf = [0u8; SELECTION_BUF];
    dev_buf[..device_name.len().min(SELECTION_BUF - 1)]
        .copy_from_slice(&device_name.as_bytes()[..device_name.len().min(SELECTION_BUF - 1)]);
    proto_buf[..protocol_name.len().min(SELECTION_BUF - 1)]
        .copy_from_slice(&protocol_name.as_bytes()[..protocol_name.len().min(SELECTION_BUF - 1)]);
    iface_buf[..interface_name.len().min(SELECTION_BUF - 1)]
        .copy_from_slice(&interface_name.as_bytes()[..interface_name.len().min(SELECTION_BUF - 1)]);
    port_buf[..port_name.len().min(SELECTION_BUF - 1)]
        .copy_from_slice(&port_name.as_bytes()[..port_name.len().min(SELECTION_BUF - 1)]);

    let mut timeout_ms = 0u32;
    let mut node_id = 0u16;
    let found = unsafe {
        VCS_FindDeviceCommunicationSettings(
            &mut handle,
            dev_buf.as_mut_ptr().cast::<c_char>(),
            proto_buf.as_mut_ptr().cast::<c_char>(),
            iface_buf.as_mut_ptr().cast::<c_char>(),
            port_buf.as_mut_ptr().cast::<c_char>(),
            SELECTION_BUF as u16,
            &mut baud_rate,
            &mut timeout_ms,
            &mut node_id,
            0,
            &mut code,
        )
    };
    if found == 0 || handle.is_null() {
        // Nothing answering on this port.
        return Ok(None);
    }

    let mut sensor_type = 0u16;
    unsafe {
        VCS_GetSensorType(handle, node_id, &mut sensor_type, &mut code);
    }
    let probe = EposPort { handle, node_id };
    let serial_number = probe
        .read_object(OBJ_SERIAL_NUMBER, "serial number read")
        .unwrap_or(0);
    drop(probe);

    Ok(Some(DeviceDescriptor {
        device_name: device_name.to_string(),
        protocol: protocol_name.to_string(),
        interface: interface_name.to_string(),
        port: port_name.to_string(),
        baud_rate,
        serial_number,
        node_id,
        sensor_type: i32::from(sensor_type),
    }))
}
