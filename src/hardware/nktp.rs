//! NKT Photonics Register-Level Drivers
//!
//! Reference: NKTP SDK Instruction Manual (SuperK SELECT RF driver register map)
//!
//! Protocol Overview:
//! - Devices sit on an interbus behind a COM port and are addressed by module number
//! - Every operation is a typed register write: `(port, device, register, value)`
//! - Each write returns a register result code (0 = success)
//!
//! Register Map used here:
//!
//! | Device | Register | Width | Meaning |
//! |---|---|---|---|
//! | RF driver (25) | 0x90 | u32 | wavelength channel 1, pm |
//! | RF driver (25) | 0xB0 | u16 | amplitude channel 1, 0.1 % units |
//! | RF driver (25) | 0x30 | u8 | RF power on/off |
//! | supercontinuum (1) | 0x30 | u8 | emission on/off |
//!
//! The vendor library itself stays behind the `RegisterBus` trait; this module only
//! expresses the register protocol and maps result codes onto `DaqError`.

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{EmissionControl, Releasable, WavelengthActuator};
use crate::hardware::{Amplitude, Picometres};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Module address of the SELECT RF driver
pub const RF_DRIVER_ADDRESS: u8 = 25;
/// Module address of the supercontinuum pump
pub const PUMP_ADDRESS: u8 = 1;

const REG_WAVELENGTH: u8 = 0x90;
const REG_AMPLITUDE: u8 = 0xB0;
const REG_POWER: u8 = 0x30;

/// Register operation result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    Success,
    ReadOnly,
    Failed,
    Busy,
    Nacked,
    CrcError,
    Timeout,
    ComError,
    TypeError,
    IndexError,
    PortClosed,
    RegisterNotFound,
    DeviceNotFound,
    PortNotFound,
    PortOpenError,
    ApplicationBusy,
    /// Any code outside the documented table
    Unknown(i32),
}

impl RegisterResult {
    /// Decode a raw result code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::ReadOnly,
            2 => Self::Failed,
            3 => Self::Busy,
            4 => Self::Nacked,
            5 => Self::CrcError,
            6 => Self::Timeout,
            7 => Self::ComError,
            8 => Self::TypeError,
            9 => Self::IndexError,
            10 => Self::PortClosed,
            11 => Self::RegisterNotFound,
            12 => Self::DeviceNotFound,
            13 => Self::PortNotFound,
            14 => Self::PortOpenError,
            15 => Self::ApplicationBusy,
            other => Self::Unknown(other),
        }
    }

    /// Map onto the application taxonomy.
    ///
    /// Missing ports/devices mean the hardware is gone; every other failure is an
    /// unacknowledged command.
    pub fn into_result(self, operation: &str) -> AppResult<()> {
        match self {
            Self::Success => Ok(()),
            Self::DeviceNotFound | Self::PortNotFound | Self::PortOpenError => Err(
                DaqError::DeviceDisconnected(format!("{} failed: {:?}", operation, self)),
            ),
            other => Err(DaqError::actuator(operation, format!("{:?}", other))),
        }
    }
}

/// Typed register writes over an NKTP interbus port.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    /// Write an 8-bit register
    async fn write_u8(&self, port: &str, device: u8, register: u8, value: u8) -> RegisterResult;

    /// Write a 16-bit register
    async fn write_u16(&self, port: &str, device: u8, register: u8, value: u16)
        -> RegisterResult;

    /// Write a 32-bit register
    async fn write_u32(&self, port: &str, device: u8, register: u8, value: u32)
        -> RegisterResult;

    /// Close the port
    async fn close_port(&self, port: &str) -> RegisterResult;
}

// =============================================================================
// SELECT RF driver
// =============================================================================

/// SuperK SELECT acousto-optic RF driver.
pub struct SelectRfDriver {
    bus: Arc<dyn RegisterBus>,
    port: String,
    address: u8,
}

impl SelectRfDriver {
    /// Driver at the default module address on `port`
    pub fn new(bus: Arc<dyn RegisterBus>, port: impl Into<String>) -> Self {
        Self {
            bus,
            port: port.into(),
            address: RF_DRIVER_ADDRESS,
        }
    }

    /// Override the module address
    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }
}

#[async_trait]
impl WavelengthActuator for SelectRfDriver {
    async fn set_wavelength(&self, wavelength: Picometres) -> AppResult<()> {
        tracing::debug!(wavelength_pm = wavelength, "Setting wavelength");
        self.bus
            .write_u32(&self.port, self.address, REG_WAVELENGTH, wavelength)
            .await
            .into_result("set_wavelength")
    }

    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()> {
        tracing::debug!(amplitude = amplitude.get(), "Setting amplitude");
        self.bus
            .write_u16(&self.port, self.address, REG_AMPLITUDE, amplitude.get())
            .await
            .into_result("set_amplitude")
    }

    async fn set_rf_enabled(&self, enabled: bool) -> AppResult<()> {
        tracing::debug!(enabled, "RF power");
        self.bus
            .write_u8(&self.port, self.address, REG_POWER, u8::from(enabled))
            .await
            .into_result("set_rf_enabled")
    }
}

#[async_trait]
impl Releasable for SelectRfDriver {
    fn name(&self) -> &str {
        "select_rf_driver"
    }

    async fn release(&self) -> AppResult<()> {
        let rf_off = self.set_rf_enabled(false).await;
        let close = self.bus.close_port(&self.port).await.into_result("close_port");
        rf_off.and(close)
    }
}

// =============================================================================
// Supercontinuum pump
// =============================================================================

/// SuperK COMPACT/EXTREME supercontinuum pump (emission only).
pub struct SupercontinuumSource {
    bus: Arc<dyn RegisterBus>,
    port: String,
    address: u8,
}

impl SupercontinuumSource {
    /// Pump at the default module address on `port`
    pub fn new(bus: Arc<dyn RegisterBus>, port: impl Into<String>) -> Self {
        Self {
            bus,
            port: port.into(),
            address: PUMP_ADDRESS,
        }
    }
}

#[async_trait]
impl EmissionControl for SupercontinuumSource {
    async fn set_emission(&self, on: bool) -> AppResult<()> {
        self.bus
            .write_u8(&self.port, self.address, REG_POWER, u8::from(on))
            .await
            .into_result("set_emission")
    }
}

#[async_trait]
impl Releasable for SupercontinuumSource {
    fn name(&self) -> &str {
        "supercontinuum"
    }

    async fn release(&self) -> AppResult<()> {
        self.bus.close_port(&self.port).await.into_result("close_port")
    }
}

// =============================================================================
// RecordingBus
// =============================================================================

/// One register write seen by `RecordingBus`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub port: String,
    pub device: u8,
    pub register: u8,
    pub value: u32,
}

/// In-memory bus that records every write and can be told to fail.
#[derive(Default)]
pub struct RecordingBus {
    writes: Mutex<Vec<RegisterWrite>>,
    closed: Mutex<Vec<String>>,
    next_failure: Mutex<Option<RegisterResult>>,
}

impl RecordingBus {
    /// Empty bus, every operation succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// The next operation returns `result` instead of success
    pub fn fail_next(&self, result: RegisterResult) {
        if let Ok(mut next) = self.next_failure.lock() {
            *next = Some(result);
        }
    }

    /// Writes so far
    pub fn writes(&self) -> Vec<RegisterWrite> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Ports closed so far
    pub fn closed_ports(&self) -> Vec<String> {
        self.closed.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn take_failure(&self) -> RegisterResult {
        self.next_failure
            .lock()
            .ok()
            .and_then(|mut next| next.take())
            .unwrap_or(RegisterResult::Success)
    }

    fn record(&self, port: &str, device: u8, register: u8, value: u32) -> RegisterResult {
        let result = self.take_failure();
        if result == RegisterResult::Success {
            if let Ok(mut writes) = self.writes.lock() {
                writes.push(RegisterWrite {
                    port: port.to_string(),
                    device,
                    register,
                    value,
                });
            }
        }
        result
    }
}

#[async_trait]
impl RegisterBus for RecordingBus {
    async fn write_u8(&self, port: &str, device: u8, register: u8, value: u8) -> RegisterResult {
        self.record(port, device, register, u32::from(value))
    }

    async fn write_u16(&self, port: &str, device: u8, register: u8, value: u16) -> RegisterResult {
        self.record(port, device, register, u32::from(value))
    }

    async fn write_u32(&self, port: &str, device: u8, register: u8, value: u32) -> RegisterResult {
        self.record(port, device, register, value)
    }

    async fn close_port(&self, port: &str) -> RegisterResult {
        let result = self.take_failure();
        if result == RegisterResult::Success {
            if let Ok(mut closed) = self.closed.lock() {
                closed.push(port.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rf_driver_register_map() {
        let bus = Arc::new(RecordingBus::new());
        let driver = SelectRfDriver::new(bus.clone(), "COM5");

        driver.set_wavelength(550_000).await.unwrap();
        driver.set_amplitude(Amplitude::clamped(640)).await.unwrap();
        driver.set_rf_enabled(true).await.unwrap();

        let writes = bus.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!((writes[0].device, writes[0].register, writes[0].value), (25, 0x90, 550_000));
        assert_eq!((writes[1].device, writes[1].register, writes[1].value), (25, 0xB0, 640));
        assert_eq!((writes[2].device, writes[2].register, writes[2].value), (25, 0x30, 1));
        assert!(writes.iter().all(|w| w.port == "COM5"));
    }

    #[tokio::test]
    async fn test_result_codes_map_to_taxonomy() {
        let bus = Arc::new(RecordingBus::new());
        let driver = SelectRfDriver::new(bus.clone(), "COM5");

        bus.fail_next(RegisterResult::from_code(6));
        let err = driver.set_amplitude(Amplitude::MAX).await.unwrap_err();
        assert!(matches!(err, DaqError::ActuatorComm { .. }));

        bus.fail_next(RegisterResult::from_code(13));
        let err = driver.set_wavelength(500_000).await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceDisconnected(_)));

        assert_eq!(RegisterResult::from_code(42), RegisterResult::Unknown(42));
    }

    #[tokio::test]
    async fn test_release_turns_rf_off_and_closes_port() {
        let bus = Arc::new(RecordingBus::new());
        let driver = SelectRfDriver::new(bus.clone(), "COM5");
        let pump = SupercontinuumSource::new(bus.clone(), "COM4");

        pump.set_emission(true).await.unwrap();
        driver.release().await.unwrap();
        pump.set_emission(false).await.unwrap();
        pump.release().await.unwrap();

        let writes = bus.writes();
        assert_eq!(writes[0], RegisterWrite { port: "COM4".into(), device: 1, register: 0x30, value: 1 });
        assert_eq!(writes[1], RegisterWrite { port: "COM5".into(), device: 25, register: 0x30, value: 0 });
        assert_eq!(writes[2], RegisterWrite { port: "COM4".into(), device: 1, register: 0x30, value: 0 });
        assert_eq!(bus.closed_ports(), vec!["COM5".to_string(), "COM4".to_string()]);
    }

    #[tokio::test]
    async fn test_release_still_closes_port_when_rf_off_fails() {
        let bus = Arc::new(RecordingBus::new());
        let driver = SelectRfDriver::new(bus.clone(), "COM5");

        bus.fail_next(RegisterResult::Nacked);
        assert!(driver.release().await.is_err());
        assert_eq!(bus.closed_ports(), vec!["COM5".to_string()]);
    }
}
