//! Real WLC scale over a USB serial port.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::{parse_weight, ScaleReader};
use crate::config::ScaleSettings;
use crate::error::{AppResult, RigError};

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// WLC scale attached to a serial port, 9600 8N1.
///
/// The scale streams frames continuously; each reading discards one
/// possibly partial line and parses the next complete one.
pub struct SerialScale {
    port: String,
    baud_rate: u32,
    reader: Option<BufReader<SerialStream>>,
}

impl SerialScale {
    /// Open the configured port, autodetecting by USB vendor id when no
    /// port is set.
    pub fn open(settings: &ScaleSettings) -> AppResult<Self> {
        let port = if settings.port.is_empty() {
            detect_port(settings.usb_vid)?
        } else {
            settings.port.clone()
        };
        let mut scale = Self {
            port,
            baud_rate: settings.baud_rate,
            reader: None,
        };
        scale.open_stream()?;
        Ok(scale)
    }

    fn open_stream(&mut self) -> AppResult<()> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
            .map_err(|err| {
                RigError::Connect(format!("scale port {} open failed: {err}", self.port))
            })?;
        self.reader = Some(BufReader::new(stream));
        info!(port = %self.port, baud = self.baud_rate, "scale connected");
        Ok(())
    }

    async fn read_frame(&mut self) -> AppResult<String> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| RigError::Scale("scale port not open".to_string()))?;
        let mut line = String::new();
        // First line may have been cut mid-frame; the second is whole.
        for _ in 0..2 {
            line.clear();
            let read = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line));
            match read.await {
                Ok(Ok(0)) => {
                    return Err(RigError::Scale("scale port closed".to_string()));
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(RigError::Io(err)),
                Err(_) => {
                    return Err(RigError::Scale(format!(
                        "no frame within {READ_TIMEOUT:?}"
                    )));
                }
            }
        }
        Ok(line.trim_end().to_string())
    }
}

#[async_trait]
impl ScaleReader for SerialScale {
    async fn read_weight(&mut self) -> AppResult<f64> {
        let frame = match self.read_frame().await {
            Ok(frame) => frame,
            Err(err) => {
                // A failed read invalidates the stream; reconnect reopens it.
                self.reader = None;
                return Err(err);
            }
        };
        parse_weight(&frame)
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        debug!(port = %self.port, "reopening scale port");
        self.reader = None;
        self.open_stream()
    }
}

/// Find the first serial port whose USB vendor id matches.
pub fn detect_port(usb_vid: u16) -> AppResult<String> {
    let ports = serialport::available_ports()
        .map_err(|err| RigError::Connect(format!("serial enumeration failed: {err}")))?;
    for port in &ports {
        if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
            if usb.vid == usb_vid {
                debug!(port = %port.port_name, vid = usb_vid, "scale port detected");
                return Ok(port.port_name.clone());
            }
        }
    }
    Err(RigError::Connect(format!(
        "no serial scale found (usb vid {usb_vid}, {} ports scanned)",
        ports.len()
    )))
}
