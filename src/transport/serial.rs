//! Serial/USB transport implementation.
//!
//! ANT USB sticks enumerate as serial ports. The transport either opens a
//! configured port or picks one of the sticks found by [`discover`].

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use crate::error::{Error, Result};
use crate::transport::{INBOUND_CAPACITY, Inbound, Transport};

/// Default baud rate of ANT USB sticks.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// USB vendor id of Dynastream Innovations.
pub const ANT_VENDOR_ID: u16 = 0x0FCF;

/// USB product ids of supported sticks (USB2, USB-m and the Garmin mini stick).
pub const ANT_PRODUCT_IDS: [u16; 3] = [0x1004, 0x1008, 0x1009];

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path; `None` picks a discovered stick.
    pub port: Option<String>,
    /// Index into the discovered sticks when no port is configured.
    pub device_no: usize,
    /// Try the sticks after `device_no` when it cannot be opened.
    ///
    /// A stick held by another process fails to open and is skipped.
    pub fallback: bool,
    /// Baud rate.
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            device_no: 0,
            fallback: true,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl SerialConfig {
    /// Creates a configuration for an explicit port.
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }

    /// Creates a configuration that uses only the `device_no`-th discovered
    /// stick.
    #[must_use]
    pub fn discovered(device_no: usize) -> Self {
        Self {
            device_no,
            fallback: false,
            ..Self::default()
        }
    }

    /// Enables or disables falling back to later sticks.
    #[must_use]
    pub const fn fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }
}

/// A discovered ANT USB stick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntStick {
    /// Serial port path.
    pub port_name: String,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// USB serial number, if reported.
    pub serial_number: Option<String>,
}

/// Returns true if the USB ids belong to a supported ANT stick.
#[must_use]
pub fn is_ant_stick(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == ANT_VENDOR_ID && ANT_PRODUCT_IDS.contains(&product_id)
}

/// Returns the ports to try, in order, for a stick selection.
fn candidate_ports(sticks: Vec<AntStick>, device_no: usize, fallback: bool) -> Vec<String> {
    let count = if fallback { sticks.len() } else { 1 };
    sticks
        .into_iter()
        .skip(device_no)
        .take(count)
        .map(|stick| stick.port_name)
        .collect()
}

/// Lists the ANT sticks currently connected, ordered by port name.
///
/// The list is built fresh on every call.
pub fn discover() -> Result<Vec<AntStick>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    let mut sticks: Vec<AntStick> = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) if is_ant_stick(usb.vid, usb.pid) => Some(AntStick {
                port_name: port.port_name,
                vendor_id: usb.vid,
                product_id: usb.pid,
                serial_number: usb.serial_number,
            }),
            _ => None,
        })
        .collect();
    sticks.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    tracing::debug!("discovered {} ANT sticks", sticks.len());
    Ok(sticks)
}

/// Serial transport for ANT USB sticks.
pub struct SerialTransport {
    config: SerialConfig,
    writer: Option<WriteHalf<SerialStream>>,
    read_task: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub const fn new(config: SerialConfig) -> Self {
        Self {
            config,
            writer: None,
            read_task: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn resolve_ports(&self) -> Result<Vec<String>> {
        if let Some(port) = &self.config.port {
            return Ok(vec![port.clone()]);
        }
        let ports = candidate_ports(discover()?, self.config.device_no, self.config.fallback);
        if ports.is_empty() {
            return Err(Error::NoDevice);
        }
        Ok(ports)
    }

    fn open_first(&self, ports: &[String]) -> Result<SerialStream> {
        let mut last_error = Error::NoDevice;
        for port in ports {
            tracing::info!("opening serial port: {}", port);
            match tokio_serial::new(port, self.config.baud_rate).open_native_async() {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::warn!("cannot open {}: {}", port, e);
                    last_error = Error::Serial(e);
                }
            }
        }
        Err(last_error)
    }

    async fn read_loop(mut reader: ReadHalf<SerialStream>, tx: mpsc::Sender<Inbound>) {
        let mut buf = [0u8; 1024];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("serial port closed");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    return;
                }
            };

            tracing::trace!("received {} bytes", n);
            if tx
                .send(Inbound::Bytes(Bytes::copy_from_slice(&buf[..n])))
                .await
                .is_err()
            {
                tracing::debug!("inbound receiver dropped");
                return;
            }
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> BoxFuture<'_, Result<mpsc::Receiver<Inbound>>> {
        Box::pin(async move {
            if self.writer.is_some() {
                return Err(Error::InvalidState("serial port already open"));
            }

            let ports = self.resolve_ports()?;
            let stream = self.open_first(&ports)?;

            let (reader, writer) = tokio::io::split(stream);
            let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
            self.read_task = Some(tokio::spawn(Self::read_loop(reader, tx)));
            self.writer = Some(writer);

            tracing::info!("opened serial port");
            Ok(rx)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(task) = self.read_task.take() {
                task.abort();
            }
            if let Some(mut writer) = self.writer.take() {
                tracing::info!("closing serial port");
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("serial shutdown: {}", e);
                }
            }
            Ok(())
        })
    }

    fn write(&mut self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let writer = self.writer.as_mut().ok_or(Error::NotOpen)?;
            writer.write_all(&frame).await.map_err(Error::Io)?;
            writer.flush().await.map_err(Error::Io)?;
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::default();
        assert_eq!(config.port, None);
        assert_eq!(config.device_no, 0);
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);

        let config = SerialConfig::new("/dev/ttyUSB0").baud_rate(57_600);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baud_rate, 57_600);

        assert_eq!(SerialConfig::discovered(2).device_no, 2);
        assert!(!SerialConfig::discovered(2).fallback);
        assert!(SerialConfig::default().fallback);
    }

    fn stick(port_name: &str) -> AntStick {
        AntStick {
            port_name: port_name.to_owned(),
            vendor_id: ANT_VENDOR_ID,
            product_id: 0x1008,
            serial_number: None,
        }
    }

    #[test]
    fn test_candidate_ports() {
        let sticks = || vec![stick("/dev/ttyUSB0"), stick("/dev/ttyUSB1"), stick("/dev/ttyUSB2")];

        assert_eq!(candidate_ports(sticks(), 0, true).len(), 3);
        assert_eq!(candidate_ports(sticks(), 1, true), ["/dev/ttyUSB1", "/dev/ttyUSB2"]);
        assert_eq!(candidate_ports(sticks(), 1, false), ["/dev/ttyUSB1"]);
        assert!(candidate_ports(sticks(), 3, true).is_empty());
        assert!(candidate_ports(Vec::new(), 0, true).is_empty());
    }

    #[tokio::test]
    async fn test_open_reports_unopenable_port() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/null-ant"));
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, Error::Serial(_)));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_is_ant_stick() {
        assert!(is_ant_stick(0x0FCF, 0x1008));
        assert!(is_ant_stick(0x0FCF, 0x1009));
        assert!(is_ant_stick(0x0FCF, 0x1004));
        assert!(!is_ant_stick(0x0FCF, 0x1234));
        assert!(!is_ant_stick(0x10C4, 0x1008));
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/null-ant"));
        assert!(!transport.is_open());
        let err = transport.write(Bytes::from_static(&[0xA4])).await.unwrap_err();
        assert!(matches!(err, Error::NotOpen));
    }

    #[test]
    #[ignore = "Requires /sys/class/tty - not available in sandboxed builds"]
    fn test_discover() {
        let _ = discover();
    }
}
