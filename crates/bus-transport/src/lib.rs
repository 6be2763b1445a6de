use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use solivia_codec::{expected_frame_len, is_frame_header, ENQ, STX};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};
use tracing::{debug, info, warn};

pub mod mock;

pub use mock::{MockReply, MockTransport};

/// Line that switches the RS-485 transceiver between transmit and receive.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEnableLine {
    /// The serial adapter's RTS signal.
    Rts,
    /// A sysfs GPIO number, already exported and configured as output.
    Gpio(u32),
}

/// Serial settings for the shared inverter bus. The Solivia bus runs 8N1.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub driver_enable: Option<DriverEnableLine>,
    /// Extra time the driver stays enabled after the last byte has left the UART.
    pub turnaround_guard_us: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19_200,
            driver_enable: None,
            turnaround_guard_us: 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no complete response within {timeout_ms}ms ({received} bytes received)")]
    Timeout { timeout_ms: u64, received: usize },
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("serial io error: {0}")]
    Io(#[from] io::Error),
    #[error("driver-enable line error: {0}")]
    DriverEnable(String),
    #[error("serial stream closed")]
    Closed,
}

impl TransportError {
    /// Timeouts concern one exchange; everything else means the bus itself is unusable.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Half-duplex request/response transport. Callers keep at most one exchange
/// outstanding: every `send` is followed by a `receive` before the next `send`.
#[async_trait]
pub trait BusTransport: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Waits for one complete response frame. Never retries.
    async fn receive(&mut self, wait: Duration) -> Result<Vec<u8>, TransportError>;
}

/// Byte stream under a [`SerialTransport`]: a serial port, or anything that
/// behaves like one.
pub trait SerialLine: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drops bytes received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Drives the RTS modem line.
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
}

impl SerialLine for SerialStream {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.write_request_to_send(level)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

/// Output pin wired to the transceiver's driver-enable input.
#[async_trait]
pub trait DriverEnablePin: Send {
    async fn set_level(&mut self, high: bool) -> io::Result<()>;
}

/// GPIO exported through sysfs, written as `0`/`1` to its `value` file.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    value_path: PathBuf,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self::with_base("/sys/class/gpio", pin)
    }

    pub fn with_base(base: impl AsRef<Path>, pin: u32) -> Self {
        Self {
            value_path: base.as_ref().join(format!("gpio{pin}")).join("value"),
        }
    }
}

#[async_trait]
impl DriverEnablePin for SysfsGpio {
    async fn set_level(&mut self, high: bool) -> io::Result<()> {
        tokio::fs::write(&self.value_path, if high { "1" } else { "0" })
            .await
            .map_err(|err| io::Error::new(err.kind(), format!("{}: {err}", self.value_path.display())))
    }
}

/// How the transmitter gets switched on for the length of a request.
pub enum DriverEnable {
    /// RTS of the serial line itself.
    Rts,
    Pin(Box<dyn DriverEnablePin>),
}

impl fmt::Debug for DriverEnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverEnable::Rts => f.write_str("Rts"),
            DriverEnable::Pin(_) => f.write_str("Pin"),
        }
    }
}

impl From<&DriverEnableLine> for DriverEnable {
    fn from(line: &DriverEnableLine) -> Self {
        match line {
            DriverEnableLine::Rts => DriverEnable::Rts,
            DriverEnableLine::Gpio(pin) => DriverEnable::Pin(Box::new(SysfsGpio::new(*pin))),
        }
    }
}

#[derive(Debug)]
pub struct SerialTransport<L = SerialStream> {
    config: SerialConfig,
    line: L,
    driver_enable: Option<DriverEnable>,
}

impl SerialTransport<SerialStream> {
    pub async fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let line = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|source| TransportError::Open {
                port: config.port.clone(),
                source,
            })?;

        let driver_enable = config.driver_enable.as_ref().map(DriverEnable::from);
        let transport = Self::with_line(config, line, driver_enable).await?;
        info!(
            port = %transport.config.port,
            baud_rate = transport.config.baud_rate,
            driver_enable = ?transport.config.driver_enable,
            "serial bus opened"
        );
        Ok(transport)
    }
}

impl<L: SerialLine> SerialTransport<L> {
    /// Wraps an already open line. The driver is released before returning so
    /// the bus starts in receive mode.
    pub async fn with_line(
        config: SerialConfig,
        line: L,
        driver_enable: Option<DriverEnable>,
    ) -> Result<Self, TransportError> {
        let mut transport = Self {
            config,
            line,
            driver_enable,
        };
        transport.set_driver(false).await?;
        Ok(transport)
    }

    async fn set_driver(&mut self, enabled: bool) -> Result<(), TransportError> {
        let result = match &mut self.driver_enable {
            None => return Ok(()),
            Some(DriverEnable::Rts) => self.line.set_rts(enabled),
            Some(DriverEnable::Pin(pin)) => pin.set_level(enabled).await,
        };
        result.map_err(|err| TransportError::DriverEnable(err.to_string()))
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.line.write_all(frame).await?;
        self.line.flush().await?;
        if self.driver_enable.is_some() {
            // flush only hands the bytes to the UART; keep driving until they are on the wire
            sleep(drain_time(frame.len(), self.config.baud_rate, self.config.turnaround_guard_us)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<L: SerialLine> BusTransport for SerialTransport<L> {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if let Err(err) = self.line.discard_input() {
            debug!(error = %err, "failed to discard stale input");
        }

        self.set_driver(true).await?;
        let written = self.write_frame(frame).await;
        // released even when the write failed, or the bus stays jammed
        let released = self.set_driver(false).await;
        written?;
        released?;

        debug!(address = frame.get(2).copied().unwrap_or_default(), bytes = frame.len(), "request sent");
        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::with_capacity(solivia_codec::MAX_FRAME_LEN);
        match timeout(wait, read_frame(&mut self.line, &mut buf)).await {
            Ok(Ok(())) => Ok(buf),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: wait.as_millis() as u64,
                received: buf.len(),
            }),
        }
    }
}

/// Reads from `reader` until `buf` holds one complete frame.
///
/// Bytes before a plausible frame header are dropped one at a time, as are
/// echoes of our own enquiry frames from transceivers that loop transmitted
/// data back.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 64];

    loop {
        match buf.iter().position(|byte| *byte == STX) {
            Some(0) => {}
            Some(start) => {
                debug!(skipped = start, "resynchronising on start marker");
                buf.drain(..start);
            }
            None => buf.clear(),
        }

        match is_frame_header(buf) {
            Some(false) => {
                debug!("start marker without a valid header, dropping it");
                buf.drain(..1);
                continue;
            }
            Some(true) => {
                if let Some(len) = expected_frame_len(buf) {
                    if buf.len() >= len {
                        if buf[1] == ENQ {
                            debug!("discarding echoed enquiry");
                            buf.drain(..len);
                            continue;
                        }
                        if buf.len() > len {
                            warn!(extra = buf.len() - len, "discarding bytes after response frame");
                            buf.truncate(len);
                        }
                        return Ok(());
                    }
                }
            }
            None => {}
        }

        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Time for `bytes` 8N1 characters to leave the UART, plus a guard.
pub fn drain_time(bytes: usize, baud_rate: u32, guard_us: u64) -> Duration {
    let bits = bytes as u64 * 10;
    let micros = bits.saturating_mul(1_000_000) / u64::from(baud_rate.max(1));
    Duration::from_micros(micros.saturating_add(guard_us))
}
