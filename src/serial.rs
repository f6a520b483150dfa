//! Serial driver and address multiplexing (component C).
//!
//! Displays share one RS-232 line; an external 2-bit demultiplexer is
//! wired to the RTS and DTR modem-control lines, so routing a telegram to
//! a physical address is a matter of toggling those two lines before the
//! write. There is no in-band flow control: the driver paces itself by
//! sleeping for the transmission time of what it just wrote (12 bit-times
//! per byte at the configured baud rate).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, warn};

use crate::error::SerialError;

const BAUD_RATE: u32 = 1200;
const BITS_PER_BYTE: u32 = 12; // 1 start + 7 data + 1 parity + 2 stop + slack

/// (DTR, RTS) levels for each physical display address, per the external
/// demultiplexer's wiring.
fn dtr_rts_for_address(address: u8) -> Result<(bool, bool), SerialError> {
    match address {
        0 => Ok((false, false)),
        1 => Ok((false, true)),
        2 => Ok((true, false)),
        3 => Ok((true, true)),
        other => Err(SerialError::InvalidAddress(other as i32)),
    }
}

/// Abstraction over "a thing that can deliver a telegram to one physical
/// display address". Lets the controller run against a real serial port or
/// against an in-memory double in tests.
#[async_trait]
pub trait SerialLink: Send {
    async fn write_at(&mut self, address: u8, telegram: &[u8]) -> Result<(), SerialError>;
}

/// Real serial port backend: 1200 bps, 7E2, RTS/DTR address multiplexing.
pub struct TokioSerialLink {
    port: SerialStream,
}

impl TokioSerialLink {
    pub fn open(path: &str) -> Result<Self, SerialError> {
        let port = tokio_serial::new(path, BAUD_RATE)
            .data_bits(DataBits::Seven)
            .parity(Parity::Even)
            .stop_bits(StopBits::Two)
            .open_native_async()
            .map_err(|source| SerialError::Open {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, source),
            })?;
        Ok(Self { port })
    }
}

#[async_trait]
impl SerialLink for TokioSerialLink {
    async fn write_at(&mut self, address: u8, telegram: &[u8]) -> Result<(), SerialError> {
        let (dtr, rts) = dtr_rts_for_address(address)?;
        self.port
            .write_data_terminal_ready(dtr)
            .map_err(|e| SerialError::Write(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.port
            .write_request_to_send(rts)
            .map_err(|e| SerialError::Write(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        debug!(address, bytes = telegram.len(), "writing telegram to serial port");
        self.port
            .write_all(telegram)
            .await
            .map_err(SerialError::Write)?;

        let drain = Duration::from_secs_f64(telegram.len() as f64 * BITS_PER_BYTE as f64 / BAUD_RATE as f64);
        sleep(drain).await;
        Ok(())
    }
}

#[derive(Default)]
struct NullSerialInner {
    last: [Option<Vec<u8>>; 4],
    history: Vec<(u8, Vec<u8>)>,
}

/// A cloneable window onto a `NullSerial`'s recorded writes, kept after the
/// `NullSerial` itself has been boxed and moved into a `Controller` — the
/// only way tests can inspect what the controller actually wrote.
#[derive(Clone, Default)]
pub struct NullSerialHandle(std::sync::Arc<std::sync::Mutex<NullSerialInner>>);

impl NullSerialHandle {
    pub fn last(&self, address: u8) -> Option<Vec<u8>> {
        self.0.lock().unwrap().last[address as usize].clone()
    }

    pub fn history(&self) -> Vec<(u8, Vec<u8>)> {
        self.0.lock().unwrap().history.clone()
    }
}

/// In-memory backend used by tests and by hosts with no configured serial
/// port: records the last telegram written per address, and the full
/// history, without touching real hardware.
#[derive(Default)]
pub struct NullSerial(NullSerialHandle);

impl NullSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a `NullSerial` paired with a handle that survives the
    /// `NullSerial` being boxed into a `Box<dyn SerialLink>`.
    pub fn with_handle() -> (Self, NullSerialHandle) {
        let handle = NullSerialHandle::default();
        (Self(handle.clone()), handle)
    }

    pub fn last(&self, address: u8) -> Option<Vec<u8>> {
        self.0.last(address)
    }

    pub fn history(&self) -> Vec<(u8, Vec<u8>)> {
        self.0.history()
    }
}

#[async_trait]
impl SerialLink for NullSerial {
    async fn write_at(&mut self, address: u8, telegram: &[u8]) -> Result<(), SerialError> {
        if address > 3 {
            return Err(SerialError::InvalidAddress(address as i32));
        }
        let mut inner = self.0 .0.lock().unwrap();
        inner.last[address as usize] = Some(telegram.to_vec());
        inner.history.push((address, telegram.to_vec()));
        Ok(())
    }
}

/// Opens the configured serial port, falling back to the in-memory backend
/// and logging a warning if the port can't be opened (e.g. running the
/// broker on a dev box with no attached display hardware).
pub fn open_or_null(path: &str) -> Box<dyn SerialLink> {
    match TokioSerialLink::open(path) {
        Ok(link) => Box::new(link),
        Err(e) => {
            warn!(error = %e, path, "falling back to in-memory serial backend");
            Box::new(NullSerial::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_serial_records_last_write_per_address() {
        let mut link = NullSerial::new();
        link.write_at(0, b"zI0\r\x7f").await.unwrap();
        link.write_at(2, b"zI1ABCD\r").await.unwrap();
        assert_eq!(link.last(0).as_deref(), Some(&b"zI0\r\x7f"[..]));
        assert_eq!(link.last(2).as_deref(), Some(&b"zI1ABCD\r"[..]));
        assert!(link.last(1).is_none());
        assert_eq!(link.history().len(), 2);
    }

    #[test]
    fn dtr_rts_mapping_matches_demultiplexer_wiring() {
        assert_eq!(dtr_rts_for_address(0).unwrap(), (false, false));
        assert_eq!(dtr_rts_for_address(1).unwrap(), (false, true));
        assert_eq!(dtr_rts_for_address(2).unwrap(), (true, false));
        assert_eq!(dtr_rts_for_address(3).unwrap(), (true, true));
        assert!(dtr_rts_for_address(4).is_err());
    }
}
