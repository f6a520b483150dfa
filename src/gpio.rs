//! Stop-indicator GPIO driver (component D).
//!
//! One output pin per display address. Optional: a host with no GPIO
//! chip (anything that isn't the embedded box bolted to the vehicle) gets
//! `NoGpio`, which tracks nothing physical but still reports "unsupported"
//! so the controller can keep the logical state regardless.

use std::collections::HashMap;

use crate::error::GpioError;

pub trait StopIndicator: Send {
    /// Returns `Ok(true)` if a physical pin was driven, `Ok(false)` if the
    /// address has no mapped pin (logically tracked elsewhere), `Err` on a
    /// hardware failure.
    fn set(&mut self, address: i32, value: bool) -> Result<bool, GpioError>;
}

/// Default backend: no GPIO chip present, or the `gpio` feature is off.
pub struct NoGpio;

impl StopIndicator for NoGpio {
    fn set(&mut self, _address: i32, _value: bool) -> Result<bool, GpioError> {
        Ok(false)
    }
}

#[cfg(feature = "gpio")]
pub struct CdevGpio {
    lines: HashMap<i32, gpio_cdev::LineHandle>,
}

#[cfg(feature = "gpio")]
impl CdevGpio {
    pub fn open(chip_path: &str, pinmap: &HashMap<i32, u32>) -> Result<Self, GpioError> {
        use gpio_cdev::{Chip, LineRequestFlags};

        let mut chip = Chip::new(chip_path).map_err(|source| GpioError::ChipUnavailable {
            chip: chip_path.to_string(),
            source: Box::new(source),
        })?;

        let mut lines = HashMap::new();
        for (&address, &offset) in pinmap {
            let line = chip
                .get_line(offset)
                .map_err(|source| GpioError::LineRequest {
                    line: offset,
                    source: Box::new(source),
                })?;
            let handle = line
                .request(LineRequestFlags::OUTPUT, 0, "ibis-stop-indicator")
                .map_err(|source| GpioError::LineRequest {
                    line: offset,
                    source: Box::new(source),
                })?;
            lines.insert(address, handle);
        }
        Ok(Self { lines })
    }
}

#[cfg(feature = "gpio")]
impl StopIndicator for CdevGpio {
    fn set(&mut self, address: i32, value: bool) -> Result<bool, GpioError> {
        match self.lines.get(&address) {
            Some(handle) => {
                handle
                    .set_value(value as u8)
                    .map_err(|source| GpioError::SetValue {
                        line: handle.line().offset(),
                        source: Box::new(source),
                    })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Parses `ADDRESS=PIN` pairs from the CLI into a pin map.
pub fn parse_pinmap(pairs: &[String]) -> HashMap<i32, u32> {
    let mut map = HashMap::new();
    for pair in pairs {
        if let Some((addr, pin)) = pair.split_once('=') {
            if let (Ok(addr), Ok(pin)) = (addr.trim().parse::<i32>(), pin.trim().parse::<u32>()) {
                map.insert(addr, pin);
            }
        }
    }
    map
}
