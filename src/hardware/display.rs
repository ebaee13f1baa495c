//! Two-line status display.
//!
//! [`Lcd1602`] drives an HD44780 character LCD through the usual PCF8574 I2C
//! backpack in 4-bit mode. Backpack pin mapping:
//!
//! ```text
//! P0 RS | P1 RW | P2 EN | P3 backlight | P4..P7 D4..D7
//! ```
//!
//! Timing waits are plain `thread::sleep` calls (50 ms once at init, 2 ms per
//! clear, ~100 µs per character) and run on whichever runtime worker is
//! driving the poll loop. A full redraw blocks that worker for a few
//! milliseconds.

use super::HardwareError;
use rppal::i2c::I2c;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const COLUMNS: usize = 16;
pub const ROWS: u8 = 2;

pub trait StatusDisplay: Send {
    fn clear(&mut self) -> Result<(), HardwareError>;

    fn write_line(&mut self, row: u8, text: &str) -> Result<(), HardwareError>;

    /// Blanks the display and frees the underlying device.
    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

const RS: u8 = 0b0000_0001;
const EN: u8 = 0b0000_0100;
const BACKLIGHT: u8 = 0b0000_1000;

const CMD_CLEAR: u8 = 0x01;
const CMD_ENTRY_MODE: u8 = 0x06;
const CMD_DISPLAY_ON: u8 = 0x0C;
const CMD_FUNCTION_4BIT_2LINE: u8 = 0x28;
const CMD_SET_DDRAM: u8 = 0x80;
const ROW_OFFSETS: [u8; 2] = [0x00, 0x40];

pub struct Lcd1602 {
    i2c: I2c,
    backlight: u8,
    released: bool,
}

impl Lcd1602 {
    pub fn open(bus: u8, address: u16) -> Result<Self, HardwareError> {
        let mut i2c = I2c::with_bus(bus)?;
        i2c.set_slave_address(address)?;

        let mut lcd = Lcd1602 {
            i2c,
            backlight: BACKLIGHT,
            released: false,
        };
        lcd.init()?;
        info!("LCD ready on i2c-{} at {:#04x}", bus, address);
        Ok(lcd)
    }

    fn init(&mut self) -> Result<(), HardwareError> {
        thread::sleep(Duration::from_millis(50));
        // wake-up sequence: three times 8-bit mode, then switch to 4-bit
        self.write_nibble(0x30, 0)?;
        thread::sleep(Duration::from_micros(4500));
        self.write_nibble(0x30, 0)?;
        thread::sleep(Duration::from_micros(4500));
        self.write_nibble(0x30, 0)?;
        thread::sleep(Duration::from_micros(150));
        self.write_nibble(0x20, 0)?;

        self.command(CMD_FUNCTION_4BIT_2LINE)?;
        self.command(CMD_DISPLAY_ON)?;
        self.command(CMD_ENTRY_MODE)?;
        self.clear()
    }

    fn expander_write(&mut self, byte: u8) -> Result<(), HardwareError> {
        self.i2c.write(&[byte | self.backlight])?;
        Ok(())
    }

    fn write_nibble(&mut self, high_bits: u8, mode: u8) -> Result<(), HardwareError> {
        let data = (high_bits & 0xF0) | mode;
        self.expander_write(data | EN)?;
        thread::sleep(Duration::from_micros(1));
        self.expander_write(data & !EN)?;
        thread::sleep(Duration::from_micros(50));
        Ok(())
    }

    fn send(&mut self, byte: u8, mode: u8) -> Result<(), HardwareError> {
        self.write_nibble(byte & 0xF0, mode)?;
        self.write_nibble(byte << 4, mode)
    }

    fn command(&mut self, command: u8) -> Result<(), HardwareError> {
        self.send(command, 0)
    }
}

impl StatusDisplay for Lcd1602 {
    fn clear(&mut self) -> Result<(), HardwareError> {
        self.command(CMD_CLEAR)?;
        thread::sleep(Duration::from_millis(2));
        Ok(())
    }

    fn write_line(&mut self, row: u8, text: &str) -> Result<(), HardwareError> {
        let offset = ROW_OFFSETS[usize::from(row.min(ROWS - 1))];
        self.command(CMD_SET_DDRAM | offset)?;
        for byte in fit_line(text).bytes() {
            self.send(byte, RS)?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        if self.released {
            return Ok(());
        }
        self.clear()?;
        self.backlight = 0;
        self.expander_write(0)?;
        self.released = true;
        debug!("LCD released");
        Ok(())
    }
}

impl Drop for Lcd1602 {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release LCD: {}", e);
        }
    }
}

/// Display text limited to one row of printable ASCII.
pub fn fit_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .take(COLUMNS)
        .collect()
}

/// Logs status lines instead of drawing them.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    lines: [String; 2],
}

impl ConsoleDisplay {
    #[cfg(test)]
    pub fn lines(&self) -> &[String; 2] {
        &self.lines
    }
}

impl StatusDisplay for ConsoleDisplay {
    fn clear(&mut self) -> Result<(), HardwareError> {
        self.lines = Default::default();
        Ok(())
    }

    fn write_line(&mut self, row: u8, text: &str) -> Result<(), HardwareError> {
        let row = usize::from(row.min(ROWS - 1));
        self.lines[row] = fit_line(text);
        info!("[display {}] {}", row, self.lines[row]);
        Ok(())
    }
}
