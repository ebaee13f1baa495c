//! Thin adapters over the device's hardware: the valve relay, the 16x2 status
//! LCD and the network interface whose address is shown on it.
//!
//! Each adapter sits behind a small trait so the dispatcher can be exercised
//! without a Raspberry Pi attached.

pub mod actuator;
pub mod display;
pub mod netaddr;

use crate::config::{DisplayBackend, DisplayConfig, RelayBackend, RelayConfig};
use actuator::{ActuatorPort, GpioRelay, SimulatedRelay};
use display::{ConsoleDisplay, Lcd1602, StatusDisplay};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),
}

/// Opens the relay backend named in the config.
pub fn open_actuator(config: &RelayConfig) -> Result<Box<dyn ActuatorPort>, HardwareError> {
    match config.backend {
        RelayBackend::Gpio => {
            let relay = GpioRelay::new(config.pin, config.active_low)?;
            info!(
                "Relay on GPIO {} (active {})",
                config.pin,
                if config.active_low { "low" } else { "high" }
            );
            Ok(Box::new(relay))
        }
        RelayBackend::Simulated => {
            info!("Using simulated relay");
            Ok(Box::new(SimulatedRelay::default()))
        }
    }
}

/// Opens the display backend named in the config.
///
/// An LCD that cannot be set up is not fatal; status lines go to the log instead.
pub fn open_display(config: &DisplayConfig) -> Box<dyn StatusDisplay> {
    match config.backend {
        DisplayBackend::Lcd => match Lcd1602::open(config.i2c_bus, config.address) {
            Ok(lcd) => Box::new(lcd),
            Err(e) => {
                warn!("Cannot set-up LCD: {}", e);
                Box::new(ConsoleDisplay::default())
            }
        },
        DisplayBackend::Console => Box::new(ConsoleDisplay::default()),
    }
}
