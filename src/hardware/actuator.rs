use super::HardwareError;
use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, info};

/// The single digital output that opens and closes the valve.
pub trait ActuatorPort: Send {
    fn set_state(&mut self, open: bool) -> Result<(), HardwareError>;
}

/// Relay driven from a GPIO pin (BCM numbering).
pub struct GpioRelay {
    pin: OutputPin,
    active_low: bool,
}

impl GpioRelay {
    pub fn new(pin: u8, active_low: bool) -> Result<Self, HardwareError> {
        let pin = Gpio::new()?.get(pin)?.into_output();
        Ok(GpioRelay { pin, active_low })
    }

    /// Pin level that corresponds to the requested valve state.
    pub fn level_for(open: bool, active_low: bool) -> bool {
        open != active_low
    }
}

impl ActuatorPort for GpioRelay {
    fn set_state(&mut self, open: bool) -> Result<(), HardwareError> {
        if Self::level_for(open, self.active_low) {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        debug!("GPIO {} -> {}", self.pin.pin(), if open { "open" } else { "closed" });
        Ok(())
    }
}

/// Stand-in for hosts without GPIO; only logs.
#[derive(Debug, Default)]
pub struct SimulatedRelay {
    open: bool,
}

impl ActuatorPort for SimulatedRelay {
    fn set_state(&mut self, open: bool) -> Result<(), HardwareError> {
        if self.open != open {
            info!("[relay] valve {}", if open { "OPEN" } else { "CLOSED" });
        }
        self.open = open;
        Ok(())
    }
}
