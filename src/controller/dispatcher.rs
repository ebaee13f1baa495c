//! Applies decoded commands to the valve and the status display.
//!
//! The dispatcher is the only writer of the valve state and of the display.
//! It runs inline on the polling task, so a timed watering job holds that task
//! (and with it all protocol I/O) until the valve has closed again.

use super::command::{self, Command};
use crate::hardware::actuator::ActuatorPort;
use crate::hardware::display::StatusDisplay;
use crate::hardware::netaddr::AddressResolver;
use crate::hardware::HardwareError;
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::message_manager::ReceivedMessage;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Shown on the address row when the device has no address.
pub const NO_IP: &str = "NO IP";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Length of one watering tick
    pub tick: Duration,
    /// Pause after any schedule message
    pub schedule_settle: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            schedule_settle: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActuatorState {
    pub is_open: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLine {
    On,
    Off,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusLine::On => write!(f, "ON"),
            StatusLine::Off => write!(f, "OFF"),
        }
    }
}

/// What the display was last told to show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplaySnapshot {
    pub address_line: String,
    pub status_line: StatusLine,
}

pub struct Dispatcher {
    actuator: Box<dyn ActuatorPort>,
    display: Box<dyn StatusDisplay>,
    resolver: Box<dyn AddressResolver>,
    settings: DispatcherSettings,
    address: Option<String>,
    state: ActuatorState,
    snapshot: DisplaySnapshot,
}

impl Dispatcher {
    pub fn new(
        actuator: Box<dyn ActuatorPort>,
        display: Box<dyn StatusDisplay>,
        resolver: Box<dyn AddressResolver>,
        settings: DispatcherSettings,
    ) -> Self {
        Dispatcher {
            actuator,
            display,
            resolver,
            settings,
            address: None,
            state: ActuatorState::default(),
            snapshot: DisplaySnapshot {
                address_line: NO_IP.to_string(),
                status_line: StatusLine::Off,
            },
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ActuatorState {
        self.state
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> &DisplaySnapshot {
        &self.snapshot
    }

    /// Resolves the address once, closes the valve and draws the first screen.
    pub fn initialize(&mut self) {
        match self.refresh_address() {
            Some(address) => info!("Detected IP address: {}", address),
            None => warn!("No IP Address detected!"),
        }
        self.apply(false);
    }

    /// Re-reads the device address; later screens use the cached value.
    pub fn refresh_address(&mut self) -> Option<&str> {
        self.address = self.resolver.resolve();
        self.address.as_deref()
    }

    /// Decodes one message and carries it out. Never fails.
    pub async fn dispatch(&mut self, endpoint: &BrokerEndpoint, message: &ReceivedMessage) {
        info!("{}", message);

        let command = command::decode(endpoint, &message.channel, &message.payload);
        self.execute(command).await;

        if message.channel == endpoint.schedule_channel && !self.settings.schedule_settle.is_zero()
        {
            debug!("Schedule settle for {:?}", self.settings.schedule_settle);
            tokio::time::sleep(self.settings.schedule_settle).await;
        }
    }

    pub async fn execute(&mut self, command: Command) {
        match command {
            Command::Immediate { on: true } => {
                info!("Turning on valve...");
                self.apply(true);
            }
            Command::Immediate { on: false } => {
                info!("Turning off valve...");
                self.apply(false);
            }
            Command::TimedWater { seconds } => self.water_for(seconds).await,
            Command::Unrecognized { channel, reason } => {
                warn!("Ignoring {} message: {}", channel, reason);
            }
            Command::Irrelevant => debug!("Topic irrelevant."),
        }
    }

    async fn water_for(&mut self, seconds: u64) {
        info!("Now watering for {} seconds...", seconds);
        self.apply(true);
        for elapsed in 0..seconds {
            info!("{} seconds have passed", elapsed);
            tokio::time::sleep(self.settings.tick).await;
        }
        self.apply(false);
        info!("Done watering! Closing valve...");
    }

    fn apply(&mut self, open: bool) {
        if let Err(e) = self.actuator.set_state(open) {
            error!("Failed to switch relay: {}", e);
        }
        self.state.is_open = open;
        self.render();
    }

    fn render(&mut self) {
        self.snapshot = DisplaySnapshot {
            address_line: self.address.clone().unwrap_or_else(|| NO_IP.to_string()),
            status_line: if self.state.is_open {
                StatusLine::On
            } else {
                StatusLine::Off
            },
        };

        if let Err(e) = draw(self.display.as_mut(), &self.snapshot) {
            error!("Failed to update display: {}", e);
        }
    }

    /// Closes the valve if it is open; used when the polling task stops.
    pub fn park(&mut self) {
        if self.state.is_open {
            info!("Closing valve before shutdown");
            self.apply(false);
        }
    }

    pub fn release(&mut self) {
        if let Err(e) = self.display.release() {
            error!("Failed to release display: {}", e);
        }
    }
}

fn draw(display: &mut dyn StatusDisplay, snapshot: &DisplaySnapshot) -> Result<(), HardwareError> {
    display.clear()?;
    display.write_line(0, &snapshot.address_line)?;
    display.write_line(1, &snapshot.status_line.to_string())
}
