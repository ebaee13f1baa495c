//! Scripted broker links and recording hardware doubles for unit tests.
//!
//! Everything a harness hands out shares one journal, so tests can assert on
//! the interleaving of session and hardware effects.

use crate::controller::dispatcher::{Dispatcher, DispatcherSettings};
use crate::hardware::actuator::ActuatorPort;
use crate::hardware::display::StatusDisplay;
use crate::hardware::netaddr::AddressResolver;
use crate::hardware::HardwareError;
use crate::mqtt::config::{Backoff, BrokerConfig, BrokerEndpoint};
use crate::mqtt::message_manager::ReceivedMessage;
use crate::mqtt::mqtt_handler::{SessionError, SessionManager};
use crate::mqtt::transport::{BrokerLink, Connector, LinkEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Opened(u32),
    Subscribed(u32, String),
    Polled(u32),
    Dropped(u32),
    Disconnected(u32),
    Relay(bool),
    Cleared,
    Line(u8, String),
    DisplayReleased,
}

impl Record {
    fn is_display(&self) -> bool {
        matches!(
            self,
            Record::Cleared | Record::Line(..) | Record::DisplayReleased
        )
    }
}

/// Something the next `poll()` on a link will return.
#[derive(Clone, Debug)]
pub enum Inbound {
    Event(LinkEvent),
    Error(String),
}

pub fn control() -> &'static str {
    "control"
}

pub fn schedule() -> &'static str {
    "schedule"
}

pub fn publish(channel: &str, payload: &str) -> Inbound {
    Inbound::Event(LinkEvent::Publish {
        channel: channel.to_string(),
        payload: payload.as_bytes().to_vec(),
    })
}

pub fn publish_message(channel: &str, payload: &str) -> ReceivedMessage {
    ReceivedMessage::new(channel.to_string(), payload.as_bytes().to_vec())
}

#[derive(Default)]
struct Shared {
    records: Vec<Record>,
    relay: Vec<(Instant, bool)>,
    lines: [String; 2],
    inbound: VecDeque<Inbound>,
    fail_opens: u32,
    generation: u32,
    address: Option<String>,
    resolves: usize,
}

type Journal = Arc<Mutex<Shared>>;

#[derive(Clone, Default)]
pub struct Harness {
    shared: Journal,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(address: Option<&str>) -> Self {
        let harness = Self::default();
        harness.set_address(address);
        harness
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector {
            shared: self.shared.clone(),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Box::new(RecordingRelay {
                shared: self.shared.clone(),
            }),
            Box::new(RecordingDisplay {
                shared: self.shared.clone(),
            }),
            Box::new(ScriptedResolver {
                shared: self.shared.clone(),
            }),
            DispatcherSettings::default(),
        )
    }

    /// A session on the default channels that has not connected yet. The
    /// dispatcher is not initialized, so the relay journal starts empty.
    pub fn session(&self) -> SessionManager<ScriptedConnector> {
        self.session_with(Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            max_attempts: 3,
        })
    }

    pub fn session_with(&self, backoff: Backoff) -> SessionManager<ScriptedConnector> {
        SessionManager::new(
            Arc::new(BrokerConfig::default().endpoint()),
            self.connector(),
            self.dispatcher(),
            backoff,
        )
    }

    pub fn push(&self, inbound: Inbound) {
        self.lock().inbound.push_back(inbound);
    }

    pub fn push_error(&self, reason: &str) {
        self.push(Inbound::Error(reason.to_string()));
    }

    pub fn push_protocol(&self) {
        self.push(Inbound::Event(LinkEvent::Protocol));
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.lock().fail_opens = count;
    }

    /// Number of links opened successfully so far.
    pub fn opens(&self) -> u32 {
        self.lock().generation
    }

    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    pub fn session_records(&self) -> Vec<Record> {
        self.lock()
            .records
            .iter()
            .filter(|record| !record.is_display())
            .cloned()
            .collect()
    }

    pub fn relay_timeline(&self) -> Vec<(Instant, bool)> {
        self.lock().relay.clone()
    }

    pub fn display_lines(&self) -> [String; 2] {
        self.lock().lines.clone()
    }

    pub fn set_address(&self, address: Option<&str>) {
        self.lock().address = address.map(str::to_string);
    }

    pub fn resolves(&self) -> usize {
        self.lock().resolves
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

pub struct ScriptedConnector {
    shared: Journal,
}

impl Connector for ScriptedConnector {
    type Link = ScriptedLink;

    async fn open(&mut self, _endpoint: &BrokerEndpoint) -> Result<ScriptedLink, SessionError> {
        let generation = {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_opens > 0 {
                shared.fail_opens -= 1;
                return Err(SessionError::Connect("connection refused".to_string()));
            }
            shared.generation += 1;
            let generation = shared.generation;
            shared.records.push(Record::Opened(generation));
            generation
        };

        Ok(ScriptedLink {
            generation,
            shared: self.shared.clone(),
        })
    }
}

pub struct ScriptedLink {
    generation: u32,
    shared: Journal,
}

impl ScriptedLink {
    fn record(&self, record: Record) {
        self.shared.lock().unwrap().records.push(record);
    }
}

impl BrokerLink for ScriptedLink {
    async fn subscribe(&mut self, channel: &str) -> Result<(), SessionError> {
        self.record(Record::Subscribed(self.generation, channel.to_string()));
        Ok(())
    }

    /// Pops the next scripted event; with nothing queued it never completes.
    async fn poll(&mut self) -> Result<LinkEvent, SessionError> {
        let next = self.shared.lock().unwrap().inbound.pop_front();
        match next {
            Some(Inbound::Event(event)) => {
                self.record(Record::Polled(self.generation));
                Ok(event)
            }
            Some(Inbound::Error(reason)) => {
                self.record(Record::Polled(self.generation));
                Err(SessionError::Poll(reason))
            }
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {
        self.record(Record::Disconnected(self.generation));
    }
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.records.push(Record::Dropped(self.generation));
        }
    }
}

struct RecordingRelay {
    shared: Journal,
}

impl ActuatorPort for RecordingRelay {
    fn set_state(&mut self, open: bool) -> Result<(), HardwareError> {
        let mut shared = self.shared.lock().unwrap();
        shared.relay.push((Instant::now(), open));
        shared.records.push(Record::Relay(open));
        Ok(())
    }
}

struct RecordingDisplay {
    shared: Journal,
}

impl StatusDisplay for RecordingDisplay {
    fn clear(&mut self) -> Result<(), HardwareError> {
        let mut shared = self.shared.lock().unwrap();
        shared.lines = Default::default();
        shared.records.push(Record::Cleared);
        Ok(())
    }

    fn write_line(&mut self, row: u8, text: &str) -> Result<(), HardwareError> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(line) = shared.lines.get_mut(usize::from(row)) {
            *line = text.to_string();
        }
        shared.records.push(Record::Line(row, text.to_string()));
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        self.shared.lock().unwrap().records.push(Record::DisplayReleased);
        Ok(())
    }
}

struct ScriptedResolver {
    shared: Journal,
}

impl AddressResolver for ScriptedResolver {
    fn resolve(&self) -> Option<String> {
        let mut shared = self.shared.lock().unwrap();
        shared.resolves += 1;
        shared.address.clone()
    }
}
