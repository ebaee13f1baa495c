//! Session manager: one broker session, its health, and the reconnect procedure.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                      │              │
//!                      ▼              ▼
//!                  Faulted(reason) ◄──┘
//!                      │
//!                      └──► Connecting (next step)
//! ```
//!
//! Every reconnect opens a new link, drops the previous one and re-issues both
//! channel subscriptions. The manager owns the dispatcher and runs it inline
//! whenever a publish arrives, so messages are handled strictly one at a time.

use super::config::{Backoff, BrokerEndpoint};
use super::message_manager::ReceivedMessage;
use super::transport::{BrokerLink, Connector, LinkEvent};
use crate::controller::dispatcher::Dispatcher;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Faulted(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Faulted(reason) => write!(f, "Faulted({})", reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to open broker connection: {0}")]
    Connect(String),

    #[error("Failed to subscribe to '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("Session I/O error: {0}")]
    Poll(String),

    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Reconnect cancelled")]
    Cancelled,

    #[error("Reconnect gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<SessionError>,
    },
}

/// What a single [`SessionManager::step`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Budget elapsed without a complete event
    Idle,
    Protocol,
    Dispatched,
    Faulted,
    /// Reconnect abandoned because the owner is shutting down
    Cancelled,
}

pub struct SessionManager<C: Connector> {
    endpoint: Arc<BrokerEndpoint>,
    connector: C,
    link: Option<C::Link>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    backoff: Backoff,
    dispatcher: Dispatcher,
    messages_received: usize,
    cancel: CancellationToken,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(
        endpoint: Arc<BrokerEndpoint>,
        connector: C,
        dispatcher: Dispatcher,
        backoff: Backoff,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        SessionManager {
            endpoint,
            connector,
            link: None,
            state: ConnectionState::Disconnected,
            state_tx,
            backoff,
            dispatcher,
            messages_received: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Lets `token` abort reconnect attempts and backoff waits.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Health feed for observers outside the polling task.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    #[cfg(test)]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[cfg(test)]
    pub fn messages_received(&self) -> usize {
        self.messages_received
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Session state: {} -> {}", self.state, next);
        }
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Opens a new session and re-subscribes both channels.
    ///
    /// The previous link is dropped as soon as the new one is open, so a stale
    /// handle is never polled again. On failure the session is left `Faulted`
    /// and the error is handed back to the caller.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        match &self.state {
            ConnectionState::Faulted(reason) => {
                warn!("Reconnecting after session fault: {}", reason)
            }
            ConnectionState::Disconnected => debug!("Initial connect"),
            _ => {}
        }
        self.set_state(ConnectionState::Connecting);

        let link = match self.connector.open(&self.endpoint).await {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to open socket: {}", e);
                self.set_state(ConnectionState::Faulted(e.to_string()));
                return Err(e);
            }
        };
        info!("Init socket success!");

        if self.link.take().is_some() {
            debug!("Discarded previous session handle");
        }
        let link = self.link.insert(link);

        if let Err(e) = Self::subscribe_all(link, &self.endpoint).await {
            error!("{}", e);
            self.link = None;
            self.set_state(ConnectionState::Faulted(e.to_string()));
            return Err(e);
        }

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn subscribe_all(link: &mut C::Link, endpoint: &BrokerEndpoint) -> Result<(), SessionError> {
        for channel in endpoint.channels() {
            link.subscribe(channel).await?;
            info!("Subscribed to '{}'", channel);
        }
        Ok(())
    }

    /// Reconnect with exponential backoff between failed attempts.
    ///
    /// Every attempt and every wait races the cancellation token; a cancelled
    /// reconnect returns [`SessionError::Cancelled`].
    async fn reconnect_with_backoff(&mut self) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        let mut failed = 0u32;
        loop {
            let attempt = tokio::select! {
                biased;

                _ = cancel.cancelled() => None,
                result = self.reconnect() => Some(result),
            };
            let error = match attempt {
                Some(Ok(())) => return Ok(()),
                Some(Err(e)) => e,
                None => return Err(self.abandon_reconnect()),
            };
            failed += 1;

            if !self.backoff.allows(failed) {
                error!("Giving up reconnecting after {} attempts", failed);
                return Err(SessionError::RetriesExhausted {
                    attempts: failed,
                    last: Box::new(error),
                });
            }

            let delay = self.backoff.delay(failed - 1);
            warn!(
                "Reconnect attempt {} failed, retrying in {:?}",
                failed, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.abandon_reconnect()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn abandon_reconnect(&mut self) -> SessionError {
        info!("Reconnect cancelled");
        self.set_state(ConnectionState::Faulted(SessionError::Cancelled.to_string()));
        SessionError::Cancelled
    }

    /// One bounded unit of protocol I/O.
    ///
    /// Reconnects first if the session is down, then waits at most `budget`
    /// for the next event. A completed publish is dispatched before this
    /// returns. I/O errors only fault the session; the returned error is
    /// reserved for a reconnect that ran out of attempts. A reconnect cut
    /// short by cancellation is [`StepOutcome::Cancelled`].
    pub async fn step(&mut self, budget: Duration) -> Result<StepOutcome, SessionError> {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Faulted(_)
        ) {
            match self.reconnect_with_backoff().await {
                Ok(()) => {}
                Err(SessionError::Cancelled) => return Ok(StepOutcome::Cancelled),
                Err(e) => return Err(e),
            }
        }

        let Some(link) = self.link.as_mut() else {
            return Ok(StepOutcome::Idle);
        };

        let polled = tokio::time::timeout(budget, link.poll()).await;
        match polled {
            Err(_) => Ok(StepOutcome::Idle),
            Ok(Ok(LinkEvent::Protocol)) => Ok(StepOutcome::Protocol),
            Ok(Ok(LinkEvent::Publish { channel, payload })) => {
                let message = ReceivedMessage::new(channel, payload);
                self.messages_received += 1;
                self.dispatcher.dispatch(&self.endpoint, &message).await;
                Ok(StepOutcome::Dispatched)
            }
            Ok(Err(e)) => {
                error!("Session I/O failed: {}", e);
                self.set_state(ConnectionState::Faulted(e.to_string()));
                Ok(StepOutcome::Faulted)
            }
        }
    }

    /// Marks the session faulted without a real network failure.
    pub fn force_error(&mut self, reason: &str) {
        warn!("Injecting error: \"{}\"", reason);
        self.set_state(ConnectionState::Faulted(reason.to_string()));
    }

    /// Closes the valve, says goodbye to the broker and releases the display.
    pub async fn shutdown(&mut self) {
        self.dispatcher.park();
        if let Some(mut link) = self.link.take() {
            info!("Disconnecting...");
            link.disconnect().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.dispatcher.release();
        info!(
            "Session closed after {} received messages",
            self.messages_received
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{control, publish, schedule, Harness, Record};

    #[tokio::test(start_paused = true)]
    async fn initial_reconnect_subscribes_both_channels() {
        let harness = Harness::new();
        let mut session = harness.session();

        session.reconnect().await.unwrap();

        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(
            harness.session_records(),
            vec![
                Record::Opened(1),
                Record::Subscribed(1, "control".to_string()),
                Record::Subscribed(1, "schedule".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_leaves_session_faulted() {
        let harness = Harness::new();
        harness.fail_next_opens(1);
        let mut session = harness.session();

        let result = session.reconnect().await;

        assert!(matches!(result, Err(SessionError::Connect(_))));
        assert!(matches!(session.state(), ConnectionState::Faulted(_)));
        assert!(harness.session_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forced_error_reconnects_before_next_dispatch() {
        let harness = Harness::new();
        let mut session = harness.session();
        let mut states = session.subscribe_state();
        session.reconnect().await.unwrap();
        states.mark_unchanged();

        session.force_error("MQTT_ERROR_SOCKET_ERROR");
        assert!(states.has_changed().unwrap());
        assert_eq!(
            *states.borrow_and_update(),
            ConnectionState::Faulted("MQTT_ERROR_SOCKET_ERROR".to_string())
        );

        harness.push(publish(control(), "1"));
        let outcome = session.step(Duration::from_millis(100)).await.unwrap();

        assert_eq!(outcome, StepOutcome::Dispatched);
        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(
            harness.session_records(),
            vec![
                Record::Opened(1),
                Record::Subscribed(1, "control".to_string()),
                Record::Subscribed(1, "schedule".to_string()),
                Record::Opened(2),
                Record::Dropped(1),
                Record::Subscribed(2, "control".to_string()),
                Record::Subscribed(2, "schedule".to_string()),
                Record::Polled(2),
                Record::Relay(true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn io_error_faults_and_next_step_recovers() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();

        harness.push_error("connection reset by peer");
        let outcome = session.step(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Faulted);
        assert!(matches!(session.state(), ConnectionState::Faulted(_)));

        let outcome = session.step(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, StepOutcome::Idle);
        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(harness.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_step_returns_after_budget() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();

        let started = tokio::time::Instant::now();
        let outcome = session.step(Duration::from_millis(100)).await.unwrap();

        assert_eq!(outcome, StepOutcome::Idle);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backs_off_then_recovers() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();
        session.force_error("link lost");
        harness.fail_next_opens(2);

        let started = tokio::time::Instant::now();
        session.step(Duration::from_millis(100)).await.unwrap();

        // 100ms + 200ms backoff, then the idle poll budget
        assert_eq!(started.elapsed(), Duration::from_millis(400));
        assert_eq!(session.state(), &ConnectionState::Connected);
        assert_eq!(harness.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_are_fatal() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();
        session.force_error("link lost");
        harness.fail_next_opens(10);

        let result = session.step(Duration::from_millis(100)).await;

        assert!(matches!(
            result,
            Err(SessionError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let harness = Harness::new();
        let mut session = harness.session_with(Backoff {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            max_attempts: 0,
        });
        let cancel = CancellationToken::new();
        session.set_cancellation(cancel.clone());
        session.reconnect().await.unwrap();
        session.force_error("link lost");
        harness.fail_next_opens(u32::MAX);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            cancel.cancel();
        });
        let started = tokio::time::Instant::now();
        let outcome = session.step(Duration::from_millis(100)).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, StepOutcome::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert!(matches!(session.state(), ConnectionState::Faulted(_)));
        assert_eq!(harness.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_traffic_is_not_dispatched() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();

        harness.push_protocol();
        let outcome = session.step(Duration::from_millis(100)).await.unwrap();

        assert_eq!(outcome, StepOutcome::Protocol);
        assert_eq!(session.messages_received(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_job_blocks_later_commands() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();

        harness.push(publish(schedule(), r#"{"length": 3}"#));
        harness.push(publish(control(), "1"));

        session.step(Duration::from_millis(100)).await.unwrap();
        assert!(!session.dispatcher().state().is_open);
        assert_eq!(session.messages_received(), 1);

        session.step(Duration::from_millis(100)).await.unwrap();
        assert!(session.dispatcher().state().is_open);

        let relay = harness.relay_timeline();
        assert_eq!(relay.len(), 3);
        // the harness skips initialize(), so the first write is the job
        assert!(relay[0].1);
        assert!(!relay[1].1);
        assert_eq!(relay[1].0 - relay[0].0, Duration::from_secs(3));
        // the control message waited out the job and the settle delay
        assert!(relay[2].1);
        assert_eq!(relay[2].0 - relay[1].0, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_parks_valve_and_releases_resources() {
        let harness = Harness::new();
        let mut session = harness.session();
        session.reconnect().await.unwrap();
        harness.push(publish(control(), "1"));
        session.step(Duration::from_millis(100)).await.unwrap();

        session.shutdown().await;

        assert_eq!(session.state(), &ConnectionState::Disconnected);
        assert!(!session.dispatcher().state().is_open);
        let records = harness.records();
        assert!(records.contains(&Record::Disconnected(1)));
        assert!(records.contains(&Record::DisplayReleased));
        assert_eq!(harness.relay_timeline().last().map(|r| r.1), Some(false));
    }
}
