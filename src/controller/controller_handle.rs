//! Controller lifecycle with statum typestates.
//!
//! ```text
//! Booting ──start()──► Running ──supervise()──► Stopped
//! ```
//!
//! `start` brings up the hardware, makes the first broker connection (fatal on
//! failure) and launches the poll loop. `supervise` then follows the operator:
//! every line on stdin injects a socket error, end of input shuts down.

use super::dispatcher::{Dispatcher, DispatcherSettings};
use super::poll_loop::{PollLoop, PollLoopHandle, PollSettings};
use super::ControllerError;
use crate::config::Config;
use crate::hardware::{self, netaddr::InterfaceResolver};
use crate::mqtt::config::BrokerEndpoint;
use crate::mqtt::mqtt_handler::{ConnectionState, SessionManager};
use crate::mqtt::transport::Connector;
use statum::{machine, state};
use std::io::BufRead;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const INJECTED_FAULT: &str = "MQTT_ERROR_SOCKET_ERROR";
pub const SHUTDOWN_REASON: &str = "operator shutdown";

/// What the operator asked for on the foreground.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorSignal {
    InjectFault,
    Quit,
}

/// Reads stdin on a dedicated thread: a line is a fault injection, EOF quits.
///
/// A plain thread rather than a runtime blocking task, so an idle stdin
/// never holds up process exit.
pub fn spawn_stdin_reader() -> Result<mpsc::Receiver<OperatorSignal>, ControllerError> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() || tx.blocking_send(OperatorSignal::InjectFault).is_err() {
                    break;
                }
            }
            let _ = tx.blocking_send(OperatorSignal::Quit);
        })
        .map_err(|e| ControllerError::Launch(e.to_string()))?;
    Ok(rx)
}

#[state]
#[derive(Debug, Clone)]
pub enum ControllerPhase {
    Booting,
    Running,
    Stopped,
}

#[machine]
pub struct ValveController<S: ControllerPhase> {
    config: Config,
    endpoint: Arc<BrokerEndpoint>,
    poll_loop: Option<PollLoopHandle>,
}

impl<S: ControllerPhase> ValveController<S> {
    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }
}

impl ValveController<Booting> {
    pub fn create(config: Config) -> Self {
        let endpoint = Arc::new(config.broker.endpoint());
        Self::new(config, endpoint, None)
    }

    /// Opens the configured relay and display, then starts as [`Self::start_with`].
    pub async fn start<C: Connector + 'static>(
        self,
        connector: C,
    ) -> Result<ValveController<Running>, ControllerError> {
        let actuator = hardware::open_actuator(&self.config.relay)?;
        let display = hardware::open_display(&self.config.display);
        let resolver = Box::new(InterfaceResolver::new(self.config.network.interface.clone()));
        let settings = DispatcherSettings {
            tick: self.config.watering.tick(),
            schedule_settle: self.config.watering.schedule_settle(),
        };

        let dispatcher = Dispatcher::new(actuator, display, resolver, settings);
        self.start_with(connector, dispatcher).await
    }

    /// Closes the valve, connects and launches the poll loop.
    ///
    /// A failed first connect releases the display and is returned as
    /// [`ControllerError::InitialConnect`].
    pub async fn start_with<C: Connector + 'static>(
        mut self,
        connector: C,
        mut dispatcher: Dispatcher,
    ) -> Result<ValveController<Running>, ControllerError> {
        let runtime = Handle::try_current().map_err(|e| ControllerError::Launch(e.to_string()))?;

        dispatcher.initialize();

        let mut session = SessionManager::new(
            self.endpoint.clone(),
            connector,
            dispatcher,
            self.config.session.backoff(),
        );
        if let Err(e) = session.reconnect().await {
            error!("Initial connect to {}:{} failed", self.endpoint.host, self.endpoint.port);
            session.shutdown().await;
            return Err(ControllerError::InitialConnect(e));
        }

        let handle = PollLoop::spawn_on(&runtime, session, PollSettings::from(&self.config.session));
        self.poll_loop = Some(handle);

        info!("Controller running");
        Ok(self.transition())
    }
}

impl ValveController<Running> {
    pub fn connection_state(&self) -> ConnectionState {
        self.poll_loop
            .as_ref()
            .map(|handle| handle.connection_state())
            .unwrap_or_default()
    }

    /// Follows operator input until quit, or until the poll loop dies.
    pub async fn supervise(
        mut self,
        mut operator: mpsc::Receiver<OperatorSignal>,
    ) -> Result<ValveController<Stopped>, ControllerError> {
        let Some(mut poll_loop) = self.poll_loop.take() else {
            return Err(ControllerError::PollLoopExited);
        };

        loop {
            tokio::select! {
                signal = operator.recv() => match signal {
                    Some(OperatorSignal::InjectFault) => {
                        warn!("Injecting error: \"{}\"", INJECTED_FAULT);
                        poll_loop.force_error(INJECTED_FAULT).await;
                    }
                    Some(OperatorSignal::Quit) | None => {
                        debug!("Operator input closed");
                        break;
                    }
                },
                error = poll_loop.stopped() => {
                    error!("Client daemon stopped: {}", error);
                    return Err(error);
                }
            }
        }

        info!("Disconnecting...");
        poll_loop.shutdown(SHUTDOWN_REASON).await?;
        Ok(self.transition())
    }
}

impl ValveController<Stopped> {}
