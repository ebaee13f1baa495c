//! Background task pumping the session: one `step()` per poll interval.
//!
//! The loop never looks at message content. Operator requests arrive over an
//! mpsc channel and are applied between steps. Cancellation is observed
//! between steps and inside the session's reconnect backoff, never during a
//! dispatch, so a running watering job always finishes.

use super::ControllerError;
use crate::mqtt::config::SessionConfig;
use crate::mqtt::mqtt_handler::{ConnectionState, SessionError, SessionManager};
use crate::mqtt::transport::Connector;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 16;

/// Requests the foreground may send into the polling task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionRequest {
    ForceError(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub step_budget: Duration,
}

impl From<&SessionConfig> for PollSettings {
    fn from(config: &SessionConfig) -> Self {
        PollSettings {
            interval: config.poll_interval(),
            step_budget: config.step_budget(),
        }
    }
}

pub struct PollLoop<C: Connector> {
    session: SessionManager<C>,
    settings: PollSettings,
    requests: mpsc::Receiver<SessionRequest>,
    cancel: CancellationToken,
}

impl<C: Connector + 'static> PollLoop<C> {
    /// Moves the session onto its own task on `runtime`.
    pub fn spawn_on(
        runtime: &Handle,
        mut session: SessionManager<C>,
        settings: PollSettings,
    ) -> PollLoopHandle {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CAPACITY);
        let cancel = CancellationToken::new();
        session.set_cancellation(cancel.clone());
        let connection = session.subscribe_state();

        let poll_loop = PollLoop {
            session,
            settings,
            requests: request_rx,
            cancel: cancel.clone(),
        };
        let task = runtime.spawn(poll_loop.run());
        info!("Client daemon init success!");

        PollLoopHandle {
            requests: request_tx,
            cancel,
            connection,
            task,
        }
    }

    async fn run(mut self) -> Result<(), SessionError> {
        info!("Poll loop running every {:?}", self.settings.interval);
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                Some(request) = self.requests.recv() => {
                    self.apply(request);
                    continue;
                }
                _ = self.cancel.cancelled() => {
                    info!("Poll loop cancelled");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.session.step(self.settings.step_budget).await {
                Ok(outcome) => debug!("Step: {:?}", outcome),
                Err(e) => {
                    error!("Poll loop stopping: {}", e);
                    break Err(e);
                }
            }
        };

        info!("Poll loop exiting, session {}", self.session.state());
        self.session.shutdown().await;
        result
    }

    fn apply(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::ForceError(reason) => self.session.force_error(&reason),
        }
    }
}

/// Foreground side of a running poll loop.
#[derive(Debug)]
pub struct PollLoopHandle {
    requests: mpsc::Sender<SessionRequest>,
    cancel: CancellationToken,
    connection: watch::Receiver<ConnectionState>,
    task: JoinHandle<Result<(), SessionError>>,
}

impl PollLoopHandle {
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub async fn force_error(&self, reason: &str) {
        let request = SessionRequest::ForceError(reason.to_string());
        if self.requests.send(request).await.is_err() {
            warn!("Poll loop is gone, request dropped");
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves when the task ends on its own, which only happens on a fatal
    /// error. Must not be awaited again once it has resolved.
    pub async fn stopped(&mut self) -> ControllerError {
        match (&mut self.task).await {
            Ok(Ok(())) => ControllerError::PollLoopExited,
            Ok(Err(e)) => ControllerError::Session(e),
            Err(e) => ControllerError::Task(e),
        }
    }

    /// Faults the session for the record, stops the loop and waits for it to
    /// close the valve and release its resources.
    pub async fn shutdown(self, reason: &str) -> Result<(), ControllerError> {
        self.force_error(reason).await;
        self.cancel.cancel();

        match self.task.await {
            Ok(Ok(())) => {
                info!("Poll loop stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ControllerError::Session(e)),
            Err(e) => Err(ControllerError::Task(e)),
        }
    }
}
