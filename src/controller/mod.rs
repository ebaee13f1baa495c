//! Valve control: command decoding, dispatch and the process lifecycle.
//!
//! 1. [`command`] - payload decoding into typed commands
//! 2. [`dispatcher`] - applies commands to the relay and display
//! 3. [`poll_loop`] - background task driving the broker session
//! 4. [`controller_handle`] - startup, operator input and shutdown
//!
//! # Architecture
//!
//! ```text
//! stdin ──► ValveController ──[SessionRequest]──► PollLoop ──► SessionManager ──► Dispatcher
//!  (operator)   (foreground)        (mpsc)        (background)   (step, reconnect)   (relay, LCD)
//! ```
//!
//! Relay, display and session state live on the background task only; the
//! foreground holds a cancellation token, a request sender and a read-only
//! view of the connection state.

pub mod command;
pub mod controller_handle;
pub mod dispatcher;
pub mod poll_loop;

use crate::hardware::HardwareError;
use crate::mqtt::mqtt_handler::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Initial connect failed: {0}")]
    InitialConnect(#[source] SessionError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Failed to start client daemon: {0}")]
    Launch(String),

    #[error("Client daemon failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Client daemon exited unexpectedly")]
    PollLoopExited,
}
