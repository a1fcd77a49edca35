//! Progress/log boundary between the core and whatever displays it.
//!
//! The core never renders anything itself. It emits coarse events and the
//! consumer (a window, a terminal, a test) decides what to do with them.

use tokio::sync::mpsc;

use crate::supervisor::state_machine::ServerState;

/// A discrete event emitted by the provisioner or the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Human-readable status, no percentage
    Status(String),
    /// One line of shell or server output
    Log(String),
    /// Server lifecycle transition
    Lifecycle(ServerState),
    /// The managed server exited while it was supposed to be running
    AbnormalExit { code: Option<i32> },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    fn status(&self, message: &str) {
        self.emit(ProgressEvent::Status(message.to_string()));
    }

    fn log(&self, line: &str) {
        self.emit(ProgressEvent::Log(line.to_string()));
    }
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Status(msg) => tracing::info!("{}", msg),
            ProgressEvent::Log(line) => tracing::debug!(target: "runbox::output", "{}", line),
            ProgressEvent::Lifecycle(state) => tracing::info!("Server state: {:?}", state),
            ProgressEvent::AbnormalExit { code } => {
                tracing::error!("Server exited unexpectedly (code: {:?})", code)
            }
        }
    }
}

/// Pushes events into an unbounded channel. Sending never blocks the producer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // 수신 측이 사라졌으면 조용히 버린다
        let _ = self.tx.send(event);
    }
}
