// Seams between the engine and the host binding facility.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::{DecodeError, Envelope};
use crate::config::ServiceTarget;
use crate::engine::EngineInput;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("Could not find the service {0}")]
    ServiceNotFound(String),
    #[error("No async runtime available to drive the link")]
    NoRuntime,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a live link. Sends are atomic per envelope and may be
/// issued from any thread.
pub trait Channel: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError>;
}

/// Host facility that opens and closes links to the service process.
pub trait ServiceBinder: Send + Sync {
    /// Start binding. The outcome (connected, refused, failed) and all
    /// later inbound traffic are reported through `notifier`. An `Err` means
    /// binding could not even be attempted.
    fn bind(&self, target: &ServiceTarget, notifier: LinkNotifier) -> Result<(), BindError>;

    /// Release the current link, if any. Must be safe to call repeatedly.
    fn unbind(&self);
}

/// Callback surface of the binding facility.
pub enum LinkEvent {
    Connected(Arc<dyn Channel>),
    /// The host declined to start the service.
    Refused,
    BindFailed(String),
    /// Peer-initiated teardown.
    Lost,
    Inbound(Envelope),
    /// A frame arrived that is not a valid envelope.
    Undecodable(DecodeError),
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(_) => write!(f, "Connected"),
            Self::Refused => write!(f, "Refused"),
            Self::BindFailed(reason) => write!(f, "BindFailed({})", reason),
            Self::Lost => write!(f, "Lost"),
            Self::Inbound(envelope) => write!(f, "Inbound({})", envelope.what),
            Self::Undecodable(e) => write!(f, "Undecodable({})", e),
        }
    }
}

/// Posts link events into the engine loop, stamped with the generation of
/// the `connect()` that created it. Events from an older generation are
/// discarded by the engine.
#[derive(Clone)]
pub struct LinkNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl LinkNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineInput>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the engine loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn connected(&self, channel: Arc<dyn Channel>) -> bool {
        self.post(LinkEvent::Connected(channel))
    }

    pub fn refused(&self) -> bool {
        self.post(LinkEvent::Refused)
    }

    pub fn bind_failed(&self, reason: impl Into<String>) -> bool {
        self.post(LinkEvent::BindFailed(reason.into()))
    }

    pub fn lost(&self) -> bool {
        self.post(LinkEvent::Lost)
    }

    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.post(LinkEvent::Inbound(envelope))
    }

    pub fn undecodable(&self, error: DecodeError) -> bool {
        self.post(LinkEvent::Undecodable(error))
    }

    /// Returns false once the engine loop has stopped.
    fn post(&self, event: LinkEvent) -> bool {
        self.tx
            .send(EngineInput::Link {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Reply address published to the peer at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InboundAddress(Uuid);

impl InboundAddress {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InboundAddress {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InboundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe-link-{}", self.0)
    }
}
