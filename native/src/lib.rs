//! Client engine for the imaging probe service.
//!
//! A [`Client`] binds to the service, registers a reply address, issues
//! commands, correlates status replies, dispatches events to a single
//! [`Observer`] and moves raw capture archives into permission-scoped
//! storage. All state lives in one engine loop; the facade only posts work.

pub mod client;
pub mod config;
pub mod correlator;
mod dispatcher;
pub mod engine;
pub mod ipc;
pub mod logging;
pub mod observer;
pub mod session;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{Client, ClientError};
pub use config::{ClientConfig, ConfigError, ImageConfig, ServiceTarget, StorageConfig};
pub use correlator::{CorrelationTag, Correlator, Resolution};
pub use engine::{Engine, EngineInput};
pub use ipc::protocol::{
    ButtonInfo, CompleteExam, CompressionType, PatientInfo, PosInfo, PowerInfo, ProbeInfo,
    ProcessedImage, ProcessedImageInfo, RawCapture, RawRangeReply, Rect, SettingsInfo,
    UserFunction,
};
pub use ipc::{
    BindError, Channel, ChannelError, Command, DecodeError, Envelope, Event, LinkEvent,
    LinkNotifier, MessageKind, ServiceBinder,
};
#[cfg(unix)]
pub use ipc::SocketBinder;
pub use observer::{Observer, ObserverSlot};
pub use session::{ConnectionState, Session, SessionError};
pub use transfer::{
    AccessGrant, FileStorage, PullState, PushState, RawRangePackage, ResourceHandle,
    StorageError, StorageProvider, TransferError, TransferManager,
};

/// Get the crate version.
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
