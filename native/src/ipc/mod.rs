// Wire protocol and transport to the probe service.

pub mod channel;
pub mod protocol;
#[cfg(unix)]
pub mod socket;

pub use channel::{
    BindError, Channel, ChannelError, InboundAddress, LinkEvent, LinkNotifier, ServiceBinder,
};
pub use protocol::{Command, DecodeError, Envelope, Event, MessageKind};
#[cfg(unix)]
pub use socket::SocketBinder;

pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB safety limit
