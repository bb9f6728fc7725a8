// Connection lifecycle with the service: bind, register, unregister, unbind.

use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ServiceTarget;
use crate::correlator::CorrelationTag;
use crate::engine::EngineInput;
use crate::ipc::channel::{Channel, ChannelError, InboundAddress, LinkNotifier, ServiceBinder};
use crate::ipc::protocol::Command;
use crate::logging;
use crate::observer::ObserverSlot;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Bind failed: {0}")]
    BindFailed(String),
    #[error("Cannot bind to {0}, is the service running?")]
    Refused(String),
    #[error("Send failed: {0}")]
    Send(#[from] ChannelError),
    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Binding,
    Bound,
    Registering,
    Connected,
    Disconnecting,
}

/// One logical connection to the service. The only component that touches
/// the channel.
pub struct Session {
    binder: Arc<dyn ServiceBinder>,
    target: ServiceTarget,
    observer: Arc<ObserverSlot>,
    link_tx: mpsc::UnboundedSender<EngineInput>,
    state: ConnectionState,
    channel: Option<Arc<dyn Channel>>,
    address: Option<InboundAddress>,
    generation: u64,
    license_revoked: bool,
}

impl Session {
    pub fn new(
        binder: Arc<dyn ServiceBinder>,
        target: ServiceTarget,
        observer: Arc<ObserverSlot>,
        link_tx: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            binder,
            target,
            observer,
            link_tx,
            state: ConnectionState::Disconnected,
            channel: None,
            address: None,
            generation: 0,
            license_revoked: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Reply address, valid from Bound onwards.
    pub fn address(&self) -> Option<InboundAddress> {
        self.address
    }

    pub fn license_revoked(&self) -> bool {
        self.license_revoked
    }

    /// Whether link events stamped with `generation` belong to this binding.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state != ConnectionState::Disconnected
    }

    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!("[SESSION] connect() ignored in state {:?}", self.state);
            return;
        }

        self.generation += 1;
        self.license_revoked = false;
        self.state = ConnectionState::Binding;
        info!(
            "[SESSION] Binding to {}/{}",
            self.target.package, self.target.service
        );

        let notifier = LinkNotifier::new(self.generation, self.link_tx.clone());
        if let Err(e) = self.binder.bind(&self.target, notifier) {
            self.on_bind_failed(e.to_string());
        }
    }

    pub fn on_link_connected(&mut self, channel: Arc<dyn Channel>) {
        if self.state != ConnectionState::Binding {
            warn!(
                "[SESSION] Link came up in state {:?}, ignoring",
                self.state
            );
            return;
        }

        let address = InboundAddress::new();
        info!("[SESSION] Bound, registering as {}", address);
        self.channel = Some(channel);
        self.address = Some(address);
        self.state = ConnectionState::Bound;
        self.register();
    }

    fn register(&mut self) {
        self.state = ConnectionState::Registering;
        if let Err(e) = self.transmit(&Command::RegisterClient, CorrelationTag::REGISTRATION) {
            error!("[SESSION] Registration send failed: {}", e);
            self.state = ConnectionState::Bound;
            self.report(&e);
        }
    }

    pub fn on_registration_status(&mut self, status: i32) {
        if self.state != ConnectionState::Registering {
            debug!(
                "[SESSION] Registration status {} ignored in state {:?}",
                status, self.state
            );
            return;
        }

        if status == 0 {
            info!("[SESSION] Registered");
            self.state = ConnectionState::Connected;
            self.observer.notify(|o| o.on_connected(true));
        } else {
            warn!("[SESSION] Registration rejected with status {}", status);
            self.state = ConnectionState::Bound;
            self.observer.notify(|o| o.on_connected(false));
        }
    }

    pub fn on_refused(&mut self) {
        if self.state != ConnectionState::Binding {
            return;
        }
        self.binder.unbind();
        self.state = ConnectionState::Disconnected;
        let e = SessionError::Refused(self.target.package.clone());
        logging::log_critical_error("SESSION", &e.to_string());
        self.report(&e);
    }

    pub fn on_bind_failed(&mut self, reason: String) {
        if self.state != ConnectionState::Binding {
            return;
        }
        self.state = ConnectionState::Disconnected;
        let e = SessionError::BindFailed(reason);
        logging::log_critical_error("SESSION", &e.to_string());
        self.report(&e);
    }

    /// Peer-initiated teardown. Returns true if a live link was dropped.
    pub fn on_lost(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }

        warn!("[SESSION] Service went away in state {:?}", self.state);
        self.release();
        self.observer.notify(|o| o.on_connected(false));
        true
    }

    /// Returns true if there was anything to tear down.
    pub fn disconnect(&mut self) -> bool {
        if self.state == ConnectionState::Disconnected {
            debug!("[SESSION] disconnect() ignored, already disconnected");
            return false;
        }

        let registered = matches!(
            self.state,
            ConnectionState::Registering | ConnectionState::Connected
        );
        self.state = ConnectionState::Disconnecting;

        if registered {
            let tag = CorrelationTag::for_kind(Command::UnregisterClient.kind());
            if let Err(e) = self.transmit(&Command::UnregisterClient, tag) {
                warn!("[SESSION] Unregister failed, tearing down anyway: {}", e);
            }
        }

        self.release();
        info!("[SESSION] Disconnected");
        self.observer.notify(|o| o.on_connected(false));
        true
    }

    pub fn revoke_license(&mut self) {
        if !self.license_revoked {
            warn!("[SESSION] License revoked, commands suppressed until reconnect");
        }
        self.license_revoked = true;
    }

    /// Send a command. `Ok(false)` means it was suppressed because the
    /// session is not connected or the license was revoked.
    pub fn send(&mut self, command: &Command, tag: CorrelationTag) -> Result<bool, SessionError> {
        if self.state != ConnectionState::Connected {
            debug!(
                "[SESSION] {} suppressed in state {:?}",
                command.kind(),
                self.state
            );
            return Ok(false);
        }
        if self.license_revoked {
            debug!("[SESSION] {} suppressed, no license", command.kind());
            return Ok(false);
        }

        self.transmit(command, tag)?;
        Ok(true)
    }

    fn transmit(&self, command: &Command, tag: CorrelationTag) -> Result<(), SessionError> {
        let (Some(channel), Some(address)) = (&self.channel, self.address) else {
            return Err(SessionError::NotConnected);
        };

        let envelope = command
            .encode()
            .map_err(ChannelError::from)?
            .with_arg1(tag.value())
            .with_reply_to(address.to_string());

        debug!("[SESSION] Sending {}", command.kind());
        channel.send(envelope)?;
        Ok(())
    }

    fn release(&mut self) {
        self.binder.unbind();
        self.channel = None;
        self.address = None;
        self.state = ConnectionState::Disconnected;
    }

    fn report(&self, error: &SessionError) {
        let message = error.to_string();
        self.observer.notify(|o| o.on_error(&message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{Event, MessageKind};
    use crate::testing::{Harness, Seen};

    #[test]
    fn connect_is_idempotent() {
        let mut harness = Harness::new();
        harness.input(EngineInput::Connect);
        harness.input(EngineInput::Connect);

        assert_eq!(harness.binder.binds(), 1);
        assert_eq!(harness.engine.state(), ConnectionState::Binding);
    }

    #[test]
    fn disconnect_when_disconnected_is_a_no_op() {
        let mut harness = Harness::new();
        harness.disconnect();
        harness.disconnect();

        assert_eq!(harness.binder.unbinds(), 0);
        assert!(harness.observer.seen().is_empty());
    }

    #[test]
    fn registration_publishes_reply_address() {
        let mut harness = Harness::new();
        harness.input(EngineInput::Connect);
        harness.link_up();

        assert_eq!(harness.engine.state(), ConnectionState::Registering);
        let register = harness.channel.last_sent();
        assert_eq!(register.what, MessageKind::RegisterClient.code());
        assert_eq!(register.arg1, CorrelationTag::REGISTRATION.value());
        let address = harness.engine.session.address().unwrap();
        assert_eq!(register.reply_to, Some(address.to_string()));
    }

    #[test]
    fn registration_success_connects() {
        let mut harness = Harness::new();
        harness.connect();

        assert_eq!(harness.engine.state(), ConnectionState::Connected);
        assert_eq!(harness.observer.seen(), vec![Seen::Connected(true)]);
    }

    #[test]
    fn registration_failure_stays_bound() {
        let mut harness = Harness::new();
        harness.input(EngineInput::Connect);
        harness.link_up();
        harness.deliver(Event::ReturnStatus {
            tag: CorrelationTag::REGISTRATION.value(),
            status: -1,
        });

        assert_eq!(harness.engine.state(), ConnectionState::Bound);
        assert_eq!(harness.observer.seen(), vec![Seen::Connected(false)]);

        let sent = harness.channel.sent().len();
        harness.send_command(Command::AskProbeInfo);
        assert_eq!(harness.channel.sent().len(), sent);
    }

    #[test]
    fn commands_are_dropped_until_connected() {
        let mut harness = Harness::new();
        harness.send_command(Command::AskDepth);
        harness.input(EngineInput::Connect);
        harness.send_command(Command::AskGain);
        harness.link_up();
        harness.send_command(Command::AskFreeze);

        assert_eq!(
            harness.channel.sent_kinds(),
            vec![MessageKind::RegisterClient.code()]
        );
    }

    #[test]
    fn connected_commands_carry_kind_tag() {
        let mut harness = Harness::connected();
        harness.send_command(Command::AskScanArea);

        let sent = harness.channel.last_sent();
        assert_eq!(sent.what, MessageKind::AskScanArea.code());
        assert_eq!(sent.arg1, MessageKind::AskScanArea.code());
        assert!(sent.reply_to.is_some());
    }

    #[test]
    fn disconnect_unregisters_then_unbinds() {
        let mut harness = Harness::connected();
        harness.disconnect();

        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);
        assert_eq!(
            harness.channel.sent_kinds().last(),
            Some(&MessageKind::UnregisterClient.code())
        );
        assert_eq!(harness.binder.unbinds(), 1);
        assert_eq!(harness.observer.seen(), vec![Seen::Connected(false)]);
        assert_eq!(harness.engine.session.address(), None);
    }

    #[test]
    fn disconnect_while_binding_skips_unregister() {
        let mut harness = Harness::new();
        harness.input(EngineInput::Connect);
        harness.disconnect();

        assert!(harness.channel.sent().is_empty());
        assert_eq!(harness.binder.unbinds(), 1);
        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);

        harness.link_up();
        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn bind_failure_reports_and_returns_to_disconnected() {
        let mut harness = Harness::new();
        harness.binder.set_missing(true);
        harness.input(EngineInput::Connect);

        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);
        assert!(matches!(
            harness.observer.seen().as_slice(),
            [Seen::Error(message)] if message.starts_with("Bind failed: Could not find the service")
        ));

        harness.binder.set_missing(false);
        harness.input(EngineInput::Connect);
        assert_eq!(harness.engine.state(), ConnectionState::Binding);
    }

    #[test]
    fn refusal_is_distinct_from_bind_failure() {
        let mut harness = Harness::new();
        harness.input(EngineInput::Connect);
        harness.binder.notifier().refused();
        harness.pump();

        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);
        assert!(matches!(
            harness.observer.seen().as_slice(),
            [Seen::Error(message)] if message.contains("is the service running")
        ));
    }

    #[test]
    fn peer_crash_notifies_disconnected() {
        let mut harness = Harness::connected();
        let stale = harness.binder.notifier();
        stale.lost();
        harness.pump();

        assert_eq!(harness.engine.state(), ConnectionState::Disconnected);
        assert_eq!(harness.observer.seen(), vec![Seen::Connected(false)]);

        stale.deliver(Event::FreezeChanged(true).encode().unwrap());
        harness.pump();
        assert_eq!(harness.observer.seen().len(), 1);
    }

    #[test]
    fn stale_link_events_are_dropped_after_reconnect() {
        let mut harness = Harness::connected();
        let old = harness.binder.notifier();
        harness.disconnect();
        harness.connect();
        harness.observer.clear();

        old.lost();
        harness.pump();

        assert_eq!(harness.engine.state(), ConnectionState::Connected);
        assert!(harness.observer.seen().is_empty());
    }
}
