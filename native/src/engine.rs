// Single-consumer engine: every state change happens inside `Engine::handle`.

use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::correlator::{CorrelationTag, Correlator};
use crate::ipc::channel::{LinkEvent, ServiceBinder};
use crate::ipc::protocol::Command;
use crate::observer::ObserverSlot;
use crate::session::{ConnectionState, Session};
use crate::transfer::{StorageProvider, TransferManager};

/// Work items for the engine loop, from the facade and from the link.
#[derive(Debug)]
pub enum EngineInput {
    Connect,
    Disconnect,
    Command(Command),
    RequestRawRange { start_frame: i64, end_frame: i64 },
    Link { generation: u64, event: LinkEvent },
    Shutdown,
}

pub struct Engine {
    pub(crate) session: Session,
    pub(crate) correlator: Correlator,
    pub(crate) transfers: TransferManager,
    pub(crate) observer: Arc<ObserverSlot>,
}

impl Engine {
    pub fn new(
        config: &ClientConfig,
        binder: Arc<dyn ServiceBinder>,
        storage: Arc<dyn StorageProvider>,
        observer: Arc<ObserverSlot>,
        link_tx: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            session: Session::new(
                binder,
                config.service.clone(),
                Arc::clone(&observer),
                link_tx,
            ),
            correlator: Correlator::new(),
            transfers: TransferManager::new(storage, config.peer_identity(), Arc::clone(&observer)),
            observer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    /// Process one input to completion. Returns false once the engine should stop.
    pub fn handle(&mut self, input: EngineInput) -> bool {
        match input {
            EngineInput::Connect => self.session.connect(),
            EngineInput::Disconnect => self.disconnect(),
            EngineInput::Command(command) => {
                self.issue(command);
            }
            EngineInput::RequestRawRange {
                start_frame,
                end_frame,
            } => self
                .transfers
                .request_raw_range(&mut self.session, start_frame, end_frame),
            EngineInput::Link { generation, event } => {
                if self.session.is_current(generation) {
                    self.on_link(event);
                } else {
                    debug!(
                        "[SESSION] Dropping {:?} from stale link {}",
                        event, generation
                    );
                }
            }
            EngineInput::Shutdown => {
                self.disconnect();
                return false;
            }
        }
        true
    }

    fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(channel) => self.session.on_link_connected(channel),
            LinkEvent::Refused => self.session.on_refused(),
            LinkEvent::BindFailed(reason) => self.session.on_bind_failed(reason),
            LinkEvent::Lost => {
                if self.session.on_lost() {
                    self.teardown();
                }
            }
            LinkEvent::Inbound(envelope) => self.dispatch(envelope),
            LinkEvent::Undecodable(e) => {
                warn!("[DISPATCH] {}", e);
                self.report(e);
            }
        }
    }

    fn disconnect(&mut self) {
        if self.session.disconnect() {
            self.teardown();
        }
    }

    fn teardown(&mut self) {
        self.correlator.clear();
        self.transfers.abort_all();
    }

    /// Send a command if the session allows it. Status-answered commands are
    /// tracked by the correlator.
    fn issue(&mut self, command: Command) -> bool {
        let tag = CorrelationTag::for_kind(command.kind());
        match self.session.send(&command, tag) {
            Ok(true) => {
                if command.expects_status() {
                    self.correlator.track(tag);
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("[SESSION] {} failed: {}", command.kind(), e);
                self.report(e);
                false
            }
        }
    }

    pub(crate) fn report(&self, error: impl fmt::Display) {
        let message = error.to_string();
        self.observer.notify(|o| o.on_error(&message));
    }
}
