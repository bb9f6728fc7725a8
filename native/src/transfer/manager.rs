// Raw capture transfers: push (service announces) and pull (client requests a range).

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::storage::{AccessGrant, ResourceHandle, StorageError, StorageProvider};
use crate::correlator::CorrelationTag;
use crate::ipc::protocol::{Command, MessageKind, RawCapture, RawRangeReply};
use crate::observer::ObserverSlot;
use crate::session::{Session, SessionError};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("A raw data request is already in progress")]
    RangeInFlight,
    #[error("Capture {0} is already being transferred")]
    DuplicateCapture(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0} was not sent, session not connected")]
    NotSent(MessageKind),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Transfer aborted, session closed")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Announced,
    CopyRequested,
    Copied,
    Failed,
}

impl PushState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Copied | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Requested,
    InProgress,
    Completed,
    Failed,
}

impl PullState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A completed range download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRangePackage {
    pub handle: ResourceHandle,
    pub available: bool,
    pub size_bytes: i64,
    pub extension: String,
}

/// Finished push transfers remembered for `push_state`.
const FINISHED_HISTORY: usize = 32;

struct PushTransfer {
    capture: RawCapture,
    state: PushState,
    grant: Option<AccessGrant>,
}

struct PullTransfer {
    start_frame: i64,
    end_frame: i64,
    state: PullState,
    progress: i32,
    grant: Option<AccessGrant>,
}

pub struct TransferManager {
    storage: Arc<dyn StorageProvider>,
    peer_identity: String,
    observer: Arc<ObserverSlot>,
    push: HashMap<String, PushTransfer>,
    finished: VecDeque<(String, PushState)>,
    pull: Option<PullTransfer>,
}

impl TransferManager {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        peer_identity: impl Into<String>,
        observer: Arc<ObserverSlot>,
    ) -> Self {
        Self {
            storage,
            peer_identity: peer_identity.into(),
            observer,
            push: HashMap::new(),
            finished: VecDeque::new(),
            pull: None,
        }
    }

    /// State of a capture in flight, or of one of the most recently
    /// finished captures.
    pub fn push_state(&self, capture_id: &str) -> Option<PushState> {
        if let Some(transfer) = self.push.get(capture_id) {
            return Some(transfer.state);
        }
        self.finished
            .iter()
            .rev()
            .find(|(id, _)| id == capture_id)
            .map(|(_, state)| *state)
    }

    pub fn pushes_in_flight(&self) -> usize {
        self.push.len()
    }

    pub fn pull_state(&self) -> Option<PullState> {
        self.pull.as_ref().map(|transfer| transfer.state)
    }

    pub fn pull_progress(&self) -> Option<i32> {
        self.pull.as_ref().map(|transfer| transfer.progress)
    }

    /// Allocate a fresh shared location and grant the peer access to it.
    fn allocate(&self, scope: Option<&str>, file_name: &str) -> Result<AccessGrant, StorageError> {
        let handle = self.storage.create_writable(scope, file_name)?;
        AccessGrant::acquire(Arc::clone(&self.storage), handle, &self.peer_identity)
    }

    fn finish_push(&mut self, capture_id: String, state: PushState) {
        self.finished.retain(|(id, _)| *id != capture_id);
        self.finished.push_back((capture_id, state));
        if self.finished.len() > FINISHED_HISTORY {
            self.finished.pop_front();
        }
    }

    fn report(&self, error: impl fmt::Display) {
        let message = error.to_string();
        self.observer.notify(|o| o.on_error(&message));
    }

    // Push mode

    pub fn on_available(&mut self, session: &mut Session, capture: RawCapture) {
        if self.push.contains_key(&capture.capture_id) {
            let e = TransferError::DuplicateCapture(capture.capture_id);
            warn!("[TRANSFER] {}", e);
            self.report(e);
            return;
        }

        info!(
            "[TRANSFER] Capture {} available: {} ({} bytes)",
            capture.capture_id, capture.file_name, capture.size_bytes
        );
        self.observer
            .notify(|o| o.on_raw_capture_available(&capture));

        self.push.insert(
            capture.capture_id.clone(),
            PushTransfer {
                capture: capture.clone(),
                state: PushState::Announced,
                grant: None,
            },
        );

        match self.request_copy(session, &capture) {
            Ok(grant) => {
                if let Some(transfer) = self.push.get_mut(&capture.capture_id) {
                    transfer.grant = Some(grant);
                    transfer.state = PushState::CopyRequested;
                }
            }
            Err(e) => {
                self.push.remove(&capture.capture_id);
                warn!("[TRANSFER] Capture {} failed: {}", capture.capture_id, e);
                let message = e.to_string();
                self.observer
                    .notify(|o| o.on_raw_capture_copied(&capture, Err(message.as_str())));
                self.finish_push(capture.capture_id, PushState::Failed);
            }
        }
    }

    fn request_copy(
        &self,
        session: &mut Session,
        capture: &RawCapture,
    ) -> Result<AccessGrant, TransferError> {
        let grant = self.allocate(Some(&capture.capture_id), &capture.file_name)?;
        let command = Command::CopyRawCapture {
            capture_id: capture.capture_id.clone(),
            writable_uri: grant.handle().uri().to_string(),
        };

        if session.send(&command, CorrelationTag::for_kind(command.kind()))? {
            Ok(grant)
        } else {
            Err(TransferError::NotSent(command.kind()))
        }
    }

    pub fn on_copied(&mut self, capture_id: &str, error: Option<String>) {
        let Some(mut transfer) = self.push.remove(capture_id) else {
            match self.push_state(capture_id) {
                Some(state) => warn!(
                    "[TRANSFER] Copy reply for capture {} in state {:?}",
                    capture_id, state
                ),
                None => warn!("[TRANSFER] Copy reply for unknown capture {}", capture_id),
            }
            return;
        };

        let grant = transfer.grant.take();
        let state = match (error, &grant) {
            (None, Some(grant)) => {
                info!("[TRANSFER] Capture {} copied", capture_id);
                self.observer
                    .notify(|o| o.on_raw_capture_copied(&transfer.capture, Ok(grant.handle())));
                PushState::Copied
            }
            (Some(message), _) => {
                warn!("[TRANSFER] Capture {} copy failed: {}", capture_id, message);
                self.observer
                    .notify(|o| o.on_raw_capture_copied(&transfer.capture, Err(message.as_str())));
                PushState::Failed
            }
            (None, None) => {
                let message = TransferError::Aborted.to_string();
                self.observer
                    .notify(|o| o.on_raw_capture_copied(&transfer.capture, Err(message.as_str())));
                PushState::Failed
            }
        };
        drop(grant);
        self.finish_push(transfer.capture.capture_id, state);
    }

    // Pull mode

    pub fn request_raw_range(&mut self, session: &mut Session, start_frame: i64, end_frame: i64) {
        if let Some(pull) = &self.pull {
            if !pull.state.is_terminal() {
                warn!(
                    "[TRANSFER] Range {}..{} rejected, {}..{} still pending",
                    start_frame, end_frame, pull.start_frame, pull.end_frame
                );
                self.report(TransferError::RangeInFlight);
                return;
            }
        }
        if !session.is_connected() || session.license_revoked() {
            debug!("[TRANSFER] Range request suppressed, session not usable");
            return;
        }

        let file_name = format!("raw_{}", chrono::Utc::now().timestamp_millis());
        match self.send_range_request(session, &file_name, start_frame, end_frame) {
            Ok(grant) => {
                info!(
                    "[TRANSFER] Requested frames {}..{} into {}",
                    start_frame,
                    end_frame,
                    grant.handle().uri()
                );
                self.pull = Some(PullTransfer {
                    start_frame,
                    end_frame,
                    state: PullState::Requested,
                    progress: 0,
                    grant: Some(grant),
                });
            }
            Err(e) => {
                warn!("[TRANSFER] Range request failed: {}", e);
                let message = e.to_string();
                self.observer.notify(|o| o.on_raw_range_returned(Err(message.as_str())));
            }
        }
    }

    fn send_range_request(
        &self,
        session: &mut Session,
        file_name: &str,
        start_frame: i64,
        end_frame: i64,
    ) -> Result<AccessGrant, TransferError> {
        let grant = self.allocate(None, file_name)?;
        let command = Command::RequestRawRange {
            start_frame,
            end_frame,
            writable_uri: grant.handle().uri().to_string(),
        };

        if session.send(&command, CorrelationTag::for_kind(command.kind()))? {
            Ok(grant)
        } else {
            Err(TransferError::NotSent(command.kind()))
        }
    }

    pub fn on_progress(&mut self, percent: i32) {
        let Some(pull) = self.pull.as_mut().filter(|pull| !pull.state.is_terminal()) else {
            debug!("[TRANSFER] Progress {}% with no range pending", percent);
            return;
        };

        pull.state = PullState::InProgress;
        pull.progress = percent;
        self.observer.notify(|o| o.on_raw_range_progress(percent));
    }

    pub fn on_range_returned(&mut self, reply: RawRangeReply) {
        let Some(pull) = self.pull.as_mut().filter(|pull| !pull.state.is_terminal()) else {
            warn!("[TRANSFER] Range reply with no range pending");
            return;
        };

        let mut grant = pull.grant.take();
        let outcome = match (reply, grant.as_mut()) {
            (RawRangeReply::Failed(message), _) => Err(message),
            (_, None) => Err(TransferError::Aborted.to_string()),
            (
                RawRangeReply::Ready {
                    available,
                    package_size,
                    package_extension,
                },
                Some(grant),
            ) => finish_package(grant, available, package_size, package_extension),
        };

        match &outcome {
            Ok(package) => {
                info!(
                    "[TRANSFER] Range complete: {} ({} bytes)",
                    package.handle.uri(),
                    package.size_bytes
                );
                pull.state = PullState::Completed;
                pull.progress = 100;
                self.observer.notify(|o| o.on_raw_range_returned(Ok(package)));
            }
            Err(message) => {
                warn!("[TRANSFER] Range failed: {}", message);
                pull.state = PullState::Failed;
                self.observer
                    .notify(|o| o.on_raw_range_returned(Err(message.as_str())));
            }
        }
        drop(grant);
    }

    /// Fail every transfer still in flight and release its grant.
    pub fn abort_all(&mut self) {
        let message = TransferError::Aborted.to_string();

        let aborted: Vec<PushTransfer> = self.push.drain().map(|(_, transfer)| transfer).collect();
        for mut transfer in aborted {
            info!("[TRANSFER] Aborting capture {}", transfer.capture.capture_id);
            drop(transfer.grant.take());
            self.observer
                .notify(|o| o.on_raw_capture_copied(&transfer.capture, Err(message.as_str())));
            self.finish_push(transfer.capture.capture_id, PushState::Failed);
        }

        if let Some(pull) = self.pull.as_mut().filter(|pull| !pull.state.is_terminal()) {
            info!("[TRANSFER] Aborting range request");
            pull.state = PullState::Failed;
            drop(pull.grant.take());
            self.observer
                .notify(|o| o.on_raw_range_returned(Err(message.as_str())));
        }
    }
}

fn finish_package(
    grant: &mut AccessGrant,
    available: bool,
    size_bytes: i64,
    extension: String,
) -> Result<RawRangePackage, String> {
    if !extension.is_empty() {
        let suffix = if extension.starts_with('.') {
            extension.clone()
        } else {
            format!(".{}", extension)
        };
        let file_name = format!("{}{}", grant.handle().file_name(), suffix);
        grant
            .rename(&file_name)
            .map_err(|e| format!("Could not rename raw data to {}: {}", file_name, e))?;
    }

    Ok(RawRangePackage {
        handle: grant.handle().clone(),
        available,
        size_bytes,
        extension,
    })
}
