// Stub collaborators shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::config::{ClientConfig, ServiceTarget};
use crate::correlator::CorrelationTag;
use crate::engine::{Engine, EngineInput};
use crate::ipc::channel::{BindError, Channel, ChannelError, LinkNotifier, ServiceBinder};
use crate::ipc::protocol::{
    ButtonInfo, Command, Envelope, Event, MessageKind, PatientInfo, PowerInfo, ProbeInfo,
    ProcessedImage, RawCapture, Rect,
};
use crate::ipc::DecodeError;
use crate::observer::{Observer, ObserverSlot};
use crate::transfer::{RawRangePackage, ResourceHandle, StorageError, StorageProvider};

#[derive(Default)]
pub(crate) struct StubChannel {
    sent: Mutex<Vec<Envelope>>,
}

impl StubChannel {
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> Envelope {
        self.sent().pop().expect("nothing was sent")
    }

    pub fn sent_kinds(&self) -> Vec<i32> {
        self.sent().iter().map(|envelope| envelope.what).collect()
    }
}

impl Channel for StubChannel {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct StubBinder {
    notifiers: Mutex<Vec<LinkNotifier>>,
    unbinds: AtomicUsize,
    missing: Mutex<bool>,
}

impl StubBinder {
    pub fn binds(&self) -> usize {
        self.notifiers.lock().unwrap().len()
    }

    pub fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }

    pub fn notifier(&self) -> LinkNotifier {
        self.notifiers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("bind was never called")
    }

    pub fn set_missing(&self, missing: bool) {
        *self.missing.lock().unwrap() = missing;
    }
}

impl ServiceBinder for StubBinder {
    fn bind(&self, target: &ServiceTarget, notifier: LinkNotifier) -> Result<(), BindError> {
        if *self.missing.lock().unwrap() {
            return Err(BindError::ServiceNotFound(target.package.clone()));
        }
        self.notifiers.lock().unwrap().push(notifier);
        Ok(())
    }

    fn unbind(&self) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records grants and revocations by file name.
#[derive(Default)]
pub(crate) struct StubStorage {
    granted: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
    failing: Mutex<bool>,
}

impl StubStorage {
    pub fn granted(&self) -> Vec<String> {
        self.granted.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }

    /// Make every new location fail to be created.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn locate(scope: Option<&str>, file_name: &str) -> ResourceHandle {
        let relative = match scope {
            Some(scope) => format!("raw_data/{}/{}", scope, file_name),
            None => format!("raw_data/{}", file_name),
        };
        ResourceHandle::new(
            format!("/stub/{}", relative),
            format!("content://stub/{}", relative),
        )
    }
}

impl StorageProvider for StubStorage {
    fn create_writable(
        &self,
        scope: Option<&str>,
        file_name: &str,
    ) -> Result<ResourceHandle, StorageError> {
        if *self.failing.lock().unwrap() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only storage",
            )));
        }
        if file_name.is_empty() {
            return Err(StorageError::InvalidName(file_name.to_string()));
        }
        Ok(Self::locate(scope, file_name))
    }

    fn rename(
        &self,
        handle: &ResourceHandle,
        file_name: &str,
    ) -> Result<ResourceHandle, StorageError> {
        Ok(handle.with_file_name(file_name))
    }

    fn grant_access(&self, handle: &ResourceHandle, _peer: &str) -> Result<(), StorageError> {
        self.granted
            .lock()
            .unwrap()
            .push(handle.file_name().to_string());
        Ok(())
    }

    fn revoke_access(&self, handle: &ResourceHandle) -> Result<(), StorageError> {
        self.revoked
            .lock()
            .unwrap()
            .push(handle.file_name().to_string());
        Ok(())
    }
}

/// Observer callbacks flattened for assertions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Seen {
    Connected(bool),
    Error(String),
    FreezeChanged(bool),
    FreezeReturned(bool),
    DepthChanged(f64),
    DepthReturned(f64),
    GainChanged(f64),
    GainReturned(f64),
    Image(usize),
    Button(i32),
    ScanAreaChanged(Rect),
    ScanAreaReturned(Rect),
    ProbeInfo(ProbeInfo),
    PatientInfo(PatientInfo),
    License(bool),
    Power(PowerInfo),
    ReturnStatus(Option<MessageKind>, i32),
    CaptureAvailable(String),
    CaptureCopied(String, Result<String, String>),
    RangeProgress(i32),
    RangeReturned(Result<(String, i64), String>),
}

#[derive(Clone, Default)]
pub(crate) struct RecordingObserver {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }

    fn record(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}

impl Observer for RecordingObserver {
    fn on_connected(&self, connected: bool) {
        self.record(Seen::Connected(connected));
    }

    fn on_error(&self, message: &str) {
        self.record(Seen::Error(message.to_string()));
    }

    fn on_freeze_changed(&self, frozen: bool) {
        self.record(Seen::FreezeChanged(frozen));
    }

    fn on_freeze_returned(&self, frozen: bool) {
        self.record(Seen::FreezeReturned(frozen));
    }

    fn on_depth_changed(&self, depth_cm: f64) {
        self.record(Seen::DepthChanged(depth_cm));
    }

    fn on_depth_returned(&self, depth_cm: f64) {
        self.record(Seen::DepthReturned(depth_cm));
    }

    fn on_gain_changed(&self, gain: f64) {
        self.record(Seen::GainChanged(gain));
    }

    fn on_gain_returned(&self, gain: f64) {
        self.record(Seen::GainReturned(gain));
    }

    fn on_new_processed_image(&self, image: &ProcessedImage) {
        self.record(Seen::Image(image.data.len()));
    }

    fn on_button_event(&self, button: &ButtonInfo) {
        self.record(Seen::Button(button.id));
    }

    fn on_scan_area_changed(&self, area: &Rect) {
        self.record(Seen::ScanAreaChanged(*area));
    }

    fn on_scan_area_returned(&self, area: &Rect) {
        self.record(Seen::ScanAreaReturned(*area));
    }

    fn on_probe_info(&self, info: &ProbeInfo) {
        self.record(Seen::ProbeInfo(*info));
    }

    fn on_patient_info(&self, info: &PatientInfo) {
        self.record(Seen::PatientInfo(info.clone()));
    }

    fn on_license_changed(&self, licensed: bool) {
        self.record(Seen::License(licensed));
    }

    fn on_power_event(&self, power: &PowerInfo) {
        self.record(Seen::Power(*power));
    }

    fn on_return_status(&self, kind: Option<MessageKind>, status: i32) {
        self.record(Seen::ReturnStatus(kind, status));
    }

    fn on_raw_capture_available(&self, capture: &RawCapture) {
        self.record(Seen::CaptureAvailable(capture.capture_id.clone()));
    }

    fn on_raw_capture_copied(&self, capture: &RawCapture, result: Result<&ResourceHandle, &str>) {
        self.record(Seen::CaptureCopied(
            capture.capture_id.clone(),
            result
                .map(|handle| handle.uri().to_string())
                .map_err(str::to_string),
        ));
    }

    fn on_raw_range_progress(&self, percent: i32) {
        self.record(Seen::RangeProgress(percent));
    }

    fn on_raw_range_returned(&self, result: Result<&RawRangePackage, &str>) {
        self.record(Seen::RangeReturned(
            result
                .map(|package| (package.handle.uri().to_string(), package.size_bytes))
                .map_err(str::to_string),
        ));
    }
}

/// An engine wired to stubs, driven synchronously by draining its queue.
pub(crate) struct Harness {
    pub engine: Engine,
    pub rx: mpsc::UnboundedReceiver<EngineInput>,
    pub binder: Arc<StubBinder>,
    pub storage: Arc<StubStorage>,
    pub channel: Arc<StubChannel>,
    pub observer: RecordingObserver,
}

impl Harness {
    pub fn new() -> Self {
        let storage = Arc::new(StubStorage::default());
        Self::build(storage.clone(), storage)
    }

    /// A connected harness whose transfers go to `provider` instead of the
    /// recording stub.
    pub fn connected_with(provider: Arc<dyn StorageProvider>) -> Self {
        let mut harness = Self::build(provider, Arc::new(StubStorage::default()));
        harness.connect();
        harness.observer.clear();
        harness
    }

    fn build(provider: Arc<dyn StorageProvider>, storage: Arc<StubStorage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let binder = Arc::new(StubBinder::default());
        let observer = RecordingObserver::new();
        let slot = Arc::new(ObserverSlot::new());
        slot.set(Box::new(observer.clone()));

        let engine = Engine::new(&ClientConfig::default(), binder.clone(), provider, slot, tx);

        Self {
            engine,
            rx,
            binder,
            storage,
            channel: Arc::new(StubChannel::default()),
            observer,
        }
    }

    /// A harness whose session completed registration, with observations
    /// and sent messages from the handshake already in place.
    pub fn connected() -> Self {
        let mut harness = Self::new();
        harness.connect();
        harness.observer.clear();
        harness
    }

    pub fn input(&mut self, input: EngineInput) {
        self.engine.handle(input);
        self.pump();
    }

    pub fn pump(&mut self) {
        while let Ok(input) = self.rx.try_recv() {
            self.engine.handle(input);
        }
    }

    /// Connect, bring the link up and accept registration.
    pub fn connect(&mut self) {
        self.input(EngineInput::Connect);
        self.link_up();
        self.deliver(Event::ReturnStatus {
            tag: CorrelationTag::REGISTRATION.value(),
            status: 0,
        });
    }

    pub fn link_up(&mut self) {
        self.binder.notifier().connected(self.channel.clone());
        self.pump();
    }

    pub fn disconnect(&mut self) {
        self.input(EngineInput::Disconnect);
    }

    pub fn send_command(&mut self, command: Command) {
        self.input(EngineInput::Command(command));
    }

    pub fn request_raw_range(&mut self, start_frame: i64, end_frame: i64) {
        self.input(EngineInput::RequestRawRange {
            start_frame,
            end_frame,
        });
    }

    pub fn deliver(&mut self, event: Event) {
        self.deliver_envelope(event.encode().unwrap());
    }

    pub fn deliver_envelope(&mut self, envelope: Envelope) {
        self.binder.notifier().deliver(envelope);
        self.pump();
    }

    pub fn deliver_garbage(&mut self) {
        self.binder
            .notifier()
            .undecodable(DecodeError::Json("expected value at line 1 column 1".to_string()));
        self.pump();
    }
}
