// Public facade: posts work to the engine loop and owns the observer slot.

use log::info;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, ImageConfig};
use crate::engine::{Engine, EngineInput};
use crate::ipc::channel::ServiceBinder;
use crate::ipc::protocol::{Command, CompleteExam, PatientInfo, SettingsInfo, UserFunction};
use crate::observer::{Observer, ObserverSlot};
use crate::transfer::StorageProvider;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),
    #[error("Engine loop has stopped")]
    EngineStopped,
}

/// Entry point for the surrounding application.
///
/// Every operation is fire-and-forget: it queues work for the engine loop and
/// returns immediately. Results arrive through the registered [`Observer`].
/// Dropping the client disconnects and stops the loop without waiting.
pub struct Client {
    tx: mpsc::UnboundedSender<EngineInput>,
    observer: Arc<ObserverSlot>,
    task: Option<JoinHandle<()>>,
}

impl Client {
    /// Start the engine loop on the current Tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        binder: Arc<dyn ServiceBinder>,
        storage: Arc<dyn StorageProvider>,
    ) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::NoRuntime(e.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = Arc::new(ObserverSlot::new());
        let mut engine = Engine::new(
            &config,
            binder,
            storage,
            Arc::clone(&observer),
            tx.clone(),
        );

        let task = runtime.spawn(async move {
            info!("[CLIENT] Engine loop started");
            while let Some(input) = rx.recv().await {
                if !engine.handle(input) {
                    break;
                }
            }
            info!("[CLIENT] Engine loop stopped");
        });

        Ok(Self {
            tx,
            observer,
            task: Some(task),
        })
    }

    /// Start a client that binds over Unix sockets in `socket_dir` and stores
    /// transfers on the local filesystem.
    #[cfg(unix)]
    pub fn spawn_local(
        config: ClientConfig,
        socket_dir: impl Into<std::path::PathBuf>,
    ) -> Result<Self, ClientError> {
        let binder = Arc::new(crate::ipc::SocketBinder::new(socket_dir));
        let storage = Arc::new(crate::transfer::FileStorage::new(&config.storage));
        Self::spawn(config, binder, storage)
    }

    /// Register the observer, replacing any previous one.
    pub fn set_observer(&self, observer: impl Observer + 'static) {
        if self.observer.set(Box::new(observer)) {
            info!("[CLIENT] Observer replaced");
        }
    }

    pub fn clear_observer(&self) {
        self.observer.clear();
    }

    pub fn connect(&self) -> Result<(), ClientError> {
        self.post(EngineInput::Connect)
    }

    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.post(EngineInput::Disconnect)
    }

    pub fn configure_image(&self, config: ImageConfig) -> Result<(), ClientError> {
        self.command(Command::ConfigureImage(config))
    }

    pub fn ask_scan_area(&self) -> Result<(), ClientError> {
        self.command(Command::AskScanArea)
    }

    pub fn ask_probe_info(&self) -> Result<(), ClientError> {
        self.command(Command::AskProbeInfo)
    }

    pub fn ask_patient_info(&self) -> Result<(), ClientError> {
        self.command(Command::AskPatientInfo)
    }

    pub fn ask_freeze(&self) -> Result<(), ClientError> {
        self.command(Command::AskFreeze)
    }

    pub fn ask_depth(&self) -> Result<(), ClientError> {
        self.command(Command::AskDepth)
    }

    pub fn ask_gain(&self) -> Result<(), ClientError> {
        self.command(Command::AskGain)
    }

    pub fn run_user_function(&self, function: UserFunction, param: f64) -> Result<(), ClientError> {
        self.command(Command::RunUserFunction { function, param })
    }

    pub fn set_patient_info(&self, info: PatientInfo) -> Result<(), ClientError> {
        self.command(Command::SetPatientInfo(info))
    }

    pub fn set_settings_info(&self, info: SettingsInfo) -> Result<(), ClientError> {
        self.command(Command::SetSettingsInfo(info))
    }

    /// Tell the service which partner package to launch from its menu.
    pub fn set_partner_package(&self, package_name: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::SetPartnerPackage {
            package_name: package_name.into(),
        })
    }

    pub fn complete_exam(&self, exam: CompleteExam) -> Result<(), ClientError> {
        self.command(Command::CompleteExam(exam))
    }

    /// Download frames `start_frame..end_frame` (0, 0 for everything).
    pub fn request_raw_range(&self, start_frame: i64, end_frame: i64) -> Result<(), ClientError> {
        self.post(EngineInput::RequestRawRange {
            start_frame,
            end_frame,
        })
    }

    /// Disconnect, stop the engine loop and wait for it to finish.
    pub async fn shutdown(mut self) -> Result<(), ClientError> {
        self.post(EngineInput::Shutdown)?;
        match self.task.take() {
            Some(task) => task.await.map_err(|_| ClientError::EngineStopped),
            None => Ok(()),
        }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.post(EngineInput::Command(command))
    }

    fn post(&self, input: EngineInput) -> Result<(), ClientError> {
        self.tx.send(input).map_err(|_| ClientError::EngineStopped)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.task.is_some() && self.post(EngineInput::Shutdown).is_ok() {
            info!("[CLIENT] Dropped without shutdown, stopping engine loop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::CorrelationTag;
    use crate::ipc::protocol::{Event, MessageKind, RawCapture};
    use crate::testing::{RecordingObserver, Seen, StubBinder, StubChannel, StubStorage};
    use std::time::Duration;

    async fn wait_for_bind(binder: &StubBinder) {
        for _ in 0..100 {
            if binder.binds() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bind was never called");
    }

    #[test]
    fn spawn_requires_a_runtime() {
        let result = Client::spawn(
            ClientConfig::default(),
            Arc::new(StubBinder::default()),
            Arc::new(StubStorage::default()),
        );
        assert!(matches!(result, Err(ClientError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn full_session_through_the_facade() {
        let binder = Arc::new(StubBinder::default());
        let channel = Arc::new(StubChannel::default());
        let observer = RecordingObserver::new();
        let client = Client::spawn(
            ClientConfig::default(),
            binder.clone(),
            Arc::new(StubStorage::default()),
        )
        .unwrap();
        client.set_observer(observer.clone());

        client.connect().unwrap();
        wait_for_bind(&binder).await;

        let notifier = binder.notifier();
        notifier.connected(channel.clone());
        notifier.deliver(
            Event::ReturnStatus {
                tag: CorrelationTag::REGISTRATION.value(),
                status: 0,
            }
            .encode()
            .unwrap(),
        );
        client.ask_depth().unwrap();
        client
            .run_user_function(UserFunction::ToggleFreeze, 0.0)
            .unwrap();
        notifier.deliver(Event::DepthReturned(8.0).encode().unwrap());

        client.shutdown().await.unwrap();

        assert_eq!(
            channel.sent_kinds(),
            vec![
                MessageKind::RegisterClient.code(),
                MessageKind::AskDepth.code(),
                MessageKind::RunUserFunction.code(),
                MessageKind::UnregisterClient.code(),
            ]
        );
        assert_eq!(
            observer.seen(),
            vec![
                Seen::Connected(true),
                Seen::DepthReturned(8.0),
                Seen::Connected(false),
            ]
        );
    }

    #[tokio::test]
    async fn dropping_the_client_tears_the_session_down() {
        let binder = Arc::new(StubBinder::default());
        let channel = Arc::new(StubChannel::default());
        let storage = Arc::new(StubStorage::default());
        let observer = RecordingObserver::new();
        let client = Client::spawn(ClientConfig::default(), binder.clone(), storage.clone()).unwrap();
        client.set_observer(observer.clone());

        client.connect().unwrap();
        wait_for_bind(&binder).await;
        let notifier = binder.notifier();
        notifier.connected(channel.clone());
        notifier.deliver(
            Event::ReturnStatus {
                tag: CorrelationTag::REGISTRATION.value(),
                status: 0,
            }
            .encode()
            .unwrap(),
        );
        notifier.deliver(
            Event::RawCaptureAvailable(RawCapture {
                capture_id: "cap-1".to_string(),
                file_name: "scan.tar".to_string(),
                size_bytes: 8,
            })
            .encode()
            .unwrap(),
        );

        drop(client);

        for _ in 0..100 {
            if binder.unbinds() > 0 && notifier.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(binder.unbinds(), 1);
        assert!(notifier.is_closed());
        assert_eq!(
            channel.sent_kinds().last(),
            Some(&MessageKind::UnregisterClient.code())
        );
        assert_eq!(storage.revoked(), vec!["scan.tar".to_string()]);
        let seen = observer.seen();
        assert!(seen.contains(&Seen::Connected(false)));
        assert!(seen
            .iter()
            .any(|s| matches!(s, Seen::CaptureCopied(id, Err(_)) if id == "cap-1")));
    }

    #[tokio::test]
    async fn commands_before_connect_are_dropped() {
        let binder = Arc::new(StubBinder::default());
        let client = Client::spawn(
            ClientConfig::default(),
            binder.clone(),
            Arc::new(StubStorage::default()),
        )
        .unwrap();

        client.ask_probe_info().unwrap();
        client.request_raw_range(0, 0).unwrap();
        client.disconnect().unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(binder.binds(), 0);
        assert_eq!(binder.unbinds(), 0);
    }
}
