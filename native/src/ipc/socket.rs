// Service binding over Unix domain sockets with a length-prefixed protocol.

use arc_swap::ArcSwapOption;
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::channel::{BindError, Channel, ChannelError, LinkNotifier, ServiceBinder};
use super::protocol::Envelope;
use super::MAX_MESSAGE_SIZE;
use crate::config::ServiceTarget;

/// Binds to a service listening on `<socket_dir>/<service>.sock`.
pub struct SocketBinder {
    socket_dir: PathBuf,
    shutdown_tx: ArcSwapOption<mpsc::UnboundedSender<()>>,
}

impl SocketBinder {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            shutdown_tx: ArcSwapOption::empty(),
        }
    }

    pub fn socket_path(&self, target: &ServiceTarget) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", target.service))
    }
}

impl ServiceBinder for SocketBinder {
    fn bind(&self, target: &ServiceTarget, notifier: LinkNotifier) -> Result<(), BindError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BindError::NoRuntime)?;

        let path = self.socket_path(target);
        if !path.exists() {
            return Err(BindError::ServiceNotFound(format!(
                "{}/{}",
                target.package, target.service
            )));
        }

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        if let Some(previous) = self.shutdown_tx.swap(Some(Arc::new(shutdown_tx))) {
            let _ = previous.send(());
        }

        info!("[SOCKET] Binding to {}", path.display());
        runtime.spawn(run_link(path, notifier, shutdown_rx));
        Ok(())
    }

    fn unbind(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.swap(None) {
            info!("[SOCKET] Unbinding");
            let _ = shutdown_tx.send(());
        }
    }
}

/// Outbound half of a socket link; frames are written by a dedicated task.
struct SocketChannel {
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Channel for SocketChannel {
    fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let payload = envelope.to_bytes()?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Message too large: {} bytes", payload.len()),
            )));
        }
        self.frame_tx
            .send(payload)
            .map_err(|_| ChannelError::Closed)
    }
}

async fn run_link(
    path: PathBuf,
    notifier: LinkNotifier,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let stream = match connect(&path).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            warn!("[SOCKET] Service refused the connection: {}", e);
            notifier.refused();
            return;
        }
        Err(e) => {
            error!("[SOCKET] Connect failed: {}", e);
            notifier.bind_failed(e.to_string());
            return;
        }
    };

    let (mut reader, mut writer) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(payload) = frame_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                error!("[SOCKET] Write error: {}", e);
                break;
            }
        }
        debug!("[SOCKET] Writer finished");
    });

    if !notifier.connected(Arc::new(SocketChannel { frame_tx })) {
        return;
    }
    info!("[SOCKET] Connected to {}", path.display());

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(payload) => {
                        let delivered = match Envelope::from_bytes(&payload) {
                            Ok(envelope) => notifier.deliver(envelope),
                            Err(e) => {
                                warn!("[SOCKET] Undecodable frame: {}", e);
                                notifier.undecodable(e)
                            }
                        };
                        if !delivered {
                            break;
                        }
                    }
                    Err(e) => {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            info!("[SOCKET] Service closed the connection");
                        } else {
                            error!("[SOCKET] Read error: {}", e);
                        }
                        notifier.lost();
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("[SOCKET] Shutdown requested");
                break;
            }
        }
    }
}

async fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path).await
}

/// Read one length-prefixed frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineInput;
    use crate::ipc::channel::LinkEvent;
    use crate::ipc::protocol::{Command, Event};
    use tokio::net::UnixListener;

    fn target() -> ServiceTarget {
        ServiceTarget {
            package: "com.vendor.probe".to_string(),
            service: "probe".to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineInput>) -> (u64, LinkEvent) {
        match rx.recv().await {
            Some(EngineInput::Link { generation, event }) => (generation, event),
            other => panic!("expected a link event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways_and_eof_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let binder = SocketBinder::new(dir.path());
        let listener = UnixListener::bind(binder.socket_path(&target())).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        binder.bind(&target(), LinkNotifier::new(7, tx)).unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let channel = match next_event(&mut rx).await {
            (7, LinkEvent::Connected(channel)) => channel,
            other => panic!("unexpected {:?}", other),
        };

        let outbound = Command::AskDepth.encode().unwrap().with_arg1(8);
        channel.send(outbound.clone()).unwrap();
        let payload = read_frame(&mut server).await.unwrap();
        assert_eq!(Envelope::from_bytes(&payload).unwrap(), outbound);

        let inbound = Event::DepthReturned(6.5).encode().unwrap();
        write_frame(&mut server, &inbound.to_bytes().unwrap())
            .await
            .unwrap();
        match next_event(&mut rx).await {
            (7, LinkEvent::Inbound(envelope)) => assert_eq!(envelope, inbound),
            other => panic!("unexpected {:?}", other),
        }

        write_frame(&mut server, b"not json").await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            (7, LinkEvent::Undecodable(_))
        ));

        drop(server);
        assert!(matches!(next_event(&mut rx).await, (7, LinkEvent::Lost)));
    }

    #[tokio::test]
    async fn missing_socket_is_service_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let binder = SocketBinder::new(dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = binder.bind(&target(), LinkNotifier::new(1, tx)).unwrap_err();
        assert!(matches!(err, BindError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn stale_socket_is_refusal() {
        let dir = tempfile::tempdir().unwrap();
        let binder = SocketBinder::new(dir.path());
        drop(UnixListener::bind(binder.socket_path(&target())).unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        binder.bind(&target(), LinkNotifier::new(1, tx)).unwrap();
        assert!(matches!(next_event(&mut rx).await, (1, LinkEvent::Refused)));
    }

    #[tokio::test]
    async fn unbind_stops_the_link_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let binder = SocketBinder::new(dir.path());
        let listener = UnixListener::bind(binder.socket_path(&target())).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        binder.bind(&target(), LinkNotifier::new(3, tx)).unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            (3, LinkEvent::Connected(_))
        ));

        binder.unbind();
        binder.unbind();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bind_outside_a_runtime_fails() {
        let binder = SocketBinder::new("/nonexistent");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            binder.bind(&target(), LinkNotifier::new(1, tx)),
            Err(BindError::NoRuntime)
        ));
    }
}
