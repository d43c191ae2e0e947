use crate::codec::FrameCodec;
use crate::config::ClientConfig;
use crate::error::{BraviaError, Result};
use crate::protocol::{Inbound, Request};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};

/// How long `close` waits for the session task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of the TCP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Receiver of everything a session produces
///
/// Called from the session task, in wire order, so implementations must not
/// block.
pub(crate) trait SessionHandler: Send + Sync + 'static {
    /// A frame arrived
    fn on_frame(&self, frame: Inbound);

    /// A session is up; `reconnected` is false for the one opened by `open`
    fn on_connected(&self, reconnected: bool);

    /// The session ended, either dropped or closed
    fn on_disconnected(&self);
}

/// Exponential backoff with full jitter
#[derive(Debug)]
struct Backoff {
    ceiling: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            ceiling: initial,
            max: max.max(initial),
        }
    }

    /// Random delay in `[0, ceiling]`, doubling the ceiling up to `max`
    fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling;
        self.ceiling = (self.ceiling * 2).min(self.max);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

enum SessionEnd {
    Stopped,
    Dropped,
}

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;

struct Supervisor {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    async fn stop(self) {
        let _ = self.stop_tx.send(());
        let mut handle = self.handle;
        if timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            tracing::warn!("Session task did not stop in time, aborting");
            handle.abort();
        }
    }
}

/// Owner of the TCP socket to one device
///
/// Writes go through a single writer task so frames never interleave. A
/// supervisor task reads frames, hands them to the [`SessionHandler`], and
/// reconnects with backoff when the device drops the session.
pub struct Connection {
    port: u16,
    connect_timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    state_tx: watch::Sender<SessionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
    /// Reachable without the supervisor lock, for teardown on drop
    session_task: Mutex<Option<AbortHandle>>,
}

impl Connection {
    /// Create a disconnected connection
    pub fn new(config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            port: config.port,
            connect_timeout: config.connect_timeout,
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
            state_tx,
            outbound: Mutex::new(None),
            supervisor: tokio::sync::Mutex::new(None),
            session_task: Mutex::new(None),
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch session state transitions
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Open a session to `address`, replacing any existing one
    ///
    /// Fails once with `Connect` if the first dial fails. After that the
    /// session is kept alive in the background until [`Connection::close`].
    pub(crate) async fn open(
        self: &Arc<Self>,
        address: &str,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if let Some(previous) = supervisor.take() {
            tracing::info!("Replacing existing session");
            self.state_tx.send_replace(SessionState::Closing);
            previous.stop().await;
            self.detach();
        }

        self.state_tx.send_replace(SessionState::Connecting);
        let stream = match self.dial(address).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state_tx.send_replace(SessionState::Disconnected);
                return Err(e);
            }
        };

        let (reader, writer) = self.attach(stream);
        handler.on_connected(false);

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let conn = Arc::clone(self);
        let address = address.to_string();
        let handle = tokio::spawn(async move {
            conn.supervise(address, reader, writer, handler, stop_rx).await;
        });

        *self.lock_session_task() = Some(handle.abort_handle());
        *supervisor = Some(Supervisor { stop_tx, handle });
        Ok(())
    }

    /// Close the session and stop reconnecting
    pub(crate) async fn close(&self) {
        let mut supervisor = self.supervisor.lock().await;
        self.lock_session_task().take();
        if let Some(running) = supervisor.take() {
            tracing::info!("Closing session");
            self.state_tx.send_replace(SessionState::Closing);
            running.stop().await;
        }
        self.detach();
        self.state_tx.send_replace(SessionState::Disconnected);
    }

    /// Stop the session task without waiting for it
    ///
    /// Works even while `open` or `close` holds the supervisor.
    pub(crate) fn abort(&self) {
        if let Some(task) = self.lock_session_task().take() {
            task.abort();
        }
        self.detach();
    }

    /// Queue one request frame for writing
    ///
    /// Fails fast with `NotConnected` instead of buffering while the session
    /// is down.
    pub fn send(&self, request: Request) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(BraviaError::NotConnected);
        }
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(request).map_err(|_| BraviaError::NotConnected),
            None => Err(BraviaError::NotConnected),
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream> {
        let endpoint = endpoint(address, self.port);
        tracing::info!("Connecting to {}", endpoint);

        match timeout(self.connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                }
                tracing::info!("Connected to {}", endpoint);
                Ok(stream)
            }
            Ok(Err(source)) => Err(BraviaError::Connect {
                address: endpoint,
                source,
            }),
            Err(_) => Err(BraviaError::Connect {
                address: endpoint,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            }),
        }
    }

    /// Start the writer for a fresh stream and mark the session connected
    fn attach(&self, stream: TcpStream) -> (FrameReader, JoinHandle<()>) {
        let (read, write) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write, FrameCodec);
            while let Some(request) = rx.recv().await {
                tracing::debug!("Sending: {:?}", request);
                if let Err(e) = sink.send(request).await {
                    tracing::error!("Failed to send request: {}", e);
                    break;
                }
            }
        });

        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.state_tx.send_replace(SessionState::Connected);
        (FramedRead::new(read, FrameCodec), writer)
    }

    fn lock_session_task(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.session_task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn supervise(
        self: Arc<Self>,
        address: String,
        mut reader: FrameReader,
        mut writer: JoinHandle<()>,
        handler: Arc<dyn SessionHandler>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let end = Self::run_session(&mut reader, &mut writer, handler.as_ref(), &mut stop_rx).await;
            self.detach();
            writer.abort();

            if let SessionEnd::Stopped = end {
                handler.on_disconnected();
                return;
            }

            tracing::warn!("Lost connection to {}", address);
            self.state_tx.send_replace(SessionState::Disconnected);
            handler.on_disconnected();

            let Some(stream) = self.reconnect(&address, &mut stop_rx).await else {
                return;
            };
            (reader, writer) = self.attach(stream);
            tracing::info!("Reconnected to {}", address);
            handler.on_connected(true);
        }
    }

    async fn run_session(
        reader: &mut FrameReader,
        writer: &mut JoinHandle<()>,
        handler: &dyn SessionHandler,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => return SessionEnd::Stopped,
                _ = &mut *writer => {
                    tracing::warn!("Writer stopped");
                    return SessionEnd::Dropped;
                }
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        tracing::debug!("Received: {:?}", frame);
                        handler.on_frame(frame);
                    }
                    Some(Err(e)) => {
                        tracing::error!("Read error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    None => {
                        tracing::info!("Connection closed by device");
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }

    /// Retry until a dial succeeds or the session is stopped
    async fn reconnect(
        &self,
        address: &str,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> Option<TcpStream> {
        let mut backoff = Backoff::new(self.reconnect_initial, self.reconnect_max);
        loop {
            let delay = backoff.next_delay();
            tracing::info!("Reconnecting to {} in {:?}", address, delay);
            tokio::select! {
                _ = stop_rx.recv() => return None,
                _ = sleep(delay) => {}
            }

            self.state_tx.send_replace(SessionState::Connecting);
            let attempt = tokio::select! {
                _ = stop_rx.recv() => return None,
                attempt = self.dial(address) => attempt,
            };
            match attempt {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    tracing::warn!("Reconnect failed: {}", e);
                    self.state_tx.send_replace(SessionState::Disconnected);
                }
            }
        }
    }
}

/// Append the default port unless the address already carries one
fn endpoint(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return SocketAddr::new(ip, default_port).to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ => format!("{}:{}", address, default_port),
    }
}
