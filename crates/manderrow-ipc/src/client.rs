//! Agent side of the connection.
//!
//! Sends are fire-and-forget: they update the shared [`Connection`] and queue a line for
//! a writer task running on a private current-thread runtime. A reader task hands
//! `PatientResponse`s to whoever is waiting on the matching doctor report.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use tracing::{Instrument, info_span};

use crate::{
    C2SFrame, C2SMessage, Connection, ConnectionId, ConnectionStatus, DoctorReport, Endpoint,
    FrameError, ProtocolError, S2CFrame, S2CMessage, TransportAddr, TransportError,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum IpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start IPC runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed")]
    Closed,
    #[error("timed out flushing connection")]
    FlushTimeout,
}

enum Outgoing {
    Line(String),
    Flush(std::sync::mpsc::SyncSender<()>),
}

#[derive(Debug)]
struct Shared {
    connection: Mutex<Connection>,
    waiters: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl Shared {
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<String>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) {
        self.connection().teardown();
        // Dropping the senders wakes every waiter with an error.
        self.waiters().clear();
    }
}

#[derive(Debug)]
pub struct IpcClient {
    id: ConnectionId,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outgoing::Line(_) => f.write_str("Line"),
            Outgoing::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl IpcClient {
    /// Connect to the host named by a `--c2s-tx` token and send `Connect`.
    pub fn connect(token: &str) -> Result<Self, IpcError> {
        let addr = TransportAddr::parse(token)?;
        let id = addr.conn.unwrap_or_else(ConnectionId::random);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(IpcError::Runtime)?;

        let (reader, writer) = rt
            .block_on(async {
                tokio::time::timeout(CONNECT_TIMEOUT, open(&addr.endpoint))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                    })
            })
            .map_err(|source| IpcError::Connect {
                endpoint: addr.endpoint.to_string(),
                source,
            })?;

        let shared = Arc::new(Shared {
            connection: Mutex::new(Connection::new(id)),
            waiters: Mutex::new(HashMap::new()),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_shared = shared.clone();
        std::thread::Builder::new()
            .name("manderrow-ipc".to_string())
            .spawn(move || {
                let span = info_span!("ipc", conn = %id);
                rt.block_on(run(reader, writer, rx, worker_shared, id).instrument(span));
            })
            .map_err(IpcError::Runtime)?;

        let client = Self { id, shared, tx };
        client.send(C2SMessage::Connect)?;
        tracing::debug!(conn = %id, endpoint = %addr.endpoint, "connected to host");
        Ok(client)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.connection().status()
    }

    /// Queue a message. Never waits for the host.
    pub fn send(&self, msg: C2SMessage) -> Result<(), IpcError> {
        let frame = C2SFrame { conn: self.id, msg };
        let line = frame.encode_line()?;

        // State change and enqueue happen under one lock so that concurrent
        // producers cannot reorder frames relative to the state machine.
        let mut conn = self.shared.connection();
        conn.on_c2s(&frame.msg)?;
        self.tx
            .send(Outgoing::Line(line))
            .map_err(|_| IpcError::Closed)
    }

    /// Emit a doctor report and return a handle for the user's choice.
    ///
    /// Waiting on the handle is optional; dropping it leaves the report unanswered.
    pub fn doctor_report(&self, report: DoctorReport) -> Result<PendingResponse, IpcError> {
        report.validate().map_err(ProtocolError::from)?;
        let id = report.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.shared.waiters();
            if waiters.contains_key(&id) {
                return Err(ProtocolError::DuplicateReport(id).into());
            }
            waiters.insert(id.clone(), tx);
        }

        if let Err(e) = self.send(C2SMessage::DoctorReport(report)) {
            self.shared.waiters().remove(&id);
            return Err(e);
        }
        Ok(PendingResponse { id, rx })
    }

    /// Block until everything queued so far has been handed to the transport.
    pub fn flush(&self, timeout: Duration) -> Result<(), IpcError> {
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        self.tx
            .send(Outgoing::Flush(ack_tx))
            .map_err(|_| IpcError::Closed)?;
        ack_rx.recv_timeout(timeout).map_err(|e| match e {
            std::sync::mpsc::RecvTimeoutError::Timeout => IpcError::FlushTimeout,
            std::sync::mpsc::RecvTimeoutError::Disconnected => IpcError::Closed,
        })
    }

    /// Send `Disconnect` (if still connected) and flush.
    pub fn close(&self, timeout: Duration) -> Result<(), IpcError> {
        if self.status() == ConnectionStatus::Connected {
            self.send(C2SMessage::Disconnect)?;
        }
        self.flush(timeout)
    }
}

/// The host's answer to one doctor report.
#[derive(Debug)]
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<String>,
}

impl PendingResponse {
    pub fn report_id(&self) -> &str {
        &self.id
    }

    /// Block the calling thread until the host answers or the connection goes away.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<String, IpcError> {
        self.rx.blocking_recv().map_err(|_| IpcError::Closed)
    }

    /// Non-blocking check. `Ok(None)` means no answer yet.
    pub fn try_choice(&mut self) -> Result<Option<String>, IpcError> {
        match self.rx.try_recv() {
            Ok(choice) => Ok(Some(choice)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(IpcError::Closed),
        }
    }
}

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

async fn open(endpoint: &Endpoint) -> io::Result<(BoxRead, BoxWrite)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
    }
}

async fn run(
    reader: BoxRead,
    mut writer: BoxWrite,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    id: ConnectionId,
) {
    let reader_task = tokio::spawn(read_loop(reader, shared.clone(), id));

    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Line(line) => {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, "host connection lost while writing");
                    shared.teardown();
                    break;
                }
            }
            Outgoing::Flush(ack) => {
                if let Err(e) = writer.flush().await {
                    tracing::warn!(error = %e, "host connection lost while flushing");
                    shared.teardown();
                    break;
                }
                let _ = ack.send(());
            }
        }
    }

    let _ = writer.shutdown().await;
    reader_task.abort();
}

async fn read_loop(reader: BoxRead, shared: Arc<Shared>, id: ConnectionId) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => handle_line(&line, &shared, id),
            Ok(None) => {
                tracing::debug!("host closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "host connection lost while reading");
                break;
            }
        }
    }
    // No reconnect: a severed transport is a disconnect.
    shared.teardown();
}

fn handle_line(line: &str, shared: &Shared, id: ConnectionId) {
    if line.trim().is_empty() {
        return;
    }
    let frame = match S2CFrame::decode_line(line) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed frame from host");
            return;
        }
    };
    if frame.conn != id {
        tracing::warn!(got = %frame.conn, "ignoring frame for another connection");
        return;
    }
    if let Err(e) = shared.connection().on_s2c(&frame.msg) {
        tracing::warn!(error = %e, "ignoring unexpected message from host");
        return;
    }

    match frame.msg {
        S2CMessage::PatientResponse { id, choice } => {
            if let Some(waiter) = shared.waiters().remove(&id) {
                let _ = waiter.send(choice);
            }
        }
    }
}
