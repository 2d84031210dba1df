use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use passthru_core::{BufferAccount, FlowGate, TargetId, Watermarks, WriteOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TargetError;

/// Inbound traffic and lifecycle from a live target.
///
/// `Closed` and `Error` are terminal; nothing follows them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSignal {
    Data(Bytes),
    Closed,
    Error(String),
}

impl TargetSignal {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

enum WriterCommand {
    Data(Bytes),
    Close,
}

/// Write side of a live target connection. Cheap to clone.
#[derive(Clone, Debug)]
pub struct TargetHandle {
    id: TargetId,
    host: String,
    port: u16,
    tx: mpsc::UnboundedSender<WriterCommand>,
    account: Arc<BufferAccount>,
    destroy: CancellationToken,
    closing: Arc<AtomicBool>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data(b) => write!(f, "Data({} bytes)", b.len()),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl TargetHandle {
    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gate that pauses while this target's write queue is saturated.
    pub fn gate(&self) -> &FlowGate {
        self.account.gate()
    }

    pub fn is_open(&self) -> bool {
        !self.destroy.is_cancelled() && !self.closing.load(Ordering::Acquire)
    }

    /// Queue `data` for the target, in order.
    ///
    /// Never waits on the socket; the byte account and its gate bound what
    /// can pile up. Fails with [`TargetError::Closed`] once the connection
    /// is closing or destroyed.
    pub fn write(&self, data: Bytes) -> Result<WriteOutcome, TargetError> {
        if !self.is_open() {
            return Err(TargetError::Closed);
        }
        let n = data.len();
        let outcome = self.account.on_enqueue(n);
        if self.tx.send(WriterCommand::Data(data)).is_err() {
            self.account.on_drain(n);
            return Err(TargetError::Closed);
        }
        Ok(outcome)
    }

    /// Half-close: flush queued writes, then shut down the write side.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WriterCommand::Close);
        }
    }

    /// Drop the connection immediately, discarding queued writes.
    pub fn destroy(&self) {
        self.closing.store(true, Ordering::Release);
        self.destroy.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroy.is_cancelled()
    }
}

/// A freshly connected target.
#[derive(Debug)]
pub struct TargetConnection {
    pub handle: TargetHandle,
    pub signals: mpsc::Receiver<TargetSignal>,
}

impl TargetConnection {
    pub fn into_parts(self) -> (TargetHandle, mpsc::Receiver<TargetSignal>) {
        (self.handle, self.signals)
    }
}

pub(crate) struct StreamOptions {
    pub read_buffer_size: usize,
    pub signal_capacity: usize,
    pub watermarks: Watermarks,
}

/// Split `stream` into reader and writer tasks. `on_end` runs once the
/// reader stops for any reason.
pub(crate) fn spawn_connection<F>(
    stream: TcpStream,
    host: &str,
    port: u16,
    opts: &StreamOptions,
    on_end: F,
) -> TargetConnection
where
    F: FnOnce() + Send + 'static,
{
    let id = TargetId::new();
    let (rd, wr) = stream.into_split();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (sig_tx, sig_rx) = mpsc::channel(opts.signal_capacity.max(1));
    let account = BufferAccount::new("client_to_target", opts.watermarks);
    let destroy = CancellationToken::new();
    let failure = Arc::new(Mutex::new(None));

    let _ = tokio::spawn(write_loop(
        id.clone(),
        wr,
        cmd_rx,
        account.clone(),
        failure.clone(),
        destroy.clone(),
    ));
    let _ = tokio::spawn(read_loop(
        id.clone(),
        rd,
        sig_tx,
        failure,
        destroy.clone(),
        opts.read_buffer_size.max(1),
        on_end,
    ));

    TargetConnection {
        handle: TargetHandle {
            id,
            host: host.to_string(),
            port,
            tx: cmd_tx,
            account,
            destroy,
            closing: Arc::new(AtomicBool::new(false)),
        },
        signals: sig_rx,
    }
}

async fn write_loop(
    id: TargetId,
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    account: Arc<BufferAccount>,
    failure: Arc<Mutex<Option<String>>>,
    destroy: CancellationToken,
) {
    loop {
        let cmd = tokio::select! {
            biased;
            () = destroy.cancelled() => break,
            cmd = rx.recv() => cmd,
        };
        match cmd {
            Some(WriterCommand::Data(data)) => {
                let n = data.len();
                let result = tokio::select! {
                    biased;
                    () = destroy.cancelled() => break,
                    r = wr.write_all(&data) => r,
                };
                account.on_drain(n);
                if let Err(e) = result {
                    warn!(target_id = %id, error = %e, "target write failed");
                    // The reader reports this as the terminal signal.
                    *failure.lock() = Some(e.to_string());
                    destroy.cancel();
                    break;
                }
            }
            Some(WriterCommand::Close) | None => {
                if let Err(e) = wr.shutdown().await {
                    debug!(target_id = %id, error = %e, "target shutdown failed");
                }
                debug!(target_id = %id, "target write side closed");
                return;
            }
        }
    }
    let _ = account.gate().resume();
    debug!(target_id = %id, "target writer stopped");
}

async fn read_loop<F>(
    id: TargetId,
    mut rd: OwnedReadHalf,
    signals: mpsc::Sender<TargetSignal>,
    failure: Arc<Mutex<Option<String>>>,
    destroy: CancellationToken,
    buf_size: usize,
    on_end: F,
) where
    F: FnOnce(),
{
    let mut buf = BytesMut::with_capacity(buf_size);
    let terminal = loop {
        buf.reserve(buf_size);
        let read = tokio::select! {
            biased;
            () = destroy.cancelled() => break write_failure(&failure),
            r = rd.read_buf(&mut buf) => r,
        };
        match read {
            Ok(0) => break Some(TargetSignal::Closed),
            Ok(_) => {
                let chunk = buf.split().freeze();
                let sent = tokio::select! {
                    biased;
                    () = destroy.cancelled() => break write_failure(&failure),
                    r = signals.send(TargetSignal::Data(chunk)) => r,
                };
                if sent.is_err() {
                    // Nobody is listening any more.
                    break None;
                }
            }
            Err(e) => break Some(TargetSignal::Error(e.to_string())),
        }
    };

    on_end();
    destroy.cancel();
    if let Some(signal) = terminal {
        debug!(target_id = %id, ?signal, "target connection ended");
        // Waits behind queued data; fails once the owner drops the receiver.
        let _ = signals.send(signal).await;
    }
}

/// Terminal signal after `destroy` fired: the writer's error if it failed,
/// nothing if the owner destroyed the connection on purpose.
fn write_failure(failure: &Mutex<Option<String>>) -> Option<TargetSignal> {
    failure.lock().take().map(TargetSignal::Error)
}
