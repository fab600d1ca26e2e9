//! Store handles.
//!
//! Each [`StoreHandle`] owns a dedicated worker thread holding one SQLite
//! connection; commands cross over a channel and reply through oneshot
//! rendezvous. Streaming reads keep a transaction open on the worker while
//! row chunks flow through a small bounded channel, which is what bounds
//! memory and provides backpressure. A handle runs one task's work at a
//! time; overlapping streaming reads on the same handle fail with a
//! store-busy error.

pub(crate) mod apply;
pub mod pool;
pub mod types;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

use flume::r#async::RecvStream;
use futures_channel::oneshot;
use futures_core::Stream;
use futures_util::StreamExt;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde_json::Value;

use crate::{
    actions::DocAction,
    error::{Error, Interrupt, Result},
    query::RowChunk,
    rpc::signal::AbortSignal,
    sql::BuiltSql,
    value::CellValue,
};

/// How long a blocked chunk send waits before re-checking cancellation.
const CHUNK_SEND_RECHECK: Duration = Duration::from_millis(50);
/// Bound of the worker-to-consumer chunk channel.
const CHUNK_CHANNEL_BOUND: usize = 2;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Columnar output of a plain fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub col_ids: Vec<String>,
    /// One value sequence per entry of `col_ids`.
    pub columns: Vec<Vec<CellValue>>,
}

enum Command {
    Fetch {
        built: BuiltSql,
        reply: oneshot::Sender<Result<FetchOutput>>,
    },
    FetchStreaming {
        built: BuiltSql,
        chunk_rows: usize,
        deadline: Instant,
        cancel: AbortSignal,
        header: oneshot::Sender<Result<Vec<String>>>,
        chunks: flume::Sender<Result<RowChunk>>,
    },
    Apply {
        actions: Vec<DocAction>,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
}

struct HandleShared {
    commands: flume::Sender<Command>,
    /// Set while a streaming read owns this handle.
    streaming: AtomicBool,
    id: u64,
}

/// A single connection to the store, usable by one task at a time.
#[derive(Clone)]
pub struct StoreHandle {
    shared: Arc<HandleShared>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

fn worker_gone() -> Error {
    Error::Store("store worker is gone".into())
}

impl StoreHandle {
    /// Opens a handle: spawns the worker thread and waits for it to open
    /// the database.
    pub async fn open(path: &str) -> Result<Self> {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, command_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker_path = path.to_owned();
        thread::Builder::new()
            .name(format!("store-{id}"))
            .spawn(move || worker(id, &worker_path, ready_tx, &command_rx))
            .map_err(|err| Error::Store(format!("failed to spawn store worker: {err}")))?;

        ready_rx.await.map_err(|_| worker_gone())??;
        tracing::debug!(id, path, "opened store handle");

        Ok(Self {
            shared: Arc::new(HandleShared {
                commands,
                streaming: AtomicBool::new(false),
                id,
            }),
        })
    }

    /// Runs a read eagerly, returning all rows in columnar form.
    pub async fn fetch(&self, built: BuiltSql) -> Result<FetchOutput> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Fetch { built, reply })
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Applies an action set in one immediate transaction.
    pub async fn apply(&self, actions: Vec<DocAction>) -> Result<Vec<Value>> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Apply { actions, reply })
            .map_err(|_| worker_gone())?;
        rx.await.map_err(|_| worker_gone())?
    }

    /// Starts a streaming read: opens a transaction on the worker and
    /// returns the projected column ids plus the lazy chunk stream.
    ///
    /// Only one streaming read may be open per handle; a second fails with
    /// [`Error::StoreBusy`] until the first ends or is aborted.
    pub async fn fetch_streaming(
        &self,
        built: BuiltSql,
        chunk_rows: usize,
        timeout: Duration,
        cancel: AbortSignal,
    ) -> Result<(Vec<String>, RowChunks)> {
        if self.shared.streaming.swap(true, Ordering::AcqRel) {
            return Err(Error::StoreBusy);
        }
        // From here on the guard owns the busy flag; every exit path below
        // (including errors) releases it exactly once.
        let guard = StreamGuard {
            handle: self.clone(),
            release: None,
        };

        let (header, header_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = flume::bounded(CHUNK_CHANNEL_BOUND);
        self.shared
            .commands
            .send(Command::FetchStreaming {
                built,
                chunk_rows,
                deadline: Instant::now() + timeout,
                cancel: cancel.clone(),
                header,
                chunks: chunk_tx,
            })
            .map_err(|_| worker_gone())?;

        let col_ids = header_rx.await.map_err(|_| worker_gone())??;

        let stream = RowChunks {
            chunks: Some(chunk_rx.into_stream()),
            cancel,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            guard: Some(guard),
            done: false,
        };
        Ok((col_ids, stream))
    }
}

/// Clears the handle's busy flag (and runs any attached release action)
/// exactly once, on every exit path of a streaming read.
struct StreamGuard {
    handle: StoreHandle,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.handle.shared.streaming.store(false, Ordering::Release);
        tracing::trace!(id = self.handle.shared.id, "streaming read finished");
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Lazy sequence of row chunks from a streaming read.
///
/// Between chunks it re-checks the caller's cancel signal and the read
/// deadline; firing either ends the stream with that reason and rolls the
/// read back. Dropping the stream has the same effect.
pub struct RowChunks {
    chunks: Option<RecvStream<'static, Result<RowChunk>>>,
    cancel: AbortSignal,
    deadline: Pin<Box<tokio::time::Sleep>>,
    guard: Option<StreamGuard>,
    done: bool,
}

impl RowChunks {
    /// Attaches an action to run once, when the stream ends by any path.
    /// The engine uses this to return the pooled handle.
    pub(crate) fn on_close(&mut self, release: impl FnOnce() + Send + 'static) {
        if let Some(guard) = &mut self.guard {
            guard.release = Some(Box::new(release));
        }
    }

    /// Ends the stream: dropping the receiver unblocks the worker, which
    /// rolls the transaction back; dropping the guard clears the busy flag.
    fn finish(&mut self) {
        self.done = true;
        self.chunks = None;
        self.guard = None;
    }
}

impl fmt::Debug for RowChunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowChunks")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Stream for RowChunks {
    type Item = Result<RowChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(reason) = this.cancel.reason() {
            this.finish();
            return Poll::Ready(Some(Err(reason.into())));
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            this.finish();
            return Poll::Ready(Some(Err(Interrupt::TimedOut.into())));
        }

        let Some(chunks) = &mut this.chunks else {
            return Poll::Ready(None);
        };
        match chunks.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn worker(
    id: u64,
    path: &str,
    ready: oneshot::Sender<Result<()>>,
    commands: &flume::Receiver<Command>,
) {
    let mut conn = match open_connection(path) {
        Ok(conn) => {
            let _ = ready.send(Ok(()));
            conn
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Fetch { built, reply } => {
                let _ = reply.send(run_fetch(&conn, &built));
            }
            Command::Apply { actions, reply } => {
                let _ = reply.send(apply::apply_actions(&mut conn, &actions));
            }
            Command::FetchStreaming {
                built,
                chunk_rows,
                deadline,
                cancel,
                header,
                chunks,
            } => run_fetch_streaming(
                &conn, &built, chunk_rows, deadline, &cancel, header, &chunks,
            ),
        }
    }

    tracing::debug!(id, "store worker exiting");
}

fn open_connection(path: &str) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn run_fetch(conn: &Connection, built: &BuiltSql) -> Result<FetchOutput> {
    let mut stmt = conn.prepare(&built.sql)?;
    let col_ids: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();

    let mut columns: Vec<Vec<CellValue>> = vec![Vec::new(); col_ids.len()];
    let mut rows = stmt.query(params_from_iter(built.params.iter()))?;
    while let Some(row) = rows.next()? {
        for (index, column) in columns.iter_mut().enumerate() {
            column.push(CellValue::from(row.get_ref(index)?));
        }
    }

    Ok(FetchOutput { col_ids, columns })
}

/// Runs a streaming read on the worker. The transaction stays open for the
/// whole read and is always rolled back at the end (reads commit nothing);
/// the bounded chunk channel is what paces the cursor.
fn run_fetch_streaming(
    conn: &Connection,
    built: &BuiltSql,
    chunk_rows: usize,
    deadline: Instant,
    cancel: &AbortSignal,
    header: oneshot::Sender<Result<Vec<String>>>,
    chunks: &flume::Sender<Result<RowChunk>>,
) {
    let tx = match conn.unchecked_transaction() {
        Ok(tx) => tx,
        Err(err) => {
            let _ = header.send(Err(err.into()));
            return;
        }
    };

    let mut stmt = match conn.prepare(&built.sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = header.send(Err(err.into()));
            return;
        }
    };
    let col_ids: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    if header.send(Ok(col_ids)).is_err() {
        // Consumer is already gone.
        return;
    }

    if let Err(err) = stream_rows(&mut stmt, built, chunk_rows, deadline, cancel, chunks) {
        if !err.is_interrupt() {
            tracing::debug!(error = %err, "streaming read failed");
        }
        let _ = chunks.send(Err(err));
    }

    drop(stmt);
    if let Err(err) = tx.rollback() {
        tracing::warn!(error = %err, "failed to roll back read transaction");
    }
}

fn stream_rows(
    stmt: &mut rusqlite::Statement<'_>,
    built: &BuiltSql,
    chunk_rows: usize,
    deadline: Instant,
    cancel: &AbortSignal,
    chunks: &flume::Sender<Result<RowChunk>>,
) -> Result<()> {
    let num_cols = stmt.column_count();
    let mut rows = stmt.query(params_from_iter(built.params.iter()))?;
    let mut chunk: RowChunk = Vec::with_capacity(chunk_rows);

    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(num_cols);
        for index in 0..num_cols {
            out.push(CellValue::from(row.get_ref(index)?));
        }
        chunk.push(out);

        if chunk.len() >= chunk_rows {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_rows));
            send_chunk(chunks, full, deadline, cancel)?;
        }
    }

    if !chunk.is_empty() {
        send_chunk(chunks, chunk, deadline, cancel)?;
    }
    Ok(())
}

fn send_chunk(
    chunks: &flume::Sender<Result<RowChunk>>,
    chunk: RowChunk,
    deadline: Instant,
    cancel: &AbortSignal,
) -> Result<()> {
    let mut item = Ok(chunk);
    loop {
        if let Some(reason) = cancel.reason() {
            return Err(reason.into());
        }
        if Instant::now() >= deadline {
            return Err(Interrupt::TimedOut.into());
        }

        match chunks.send_timeout(item, CHUNK_SEND_RECHECK) {
            Ok(()) => return Ok(()),
            Err(flume::SendTimeoutError::Timeout(back)) => item = back,
            Err(flume::SendTimeoutError::Disconnected(_)) => {
                return Err(Interrupt::Aborted("stream consumer went away".into()).into());
            }
        }
    }
}
