//! Streaming bidirectional RPC over an ordered message transport.
//!
//! Calls, signals and responses share one frame shape; any of them may
//! carry a streamed tail of chunks on the same request id. The core tracks
//! pending outgoing calls, open incoming streams and the cancellation token
//! of every call currently being handled, and it propagates transport
//! disconnects into all of them.

pub mod codec;
pub mod signal;
pub mod stream;
pub mod transport;

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_channel::oneshot;
use futures_core::{future::BoxFuture, stream::BoxStream};
use futures_util::{StreamExt, future::{self, Either}};
use serde_json::Value;

use crate::{
    error::{Error, Interrupt, Result},
    rpc::{
        codec::{Message, MsgType},
        signal::{AbortHandle, AbortSignal},
        stream::{StreamFeeder, StreamIterator, stream_pair},
        transport::Transport,
    },
};

/// Key of an open incoming stream: the message kind plus request id.
pub type StreamKey = (MsgType, u64);

/// A chunk source attached to outgoing streaming data.
pub type ChunkSource = BoxStream<'static, Result<Value>>;

/// A value plus an optional lazy chunk tail, assembled locally for sending.
pub struct OutgoingData {
    pub value: Option<Value>,
    pub chunks: Option<ChunkSource>,
}

impl OutgoingData {
    pub fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            chunks: None,
        }
    }

    pub fn streamed(value: Value, chunks: ChunkSource) -> Self {
        Self {
            value: Some(value),
            chunks: Some(chunks),
        }
    }
}

impl fmt::Debug for OutgoingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingData")
            .field("value", &self.value)
            .field("streamed", &self.chunks.is_some())
            .finish()
    }
}

/// A value plus an optional chunk tail received from the peer.
#[derive(Debug)]
pub struct IncomingData {
    pub value: Option<Value>,
    pub chunks: Option<StreamIterator<Value>>,
}

/// Handler invoked for every incoming call. Receives the call data and a
/// cancellation token composed of the peer's abort frame and the
/// connection's disconnect signal.
pub type CallHandler =
    dyn Fn(IncomingData, AbortSignal) -> BoxFuture<'static, Result<OutgoingData>> + Send + Sync;

/// Handler invoked for every incoming signal.
pub type SignalHandler = dyn Fn(IncomingData) -> BoxFuture<'static, Result<()>> + Send + Sync;

struct RpcInner<T> {
    transport: T,
    next_req_id: AtomicU64,
    pending_calls: Mutex<HashMap<u64, oneshot::Sender<Result<IncomingData>>>>,
    streams: Mutex<HashMap<StreamKey, StreamFeeder<Value>>>,
    call_handlers: Mutex<HashMap<u64, AbortHandle>>,
    on_call: Mutex<Option<Arc<CallHandler>>>,
    on_signal: Mutex<Option<Arc<SignalHandler>>>,
}

/// The RPC core bound to one connection.
pub struct Rpc<T: Transport> {
    inner: Arc<RpcInner<T>>,
}

impl<T: Transport> Clone for Rpc<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Rpc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc").finish_non_exhaustive()
    }
}

impl<T: Transport> Rpc<T> {
    pub fn new(transport: T) -> Self {
        let rpc = Self {
            inner: Arc::new(RpcInner {
                transport,
                next_req_id: AtomicU64::new(1),
                pending_calls: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                call_handlers: Mutex::new(HashMap::new()),
                on_call: Mutex::new(None),
                on_signal: Mutex::new(None),
            }),
        };

        // Disconnect unilaterally fails everything pending. Per-call tokens
        // are children of the same signal and fire on their own.
        let weak = Arc::downgrade(&rpc.inner);
        rpc.inner
            .transport
            .disconnect_signal()
            .on_abort(move |reason| {
                if let Some(inner) = weak.upgrade() {
                    RpcInner::handle_disconnect(&inner, reason);
                }
            });

        rpc
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn disconnect_signal(&self) -> AbortSignal {
        self.inner.transport.disconnect_signal()
    }

    pub fn set_call_handler(
        &self,
        handler: impl Fn(IncomingData, AbortSignal) -> BoxFuture<'static, Result<OutgoingData>>
        + Send
        + Sync
        + 'static,
    ) {
        *self.inner.on_call.lock().expect("handler slot poisoned") = Some(Arc::new(handler));
    }

    pub fn set_signal_handler(
        &self,
        handler: impl Fn(IncomingData) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) {
        *self.inner.on_signal.lock().expect("handler slot poisoned") = Some(Arc::new(handler));
    }

    /// Sends a call and resolves once the matching response arrives.
    ///
    /// If `cancel` fires first, an abort frame is emitted and the call keeps
    /// waiting: the peer is expected to answer with an error response,
    /// which becomes this future's rejection.
    pub async fn make_call(
        &self,
        data: OutgoingData,
        cancel: Option<AbortSignal>,
    ) -> Result<IncomingData> {
        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();
        self.inner
            .pending_calls
            .lock()
            .expect("pending calls poisoned")
            .insert(req_id, tx);

        tracing::trace!(req_id, "sending call");
        if let Err(err) = self.send_streaming_data(MsgType::Call, req_id, data).await {
            self.forget_pending(req_id);
            return Err(err);
        }

        if let Some(cancel) = cancel {
            let mut aborted = cancel.aborted();
            match future::select(&mut rx, &mut aborted).await {
                Either::Left((res, _)) => return resolve_response(res),
                Either::Right((reason, _)) => {
                    tracing::debug!(req_id, %reason, "aborting in-flight call");
                    let frame = Message::abort(MsgType::Call, req_id);
                    if let Err(err) = self.inner.transport.send_message(frame).await {
                        self.forget_pending(req_id);
                        return Err(err);
                    }
                }
            }
        }

        resolve_response(rx.await)
    }

    /// Sends a fire-and-forget signal; no response is expected.
    pub async fn send_signal(&self, data: OutgoingData) -> Result<()> {
        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(req_id, "sending signal");
        self.send_streaming_data(MsgType::Signal, req_id, data).await
    }

    /// Decodes and dispatches one raw frame, reporting failures through the
    /// logging hook. Returns whether dispatch succeeded.
    pub fn dispatch_frame(&self, frame: &str) -> bool {
        match codec::decode(frame) {
            Ok(msg) => self.dispatch(msg),
            Err(err) => {
                tracing::warn!(error = %err, frame, "failed to decode frame");
                false
            }
        }
    }

    /// Routes one inbound message to its effect. Returns whether dispatch
    /// succeeded; failures alter no state and are reported through the
    /// logging hook.
    pub fn dispatch(&self, msg: Message) -> bool {
        let req_id = msg.req_id;
        match self.try_dispatch(msg) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(req_id, error = %err, "dispatch failed");
                false
            }
        }
    }

    fn try_dispatch(&self, msg: Message) -> Result<()> {
        let key: StreamKey = (msg.mtype, msg.req_id);

        // An open stream on this key claims the message as a stream frame.
        let feeder = self
            .inner
            .streams
            .lock()
            .expect("streams poisoned")
            .get(&key)
            .cloned();
        if let Some(feeder) = feeder {
            if let Some(payload) = &msg.error {
                feeder.supply_error(self.inner.transport.decode_error(payload));
            } else if msg.more {
                feeder.supply_chunk(msg.data.unwrap_or(Value::Null));
            } else {
                feeder.finish_ok();
            }
            return Ok(());
        }

        match msg.mtype {
            MsgType::Call => self.handle_incoming(msg, true),
            MsgType::Signal => self.handle_incoming(msg, false),
            MsgType::Resp => self.handle_response(msg),
        }
    }

    fn handle_response(&self, msg: Message) -> Result<()> {
        let tx = self
            .inner
            .pending_calls
            .lock()
            .expect("pending calls poisoned")
            .remove(&msg.req_id)
            .ok_or_else(|| {
                Error::protocol(format!("response for unknown request {}", msg.req_id))
            })?;

        let result = if let Some(payload) = &msg.error {
            Err(self.inner.transport.decode_error(payload))
        } else {
            let chunks = msg
                .more
                .then(|| self.register_stream((MsgType::Resp, msg.req_id)));
            Ok(IncomingData {
                value: msg.data,
                chunks,
            })
        };

        // The caller may have stopped waiting; that is not a dispatch error.
        let _ = tx.send(result);
        Ok(())
    }

    fn handle_incoming(&self, msg: Message, wants_response: bool) -> Result<()> {
        let req_id = msg.req_id;

        if msg.abort {
            let handle = self
                .inner
                .call_handlers
                .lock()
                .expect("call handlers poisoned")
                .get(&req_id)
                .cloned();
            if let Some(handle) = handle {
                tracing::debug!(req_id, "peer aborted call");
                handle.fire(Interrupt::Aborted("aborted by peer".into()));
            }
            return Ok(());
        }

        if msg.error.is_some() {
            return Err(Error::protocol(format!(
                "unexpected error frame opening request {req_id}"
            )));
        }

        let chunks = msg.more.then(|| self.register_stream((msg.mtype, req_id)));
        let data = IncomingData {
            value: msg.data,
            chunks,
        };

        if wants_response {
            let handler = self
                .inner
                .on_call
                .lock()
                .expect("handler slot poisoned")
                .clone();
            let (abort_handle, abort_signal) = self.disconnect_signal().child();
            self.inner
                .call_handlers
                .lock()
                .expect("call handlers poisoned")
                .insert(req_id, abort_handle);

            let rpc = self.clone();
            tokio::spawn(async move {
                let result = match handler {
                    Some(handler) => handler(data, abort_signal).await,
                    None => Err(Error::protocol("no call handler registered")),
                };
                rpc.finish_call(req_id, result).await;
            });
        } else {
            let handler = self
                .inner
                .on_signal
                .lock()
                .expect("handler slot poisoned")
                .clone();
            let Some(handler) = handler else {
                tracing::debug!(req_id, "dropping signal: no handler registered");
                return Ok(());
            };

            tokio::spawn(async move {
                if let Err(err) = handler(data).await {
                    tracing::warn!(req_id, error = %err, "signal handler failed");
                }
            });
        }

        Ok(())
    }

    /// Sends the response (or error response) of an incoming call and
    /// releases its cancellation entry. The entry stays registered while
    /// the response tail streams so a late abort frame still reaches it.
    async fn finish_call(&self, req_id: u64, result: Result<OutgoingData>) {
        match result {
            Ok(out) => {
                if let Err(err) = self.send_streaming_data(MsgType::Resp, req_id, out).await {
                    tracing::warn!(req_id, error = %err, "failed to send response");
                }
            }
            Err(err) => {
                if !err.is_interrupt() {
                    tracing::debug!(req_id, error = %err, "call handler failed");
                }
                let payload = self.inner.transport.encode_error(&err);
                let frame = Message::error(MsgType::Resp, req_id, payload);
                if let Err(send_err) = self.inner.transport.send_message(frame).await {
                    tracing::warn!(req_id, error = %send_err, "failed to send error response");
                }
            }
        }

        self.inner
            .call_handlers
            .lock()
            .expect("call handlers poisoned")
            .remove(&req_id);
    }

    /// Sends a value frame and, when chunks are attached, its streaming
    /// tail: value (flagged `more`), each chunk behind the transport's
    /// drain, then the terminator. A failing chunk source is encoded as a
    /// wire error ending the stream; transport failures propagate to the
    /// caller instead.
    pub async fn send_streaming_data(
        &self,
        mtype: MsgType,
        req_id: u64,
        data: OutgoingData,
    ) -> Result<()> {
        let OutgoingData { value, chunks } = data;
        let transport = &self.inner.transport;

        let Some(mut chunks) = chunks else {
            return transport
                .send_message(Message::value_frame(mtype, req_id, value, false))
                .await;
        };

        transport
            .send_message(Message::value_frame(mtype, req_id, value, true))
            .await?;

        let disconnect = transport.disconnect_signal();
        loop {
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    if let Some(reason) = disconnect.reason() {
                        return Err(reason.into());
                    }
                    if let Some(drain) = transport.wait_to_drain() {
                        drain.await;
                    }
                    transport
                        .send_message(Message::chunk(mtype, req_id, chunk))
                        .await?;
                }
                None => {
                    return transport.send_message(Message::end(mtype, req_id)).await;
                }
                Some(Err(err)) => {
                    tracing::debug!(req_id, error = %err, "chunk source failed; ending stream");
                    let payload = transport.encode_error(&err);
                    return transport
                        .send_message(Message::error(mtype, req_id, payload))
                        .await;
                }
            }
        }
    }

    fn register_stream(&self, key: StreamKey) -> StreamIterator<Value> {
        let weak = Arc::downgrade(&self.inner);
        let cleanup = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.streams.lock().expect("streams poisoned").remove(&key);
                tracing::trace!(?key, "stream entry released");
            }
        });

        let (feeder, iter) = stream_pair(Some(cleanup));
        self.inner
            .streams
            .lock()
            .expect("streams poisoned")
            .insert(key, feeder);
        iter
    }

    fn forget_pending(&self, req_id: u64) {
        self.inner
            .pending_calls
            .lock()
            .expect("pending calls poisoned")
            .remove(&req_id);
    }
}

impl<T> RpcInner<T> {
    fn handle_disconnect(inner: &Arc<RpcInner<T>>, reason: &Interrupt) {
        tracing::debug!(%reason, "connection disconnected");

        let pending: Vec<_> = inner
            .pending_calls
            .lock()
            .expect("pending calls poisoned")
            .drain()
            .collect();
        for (req_id, tx) in pending {
            tracing::trace!(req_id, "rejecting pending call on disconnect");
            let _ = tx.send(Err(reason.clone().into()));
        }

        let feeders: Vec<_> = inner
            .streams
            .lock()
            .expect("streams poisoned")
            .drain()
            .collect();
        for (_, feeder) in feeders {
            feeder.supply_error(reason.clone().into());
        }
    }
}

fn resolve_response(
    res: std::result::Result<Result<IncomingData>, oneshot::Canceled>,
) -> Result<IncomingData> {
    match res {
        Ok(result) => result,
        // The core rejects pending calls explicitly; a dropped sender means
        // the connection state went away entirely.
        Err(oneshot::Canceled) => Err(Error::Transport("connection state dropped".into())),
    }
}
