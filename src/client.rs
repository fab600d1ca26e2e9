//! Client façade: typed engine calls over an RPC connection, plus
//! demultiplexing of server signals to local action listeners.

use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{FutureExt, StreamExt};
use serde_json::{Value, json};

use crate::{
    actions::{ActionSet, ApplyResultSet},
    error::{Error, Result},
    query::{Query, QueryResult, QueryStreamValue, RowChunk, StreamingOptions},
    rpc::{
        IncomingData, OutgoingData, Rpc, signal::AbortSignal, stream::StreamIterator,
        transport::Transport,
    },
};

type ActionSetListener = dyn Fn(&ActionSet) + Send + Sync;

/// Client side of the engine method surface.
pub struct EngineClient<T: Transport> {
    rpc: Rpc<T>,
    listeners: Arc<Mutex<Vec<Arc<ActionSetListener>>>>,
}

impl<T: Transport> fmt::Debug for EngineClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient").finish_non_exhaustive()
    }
}

impl<T: Transport> EngineClient<T> {
    /// Wraps a connection, installing the signal handler that dispatches
    /// `("action", actionSet)` broadcasts to local listeners.
    pub fn new(rpc: Rpc<T>) -> Self {
        let listeners: Arc<Mutex<Vec<Arc<ActionSetListener>>>> = Arc::default();

        let demux = Arc::clone(&listeners);
        rpc.set_signal_handler(move |data| {
            let listeners = Arc::clone(&demux);
            async move { dispatch_signal(&listeners, data) }.boxed()
        });

        Self { rpc, listeners }
    }

    pub fn rpc(&self) -> &Rpc<T> {
        &self.rpc
    }

    /// Registers a listener for broadcast action sets, for the lifetime of
    /// this client.
    pub fn add_action_listener(&self, listener: impl Fn(&ActionSet) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listeners poisoned")
            .push(Arc::new(listener));
    }

    pub async fn fetch_query(&self, query: &Query) -> Result<QueryResult> {
        let data = OutgoingData::value(json!(["fetchQuery", query]));
        let response = self.rpc.make_call(data, None).await?;
        decode_value(response)
    }

    pub async fn apply_actions(&self, actions: &ActionSet) -> Result<ApplyResultSet> {
        let data = OutgoingData::value(json!(["applyActions", actions]));
        let response = self.rpc.make_call(data, None).await?;
        decode_value(response)
    }

    /// Starts a streaming read. Firing `abort` cancels the in-flight call
    /// (or, later, the server-side read feeding the chunk stream).
    pub async fn fetch_query_streaming(
        &self,
        query: &Query,
        options: StreamingOptions,
        abort: Option<AbortSignal>,
    ) -> Result<ClientQueryStream> {
        let data = OutgoingData::value(json!(["fetchQueryStreaming", query, options]));
        let response = self.rpc.make_call(data, abort).await?;

        let value = response
            .value
            .ok_or_else(|| Error::protocol("streaming response is missing its value"))?;
        let chunks = response
            .chunks
            .ok_or_else(|| Error::protocol("streaming response has no chunk tail"))?;

        Ok(ClientQueryStream {
            value: serde_json::from_value(value)?,
            chunks,
        })
    }
}

/// A streaming read as observed by the client: the value frame plus the
/// decoded row chunks. Dropping it abandons the stream.
pub struct ClientQueryStream {
    pub value: QueryStreamValue,
    chunks: StreamIterator<Value>,
}

impl ClientQueryStream {
    /// Abandons the remainder of the stream.
    pub fn close(&mut self) {
        self.chunks.close();
    }
}

impl fmt::Debug for ClientQueryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientQueryStream")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Stream for ClientQueryStream {
    type Item = Result<RowChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.chunks.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(value))) => {
                let chunk = serde_json::from_value(value).map_err(Error::from);
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn decode_value<R: serde::de::DeserializeOwned>(response: IncomingData) -> Result<R> {
    let value = response
        .value
        .ok_or_else(|| Error::protocol("response is missing its value"))?;
    Ok(serde_json::from_value(value)?)
}

fn dispatch_signal(
    listeners: &Mutex<Vec<Arc<ActionSetListener>>>,
    data: IncomingData,
) -> Result<()> {
    let value = data
        .value
        .ok_or_else(|| Error::protocol("signal payload is missing"))?;
    let Value::Array(items) = value else {
        return Err(Error::protocol("signal payload must be [tag, ...args]"));
    };

    match items.first().and_then(Value::as_str) {
        Some("action") => {
            let payload = items
                .get(1)
                .ok_or_else(|| Error::protocol("action signal is missing its action set"))?;
            let set: ActionSet = serde_json::from_value(payload.clone())?;

            let callbacks: Vec<Arc<ActionSetListener>> =
                listeners.lock().expect("listeners poisoned").clone();
            for callback in callbacks {
                callback(&set);
            }
            Ok(())
        }
        tag => {
            tracing::debug!(?tag, "ignoring unknown signal");
            Ok(())
        }
    }
}
