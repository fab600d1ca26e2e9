//! The query engine: reads (plain and streaming) and atomic mutations over
//! one embedded store, with per-engine action broadcast.

use std::{
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    actions::{ActionSet, ApplyResultSet},
    error::{Error, Result},
    options::EngineOptions,
    query::{Query, QueryResult, QueryStreamValue, StreamingOptions},
    rpc::signal::AbortSignal,
    sql,
    store::{RowChunks, pool::ConnPool},
    value::TableColValues,
};

/// Context a request runs under.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Caller-side cancellation; inert when the caller never cancels.
    pub abort: AbortSignal,
}

impl RequestContext {
    pub fn new(abort: AbortSignal) -> Self {
        Self { abort }
    }
}

/// Result of a streaming read: the value frame plus the lazy row chunks.
#[derive(Debug)]
pub struct QueryResultStreaming {
    pub value: QueryStreamValue,
    pub chunks: RowChunks,
}

type ActionListenerFn = dyn Fn(&ActionSet) + Send + Sync;

struct ListenerEntry {
    id: u64,
    callback: Arc<ActionListenerFn>,
}

struct EngineInner {
    pool: ConnPool,
    max_small_action_row_ids: usize,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
}

impl EngineInner {
    fn remove_listener(&self, id: u64) {
        let mut listeners = self.listeners.lock().expect("listeners poisoned");
        if let Some(index) = listeners.iter().position(|entry| entry.id == id) {
            listeners.swap_remove(index);
            tracing::debug!(id, "removed action listener");
        }
    }
}

/// A data engine over one store.
#[derive(Clone)]
pub struct DataEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for DataEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEngine")
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl DataEngine {
    /// Opens the engine and its pool's first store connection.
    pub async fn connect(options: EngineOptions) -> Result<Self> {
        let pool = ConnPool::connect(options.pool).await?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                pool,
                max_small_action_row_ids: options.max_small_action_row_ids,
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn pool(&self) -> &ConnPool {
        &self.inner.pool
    }

    /// Runs a read eagerly and returns the full columnar result.
    pub async fn fetch_query(&self, _ctx: &RequestContext, query: &Query) -> Result<QueryResult> {
        let built = sql::build_fetch(query)?;
        let output = self
            .inner
            .pool
            .with_handle(|handle| async move { handle.fetch(built).await })
            .await?;

        let table_data: TableColValues = output
            .col_ids
            .into_iter()
            .zip(output.columns)
            .collect();

        Ok(QueryResult {
            table_id: query.table_id.clone(),
            action_num: 0,
            table_data,
        })
    }

    /// Starts a streaming read. The returned chunks honor the caller's
    /// abort signal and the mandatory read timeout; cleanup (cursor,
    /// transaction, pooled handle) runs exactly once on every exit path.
    pub async fn fetch_query_streaming(
        &self,
        ctx: &RequestContext,
        query: &Query,
        options: StreamingOptions,
    ) -> Result<QueryResultStreaming> {
        if options.chunk_rows == 0 {
            return Err(Error::builder("chunkRows must be positive"));
        }
        let built = sql::build_fetch(query)?;

        let handle = self.inner.pool.acquire().await?;
        let timeout = Duration::from_millis(options.timeout_ms);
        let started = handle
            .fetch_streaming(built, options.chunk_rows, timeout, ctx.abort.clone())
            .await;

        match started {
            Ok((col_ids, mut chunks)) => {
                let pool = self.inner.pool.clone();
                chunks.on_close(move || pool.release(handle));
                Ok(QueryResultStreaming {
                    value: QueryStreamValue {
                        table_id: query.table_id.clone(),
                        action_num: 0,
                        col_ids,
                    },
                    chunks,
                })
            }
            Err(err) => {
                self.inner.pool.release(handle);
                Err(err)
            }
        }
    }

    /// Applies an action set atomically, then notifies listeners with the
    /// broadcast copy (large actions stripped).
    pub async fn apply_actions(
        &self,
        _ctx: &RequestContext,
        actions: ActionSet,
    ) -> Result<ApplyResultSet> {
        let to_apply = actions.actions.clone();
        let results = self
            .inner
            .pool
            .with_handle(|handle| async move { handle.apply(to_apply).await })
            .await?;

        let broadcast = actions.for_broadcast(self.inner.max_small_action_row_ids);
        self.notify_listeners(&broadcast);

        Ok(ApplyResultSet { results })
    }

    /// Registers a listener for applied action sets. It is removed when the
    /// given disconnect signal fires, or when the returned guard is
    /// dropped, whichever comes first.
    pub fn add_action_listener(
        &self,
        disconnect: &AbortSignal,
        listener: impl Fn(&ActionSet) + Send + Sync + 'static,
    ) -> ActionListenerGuard {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("listeners poisoned")
            .push(ListenerEntry {
                id,
                callback: Arc::new(listener),
            });
        tracing::debug!(id, "registered action listener");

        let weak = Arc::downgrade(&self.inner);
        disconnect.on_abort(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listener(id);
            }
        });

        ActionListenerGuard {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn notify_listeners(&self, set: &ActionSet) {
        let callbacks: Vec<Arc<ActionListenerFn>> = self
            .inner
            .listeners
            .lock()
            .expect("listeners poisoned")
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        tracing::debug!(listeners = callbacks.len(), "broadcasting action set");
        for callback in callbacks {
            callback(set);
        }
    }
}

/// Removes its listener when dropped. Use [`ActionListenerGuard::detach`]
/// to leave the listener registered until the disconnect signal fires.
#[derive(Debug)]
pub struct ActionListenerGuard {
    inner: Weak<EngineInner>,
    id: u64,
}

impl ActionListenerGuard {
    /// Leaves the listener registered for the connection's lifetime.
    pub fn detach(mut self) {
        self.inner = Weak::new();
    }
}

impl Drop for ActionListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(self.id);
        }
    }
}
