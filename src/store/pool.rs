//! Bounded pool of store handles.
//!
//! A plain stack: `acquire` pops (creating a new handle when empty),
//! `release` pushes back. Holding a handle across unrelated awaits starves
//! the pool, so asynchronous users acquire and release explicitly around
//! the store work itself.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use crate::{
    error::{Error, Result},
    options::PoolOptions,
    store::StoreHandle,
};

struct PoolState {
    idle: Vec<StoreHandle>,
    total: usize,
}

struct PoolInner {
    options: PoolOptions,
    state: Mutex<PoolState>,
}

/// Pool of [`StoreHandle`]s for one database.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("total", &self.total_connections())
            .field("in_use", &self.in_use_connections())
            .finish()
    }
}

impl ConnPool {
    /// Opens the pool with its first handle. That handle stays owned by the
    /// pool for its whole lifetime, which keeps shared-cache memory
    /// databases alive between uses.
    pub async fn connect(options: PoolOptions) -> Result<Self> {
        let first = StoreHandle::open(&options.path).await?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                options,
                state: Mutex::new(PoolState {
                    idle: vec![first],
                    total: 1,
                }),
            }),
        })
    }

    /// Pops an idle handle, or opens a new one. With a configured bound the
    /// call fails fast with [`Error::PoolExhausted`] instead of waiting.
    pub async fn acquire(&self) -> Result<StoreHandle> {
        let reused = {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            match state.idle.pop() {
                Some(handle) => Some(handle),
                None => {
                    if let Some(max) = self.inner.options.max_connections {
                        if state.total >= max {
                            return Err(Error::PoolExhausted);
                        }
                    }
                    // Reserve the slot before the await below.
                    state.total += 1;
                    None
                }
            }
        };

        let handle = match reused {
            Some(handle) => handle,
            None => match StoreHandle::open(&self.inner.options.path).await {
                Ok(handle) => handle,
                Err(err) => {
                    self.inner.state.lock().expect("pool state poisoned").total -= 1;
                    return Err(err);
                }
            },
        };

        tracing::debug!(
            total = self.total_connections(),
            in_use = self.in_use_connections(),
            "acquired store handle"
        );
        Ok(handle)
    }

    /// Returns a handle to the stack.
    pub fn release(&self, handle: StoreHandle) {
        self.inner
            .state
            .lock()
            .expect("pool state poisoned")
            .idle
            .push(handle);
        tracing::debug!(
            total = self.total_connections(),
            in_use = self.in_use_connections(),
            "released store handle"
        );
    }

    pub fn total_connections(&self) -> usize {
        self.inner.state.lock().expect("pool state poisoned").total
    }

    pub fn in_use_connections(&self) -> usize {
        let state = self.inner.state.lock().expect("pool state poisoned");
        state.total - state.idle.len()
    }

    /// Acquires a handle, runs the closure with it, releases it. Do not
    /// await unrelated work inside the closure: the handle stays checked
    /// out for its whole duration.
    pub async fn with_handle<R, F, Fut>(&self, work: F) -> Result<R>
    where
        F: FnOnce(StoreHandle) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let handle = self.acquire().await?;
        let result = work(handle.clone()).await;
        self.release(handle);
        result
    }
}
