use std::time::Duration;

/// Broadcast actions touching more rows than this are stripped down to
/// their shape; recipients refetch instead.
pub const MAX_SMALL_ACTION_ROW_IDS: usize = 100;

const DEFAULT_HIGH_WATER_MARK: usize = 512 * 1024;
const DEFAULT_BUFFER_TIMEOUT: Duration = Duration::from_millis(250);

/// Options for the store connection pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// SQLite database location. Shared-cache memory URIs
    /// (`file:name?mode=memory&cache=shared`) work because the pool keeps
    /// its first connection alive for its whole lifetime.
    pub path: String,
    /// Upper bound on pooled connections. When reached, `acquire` fails
    /// fast with a pool-exhausted error; `None` (the default) means
    /// unbounded.
    pub max_connections: Option<usize>,
}

impl PoolOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_connections: None,
        }
    }

    #[must_use]
    pub fn max_connections(mut self, bound: usize) -> Self {
        self.max_connections = Some(bound);
        self
    }
}

/// Options for a [`crate::engine::DataEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pool: PoolOptions,
    /// See [`MAX_SMALL_ACTION_ROW_IDS`].
    pub max_small_action_row_ids: usize,
}

impl EngineOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            pool: PoolOptions::new(path),
            max_small_action_row_ids: MAX_SMALL_ACTION_ROW_IDS,
        }
    }

    #[must_use]
    pub fn max_connections(mut self, bound: usize) -> Self {
        self.pool.max_connections = Some(bound);
        self
    }

    #[must_use]
    pub fn max_small_action_row_ids(mut self, max: usize) -> Self {
        self.max_small_action_row_ids = max;
        self
    }
}

/// Drain bookkeeping for transports that expose a buffered-byte count but
/// no drain event.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Send-buffer size above which the streaming sender starts waiting.
    pub high_water_mark: usize,
    /// How often the buffered-byte count is re-checked while waiting.
    pub buffer_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            buffer_timeout: DEFAULT_BUFFER_TIMEOUT,
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    #[must_use]
    pub fn buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }
}
