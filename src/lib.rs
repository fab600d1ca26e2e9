#![cfg_attr(not(test), warn(unused_crate_dependencies))]
//! Streaming tabular data engine.
//!
//! Two subsystems compose here: a streaming bidirectional RPC layer over an
//! ordered message transport ([`rpc`]) and a streaming query engine backed
//! by an embedded SQLite store ([`engine`], [`store`]). A query's result
//! can be a value plus a lazy chunk sequence; each chunk becomes a frame in
//! the RPC stream, flowing through the same backpressure and cancellation
//! machinery as everything else on the connection.

pub mod actions;
pub mod client;
pub mod engine;
pub mod error;
pub mod options;
pub mod query;
pub mod rpc;
pub mod server;
pub mod sql;
pub mod store;
pub mod value;

pub use actions::{ActionSet, ApplyResultSet, ColDef, ColInfo, ColPatch, DocAction};
pub use client::{ClientQueryStream, EngineClient};
pub use engine::{ActionListenerGuard, DataEngine, QueryResultStreaming, RequestContext};
pub use error::{Error, Interrupt, Result};
pub use options::{EngineOptions, MAX_SMALL_ACTION_ROW_IDS, PoolOptions, TransportOptions};
pub use query::{
    Cursor, CursorKind, FilterExpr, Query, QueryResult, QueryStreamValue, Row, RowChunk,
    StreamingOptions,
};
pub use rpc::{
    IncomingData, OutgoingData, Rpc,
    codec::{Message, MsgType},
    signal::{AbortHandle, AbortSignal},
    stream::StreamIterator,
    transport::{ChannelTransport, FrameReceiver, Transport, duplex},
};
pub use server::serve_engine;
pub use sql::PREVIOUS_ROW_COL;
pub use store::{FetchOutput, RowChunks, StoreHandle, pool::ConnPool};
pub use value::{BulkColValues, CellValue, TableColValues};
