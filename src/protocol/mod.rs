//! Lightweight datagram query protocol.
//!
//! This module lets a minimal client run a statement against a remote node
//! and stream back relational rows over UDP, without a full connection stack.
//!
//! # Overview
//!
//! Every message fits in a single datagram. A query is identified by a
//! client-chosen query ID and each message carries a per-query sequence
//! number; a response always carries the sequence number of its request
//! plus one, which lets both ends drop duplicates and stale datagrams.
//!
//! Results are streamed in row batches. The first batch of a plain
//! statement rides along with the [`MetaData`] describing its columns and
//! further batches are pulled with `NextValuesRequest` until one arrives
//! flagged as the last.
//!
//! # Key Components
//!
//! - [`Message`]: envelope and body of every message type, with its byte layout.
//! - [`MessagePool`]: bounded, thread-safe reuse of message instances.
//! - [`RowBatch`] and [`BatchEncoder`]: rows with sparse null markers.
//! - [`ProtocolTransport`]: sends and receives messages over a [`DatagramChannel`].
//! - [`LiteConnection`]: client side, driving a [`QuerySession`].
//! - [`LiteServer`]: server side, answering from a [`QueryExecutor`].
//!
//! # Binary Format
//!
//! - Header: `u8 type | u16 length + UTF-8 queryID | i32 sequenceNumber`.
//! - Integers are 4-byte big-endian, booleans one byte.
//! - Row batch: `bool containsLastValues | i32 numberOfRows`, followed when
//!   rows are present by `i32 nullCount | nullCount x i32 | i32 blobLength | blob`.
mod batch;
mod codec;
mod message;
mod pool;
mod server;
mod session;
mod thread;
mod transport;
mod value;

use thread::ThreadPool;

pub(crate) use transport::is_timeout;

pub use batch::{BatchEncoder, RowBatch, RowSource};
pub use codec::ProtocolError;
pub use message::{
    ColumnMetadata, Message, MessageType, MetaData, Parameter, Payload, QueryRequest,
};
pub use pool::{DEFAULT_POOL_CAPACITY, MessagePool};
pub use server::{
    ExecutorError, LiteServer, QueryExecutor, ResultDescription, ServerError, ServerHandle,
    ServerOptions,
};
pub use session::{LiteConnection, QUERY_TIMEOUT, QuerySession, SessionError, SessionState};
pub use transport::{
    DATAGRAM_SIZE, DatagramChannel, ProtocolTransport, RECEIVE_BUFFER_SIZE, TransportError,
};
pub use value::{ColumnType, Row, RowError, Value};
