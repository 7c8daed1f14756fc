//! Client side of the lite query protocol.
//!
//! A [`LiteConnection`] talks to one server over one socket and runs one
//! query at a time through a [`QuerySession`]:
//!
//! ```text
//! Idle --QueryRequest--> Sent --MetaData--> HaveMetaData
//! HaveMetaData/Fetching --NextValuesRequest--> Fetching
//! HaveMetaData/Fetching --ExecuteQueryRequest--> Fetching   (prepared only)
//! any --CloseRequest--> Closed
//! ```
//!
//! Every response carries the sequence number of its request plus one.
//! Datagrams that do not match the awaited type, query or sequence number
//! are discarded. Nothing is retransmitted: a lost datagram surfaces as
//! [`SessionError::Timeout`] and the caller may rerun the whole query.
use std::{
    collections::VecDeque,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use thiserror::Error;

use crate::statement::StatementType;

use super::{
    ColumnMetadata, Message, MessagePool, MessageType, MetaData, Parameter, Payload,
    ProtocolTransport, QueryRequest, RowBatch,
    transport::{DatagramChannel, RECEIVE_BUFFER_SIZE, TransportError},
    value::{ColumnType, Row, RowError, Value},
};

/// Default time to wait for each response.
pub const QUERY_TIMEOUT: Duration = Duration::from_millis(5000);

const QUERY_ID_WRAP: u32 = 50000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sent,
    HaveMetaData,
    Fetching,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("datagram lost: no {expected} with sequence {sequence} for query {query_id}")]
    Timeout {
        expected: MessageType,
        sequence: u32,
        query_id: String,
    },

    #[error("cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("statement takes {expected} parameters but {found} were given")]
    ParameterCount { expected: u32, found: usize },

    #[error(transparent)]
    Rows(#[from] RowError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A lite-protocol connection to a single server.
pub struct LiteConnection<C: DatagramChannel = UdpSocket> {
    transport: ProtocolTransport<C>,
    server: SocketAddr,
    timeout: Duration,
    counter: u32,
    buf: Vec<u8>,
}

impl LiteConnection<UdpSocket> {
    /// Opens a socket on an ephemeral port for talking to `server`.
    pub fn connect(
        server: SocketAddr,
        pool: Arc<MessagePool>,
        max_datagram: usize,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let bind: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).map_err(TransportError::from)?;
        debug!(
            "lite connection to {server} from {}",
            socket.local_addr().map_err(TransportError::from)?
        );
        Ok(Self::with_channel(socket, server, pool, max_datagram, timeout))
    }
}

impl<C: DatagramChannel> LiteConnection<C> {
    pub fn with_channel(
        channel: C,
        server: SocketAddr,
        pool: Arc<MessagePool>,
        max_datagram: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            transport: ProtocolTransport::new(channel, pool, max_datagram),
            server,
            timeout,
            counter: 0,
            buf: vec![0; RECEIVE_BUFFER_SIZE],
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Allocates a query ID: a wrapping counter followed by the wall clock
    /// in milliseconds.
    fn next_query_id(&mut self) -> String {
        let n = self.counter;
        self.counter = (self.counter + 1) % QUERY_ID_WRAP;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis());
        format!("{n}{millis}")
    }

    /// Runs a plain statement; its first rows arrive with the metadata.
    pub fn query(&mut self, sql: &str) -> Result<QuerySession<'_, C>, SessionError> {
        self.open(StatementType::Plain, sql)
    }

    /// Describes a parameterized statement. Rows are only produced by
    /// [`QuerySession::execute`].
    pub fn prepare(&mut self, sql: &str) -> Result<QuerySession<'_, C>, SessionError> {
        self.open(StatementType::Prepared, sql)
    }

    fn open(
        &mut self,
        statement_type: StatementType,
        sql: &str,
    ) -> Result<QuerySession<'_, C>, SessionError> {
        let query_id = self.next_query_id();
        let mut session = QuerySession {
            conn: self,
            query_id,
            statement_type,
            state: SessionState::Idle,
            sequence: 0,
            metadata: MetaData::default(),
            column_types: Vec::new(),
            rows: VecDeque::new(),
            last: false,
            executed: false,
        };

        let mut request = session.conn.transport.pool().acquire(MessageType::QueryRequest);
        request.payload = Payload::QueryRequest(QueryRequest {
            statement_type: Some(statement_type),
            query: Some(sql.to_string()),
        });
        let mut response = session.exchange(request, MessageType::MetaData)?;

        if let Payload::MetaData(meta) = &mut response.payload {
            session.metadata = std::mem::take(meta);
        }
        session.conn.transport.release(response);

        session.column_types = session.metadata.column_types();
        session.state = SessionState::HaveMetaData;
        if let Some(batch) = session.metadata.batch.take() {
            session.absorb(&batch)?;
        }
        Ok(session)
    }
}

/// One statement in flight on a [`LiteConnection`].
pub struct QuerySession<'c, C: DatagramChannel> {
    conn: &'c mut LiteConnection<C>,
    query_id: String,
    statement_type: StatementType,
    state: SessionState,
    /// Sequence number of the next request.
    sequence: u32,
    metadata: MetaData,
    column_types: Vec<ColumnType>,
    rows: VecDeque<Row>,
    last: bool,
    executed: bool,
}

impl<C: DatagramChannel> QuerySession<'_, C> {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn statement_type(&self) -> StatementType {
        self.statement_type
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.metadata.columns
    }

    /// 1-based indices of nullable columns.
    pub fn nullable_columns(&self) -> &[u32] {
        &self.metadata.nullable_columns
    }

    pub fn parameter_count(&self) -> u32 {
        self.metadata.number_of_parameters
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            SessionState::HaveMetaData | SessionState::Fetching => Ok(()),
            state => Err(SessionError::InvalidState { operation, state }),
        }
    }

    /// Runs a prepared statement with `parameters`, replacing any rows left
    /// from a previous execution.
    pub fn execute(&mut self, parameters: &[Value]) -> Result<(), SessionError> {
        self.ensure_open("execute")?;
        if self.statement_type != StatementType::Prepared {
            return Err(SessionError::InvalidState {
                operation: "execute a plain statement",
                state: self.state,
            });
        }
        if parameters.len() != self.metadata.number_of_parameters as usize {
            return Err(SessionError::ParameterCount {
                expected: self.metadata.number_of_parameters,
                found: parameters.len(),
            });
        }

        let mut request = self
            .conn
            .transport
            .pool()
            .acquire(MessageType::ExecuteQueryRequest);
        if let Payload::ExecuteQueryRequest(params) = &mut request.payload {
            params.extend(parameters.iter().map(|value| Parameter {
                column_type: value.column_type(),
                value: value.to_text(),
            }));
        }

        self.state = SessionState::Fetching;
        let response = self.exchange(request, MessageType::ExecuteQueryResponse)?;
        self.rows.clear();
        self.executed = true;
        let result = self.absorb_response(&response);
        self.conn.transport.release(response);
        result
    }

    /// Next row of the result, fetching another batch when the buffered
    /// ones are used up.
    pub fn next_row(&mut self) -> Result<Option<Row>, SessionError> {
        loop {
            if let Some(row) = self.rows.pop_front() {
                return Ok(Some(row));
            }
            self.ensure_open("fetch rows")?;
            if self.statement_type == StatementType::Prepared && !self.executed {
                return Err(SessionError::InvalidState {
                    operation: "fetch rows before execute",
                    state: self.state,
                });
            }
            if self.last {
                return Ok(None);
            }

            let request = self
                .conn
                .transport
                .pool()
                .acquire(MessageType::NextValuesRequest);
            self.state = SessionState::Fetching;
            let response = self.exchange(request, MessageType::NextValuesResponse)?;
            let result = self.absorb_response(&response);
            self.conn.transport.release(response);
            result?;
        }
    }

    /// Drains the remaining rows.
    pub fn collect_rows(&mut self) -> Result<Vec<Row>, SessionError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Tells the server to drop the query. No reply is expected.
    pub fn close(mut self) -> Result<(), SessionError> {
        self.send_close()
    }

    fn send_close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.rows.clear();

        let mut request = self.conn.transport.pool().acquire(MessageType::CloseRequest);
        request.set_header(&self.query_id, self.sequence);
        self.sequence += 1;
        let result = self.conn.transport.send(&request, self.conn.server);
        self.conn.transport.release(request);
        Ok(result?)
    }

    fn absorb_response(&mut self, response: &Message) -> Result<(), SessionError> {
        match response.batch() {
            Some(batch) => self.absorb(batch),
            None => Ok(()),
        }
    }

    fn absorb(&mut self, batch: &RowBatch) -> Result<(), SessionError> {
        self.rows.extend(batch.rows(&self.column_types)?);
        self.last = batch.contains_last_values;
        Ok(())
    }

    /// Sends `request` with the next sequence number and waits for the
    /// matching response.
    fn exchange(
        &mut self,
        mut request: Message,
        expected: MessageType,
    ) -> Result<Message, SessionError> {
        let sequence = self.sequence;
        request.set_header(&self.query_id, sequence);
        let sent = self.conn.transport.send(&request, self.conn.server);
        self.conn.transport.release(request);
        sent?;
        if self.state == SessionState::Idle {
            self.state = SessionState::Sent;
        }
        self.sequence = sequence + 2;

        self.await_response(expected, sequence + 1)
    }

    fn await_response(
        &mut self,
        expected: MessageType,
        sequence: u32,
    ) -> Result<Message, SessionError> {
        let deadline = Instant::now() + self.conn.timeout;
        let conn = &mut *self.conn;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match conn.transport.recv(&mut conn.buf, Some(remaining)) {
                Ok(message) => message,
                Err(TransportError::TimedOut) => break,
                Err(TransportError::Io(e)) => return Err(TransportError::Io(e).into()),
                Err(e) => {
                    warn!("query {}: discarding datagram: {e}", self.query_id);
                    continue;
                }
            };

            let matches = message.kind() == expected
                && message.sequence_number == Some(sequence)
                && message.query_id.as_deref() == Some(self.query_id.as_str())
                && message.origin() == Some(conn.server);
            if matches {
                return Ok(message);
            }

            warn!(
                "query {}: discarding {} (sequence {:?}) while waiting for {expected} (sequence {sequence})",
                self.query_id,
                message.kind(),
                message.sequence_number
            );
            conn.transport.release(message);
        }

        Err(SessionError::Timeout {
            expected,
            sequence,
            query_id: self.query_id.clone(),
        })
    }
}

impl<C: DatagramChannel> Drop for QuerySession<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.send_close() {
            debug!("query {}: close failed: {e}", self.query_id);
        }
    }
}
