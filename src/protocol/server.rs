use std::{
    collections::{HashMap, hash_map::Entry},
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::statement::StatementType;

use super::{
    BatchEncoder, ColumnMetadata, DATAGRAM_SIZE, Message, MessagePool, MessageType, MetaData,
    Payload, ProtocolTransport, RowBatch, RowSource, ThreadPool,
    pool::DEFAULT_POOL_CAPACITY,
    transport::{RECEIVE_BUFFER_SIZE, TransportError},
    value::{ColumnType, RowError, Value},
};

/// How often the listener checks for a shutdown request.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Parameter(#[from] RowError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server IO error: {0}")]
    Io(#[from] io::Error),

    #[error("listener thread panicked")]
    Panicked,
}

/// Shape of a statement's result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultDescription {
    pub columns: Vec<ColumnMetadata>,
    /// 1-based indices of nullable columns.
    pub nullable_columns: Vec<u32>,
    pub parameter_count: u32,
}

impl ResultDescription {
    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }
}

/// The query engine behind a [`LiteServer`].
pub trait QueryExecutor: Send + Sync + 'static {
    fn describe(&self, sql: &str) -> Result<ResultDescription, ExecutorError>;

    fn execute(&self, sql: &str, parameters: &[Value]) -> Result<RowSource, ExecutorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub datagram_size: usize,
    pub workers: usize,
    pub pool_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            datagram_size: DATAGRAM_SIZE,
            workers: 8,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

type ClientKey = (SocketAddr, String);

/// What the server remembers about one client query between requests.
struct ClientState {
    sql: String,
    statement_type: StatementType,
    /// Sequence number of the last response sent.
    last_sequence: u32,
    description: ResultDescription,
    encoder: Option<BatchEncoder>,
}

impl ClientState {
    fn is_duplicate(&self, request: &Message) -> bool {
        request
            .sequence_number
            .is_none_or(|sequence| sequence <= self.last_sequence)
    }
}

struct Shared<E> {
    transport: ProtocolTransport<UdpSocket>,
    executor: E,
    clients: Mutex<HashMap<ClientKey, Arc<Mutex<ClientState>>>>,
}

/// UDP server answering lite-protocol queries from a [`QueryExecutor`].
pub struct LiteServer<E: QueryExecutor> {
    shared: Arc<Shared<E>>,
    pool: ThreadPool,
    address: SocketAddr,
}

impl<E: QueryExecutor> LiteServer<E> {
    pub fn bind(
        address: SocketAddr,
        executor: E,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(address)?;
        let address = socket.local_addr()?;
        let transport = ProtocolTransport::new(
            socket,
            Arc::new(MessagePool::new(options.pool_capacity)),
            options.datagram_size,
        );

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                executor,
                clients: Mutex::new(HashMap::new()),
            }),
            pool: ThreadPool::new(options.workers)?,
            address,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn listen(self) -> Result<(), ServerError> {
        self.listen_until(&AtomicBool::new(false))
    }

    /// Receives requests and hands them to the workers until `stop` is set.
    pub fn listen_until(&self, stop: &AtomicBool) -> Result<(), ServerError> {
        info!("listening at {}", self.address);
        let mut buf = vec![0; RECEIVE_BUFFER_SIZE];

        while !stop.load(Ordering::Relaxed) {
            match self.shared.transport.recv(&mut buf, Some(POLL_INTERVAL)) {
                Ok(message) => {
                    let shared = Arc::clone(&self.shared);
                    self.pool.execute(move || handle_message(&shared, message));
                }
                Err(TransportError::TimedOut) => {}
                Err(e) => warn!("dropping datagram: {e}"),
            }
        }

        info!("listener at {} stopped", self.address);
        Ok(())
    }

    /// Runs the listener on its own thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let stop = Arc::new(AtomicBool::new(false));
        let address = self.address;
        let clients = Arc::clone(&self.shared) as Arc<dyn ClientCount>;

        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("lite-listener-{}", address.port()))
            .spawn(move || self.listen_until(&flag))?;

        Ok(ServerHandle {
            address,
            stop,
            clients,
            thread: Some(thread),
        })
    }
}

trait ClientCount: Send + Sync {
    fn count(&self) -> usize;
}

impl<E: QueryExecutor> ClientCount for Shared<E> {
    fn count(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle to a server started with [`LiteServer::spawn`]. Dropping it stops
/// the server.
pub struct ServerHandle {
    address: SocketAddr,
    stop: Arc<AtomicBool>,
    clients: Arc<dyn ClientCount>,
    thread: Option<thread::JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Number of queries whose state the server is holding.
    pub fn active_queries(&self) -> usize {
        self.clients.count()
    }

    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), ServerError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            warn!("server at {} did not stop cleanly: {e}", self.address);
        }
    }
}

fn handle_message<E: QueryExecutor>(shared: &Shared<E>, request: Message) {
    let (Some(origin), Some(query_id)) = (request.origin(), request.query_id.clone()) else {
        shared.transport.release(request);
        return;
    };
    let key = (origin, query_id);
    debug!(
        "{} from {origin} for query {} (sequence {:?})",
        request.kind(),
        key.1,
        request.sequence_number
    );

    let result = match request.kind() {
        MessageType::QueryRequest => process_query(shared, &key, &request),
        MessageType::ExecuteQueryRequest => process_execute(shared, &key, &request),
        MessageType::NextValuesRequest => process_next_values(shared, &key, &request),
        MessageType::CloseRequest => {
            if remove_state(shared, &key).is_none() {
                debug!("close for unknown query {}", key.1);
            }
            Ok(())
        }
        kind => {
            warn!("ignoring {kind} sent to the server by {origin}");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("query {} from {origin} failed: {e}", key.1);
        remove_state(shared, &key);
    }
    shared.transport.release(request);
}

#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Rows(#[from] RowError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn lookup<E>(shared: &Shared<E>, key: &ClientKey) -> Option<Arc<Mutex<ClientState>>> {
    shared
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .cloned()
}

fn remove_state<E>(shared: &Shared<E>, key: &ClientKey) -> Option<Arc<Mutex<ClientState>>> {
    shared
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key)
}

/// Fills the batch of `response` with as many rows as fit a datagram and
/// reports whether it is the last one.
fn fill_response<E>(
    shared: &Shared<E>,
    encoder: &mut BatchEncoder,
    response: &mut Message,
    allow_empty: bool,
) -> Result<bool, RowError> {
    let budget = shared
        .transport
        .max_datagram()
        .saturating_sub(response.overhead());
    match response.batch_mut() {
        Some(batch) => {
            encoder.fill(batch, budget, allow_empty)?;
            Ok(batch.contains_last_values)
        }
        None => Ok(true),
    }
}

fn send_response<E>(
    shared: &Shared<E>,
    response: Message,
    to: SocketAddr,
) -> Result<(), RequestError> {
    let sent = shared.transport.send(&response, to);
    shared.transport.release(response);
    Ok(sent?)
}

fn process_query<E: QueryExecutor>(
    shared: &Shared<E>,
    key: &ClientKey,
    request: &Message,
) -> Result<(), RequestError> {
    let Payload::QueryRequest(query) = &request.payload else {
        return Ok(());
    };
    let (Some(statement_type), Some(sql), Some(sequence)) = (
        query.statement_type,
        query.query.as_deref(),
        request.sequence_number,
    ) else {
        return Ok(());
    };

    // Claim the key before running anything so that a duplicate handled by
    // another worker finds it taken.
    let claim = Arc::new(Mutex::new(ClientState {
        sql: sql.to_string(),
        statement_type,
        last_sequence: sequence + 1,
        description: ResultDescription::default(),
        encoder: None,
    }));
    let mut state = claim.lock().unwrap_or_else(PoisonError::into_inner);
    match shared
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key.clone())
    {
        Entry::Occupied(_) => {
            warn!("duplicate query request for {} ignored", key.1);
            return Ok(());
        }
        Entry::Vacant(slot) => {
            slot.insert(Arc::clone(&claim));
        }
    }

    state.description = shared.executor.describe(sql)?;
    let mut encoder = match statement_type {
        StatementType::Plain => Some(BatchEncoder::new(
            state.description.column_types(),
            shared.executor.execute(sql, &[])?,
        )),
        StatementType::Prepared => None,
    };

    let mut response = shared.transport.pool().acquire(MessageType::MetaData);
    response.set_header(&key.1, sequence + 1);
    response.payload = Payload::MetaData(MetaData {
        number_of_parameters: state.description.parameter_count,
        columns: state.description.columns.clone(),
        nullable_columns: state.description.nullable_columns.clone(),
        batch: encoder.as_ref().map(|_| RowBatch::default()),
    });

    if let Some(rows) = encoder.as_mut() {
        let last = match fill_response(shared, rows, &mut response, true) {
            Ok(last) => last,
            Err(e) => {
                shared.transport.release(response);
                return Err(e.into());
            }
        };
        if last {
            remove_state(shared, key);
        } else {
            state.encoder = encoder;
        }
    }
    drop(state);

    send_response(shared, response, key.0)
}

fn process_execute<E: QueryExecutor>(
    shared: &Shared<E>,
    key: &ClientKey,
    request: &Message,
) -> Result<(), RequestError> {
    let Some(state) = lookup(shared, key) else {
        warn!("execute for unknown query {} ignored", key.1);
        return Ok(());
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.is_duplicate(request) {
        warn!(
            "duplicate execute request for {} ignored (sequence {:?})",
            key.1, request.sequence_number
        );
        return Ok(());
    }
    let (Some(sequence), Payload::ExecuteQueryRequest(parameters)) =
        (request.sequence_number, &request.payload)
    else {
        return Ok(());
    };
    state.last_sequence = sequence + 1;

    let parameters = parameters
        .iter()
        .map(|p| Value::parse(p.column_type, &p.value))
        .collect::<Result<Vec<_>, _>>()?;
    let rows = shared.executor.execute(&state.sql, &parameters)?;
    let column_types = state.description.column_types();
    let encoder = state.encoder.insert(BatchEncoder::new(column_types, rows));

    let mut response = shared
        .transport
        .pool()
        .acquire(MessageType::ExecuteQueryResponse);
    response.set_header(&key.1, sequence + 1);
    if let Err(e) = fill_response(shared, encoder, &mut response, false) {
        shared.transport.release(response);
        return Err(e.into());
    }
    send_response(shared, response, key.0)
}

fn process_next_values<E: QueryExecutor>(
    shared: &Shared<E>,
    key: &ClientKey,
    request: &Message,
) -> Result<(), RequestError> {
    let Some(state) = lookup(shared, key) else {
        debug!("next values for unknown query {} ignored", key.1);
        return Ok(());
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.is_duplicate(request) {
        warn!(
            "duplicate next values request for {} ignored (sequence {:?})",
            key.1, request.sequence_number
        );
        return Ok(());
    }
    let Some(sequence) = request.sequence_number else {
        return Ok(());
    };
    let statement_type = state.statement_type;
    let Some(encoder) = state.encoder.as_mut() else {
        warn!("next values for {} before the statement was executed", key.1);
        return Ok(());
    };

    let mut response = shared
        .transport
        .pool()
        .acquire(MessageType::NextValuesResponse);
    response.set_header(&key.1, sequence + 1);
    let last = match fill_response(shared, encoder, &mut response, false) {
        Ok(last) => last,
        Err(e) => {
            shared.transport.release(response);
            return Err(e.into());
        }
    };
    state.last_sequence = sequence + 1;

    if last && statement_type == StatementType::Plain {
        remove_state(shared, key);
    }
    send_response(shared, response, key.0)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::protocol::{
        LiteConnection, QueryRequest, SessionError,
        value::Row,
    };

    /// In-memory table `LT0 (ID INTEGER, NAME VARCHAR NULL)`.
    struct MemoryExecutor {
        rows: Vec<Row>,
    }

    impl MemoryExecutor {
        fn new(n: i32) -> Self {
            let rows = (0..n)
                .map(|i| {
                    let name = if i % 3 == 0 {
                        Value::Null
                    } else {
                        Value::Varchar(format!("node-{i}"))
                    };
                    vec![Value::Integer(i), name]
                })
                .collect();
            Self { rows }
        }

        fn describe_table(&self, sql: &str) -> Result<ResultDescription, ExecutorError> {
            if !sql.to_lowercase().starts_with("select") {
                return Err(ExecutorError::Query(format!("unsupported: {sql}")));
            }
            Ok(ResultDescription {
                columns: vec![
                    ColumnMetadata {
                        name: "ID".into(),
                        column_type: ColumnType::Integer,
                        precision: 10,
                        display_size: 11,
                        ..Default::default()
                    },
                    ColumnMetadata {
                        name: "NAME".into(),
                        column_type: ColumnType::Varchar,
                        precision: 32,
                        display_size: 32,
                        ..Default::default()
                    },
                ],
                nullable_columns: vec![2],
                parameter_count: sql.matches('?').count() as u32,
            })
        }
    }

    impl QueryExecutor for MemoryExecutor {
        fn describe(&self, sql: &str) -> Result<ResultDescription, ExecutorError> {
            if sql.contains("slow") {
                thread::sleep(Duration::from_millis(100));
            }
            self.describe_table(sql)
        }

        /// `?` binds the ID, or picks the rows without a NAME when bound to null.
        fn execute(&self, _sql: &str, parameters: &[Value]) -> Result<RowSource, ExecutorError> {
            let rows: Vec<Row> = match parameters.first() {
                Some(Value::Null) => self.rows.iter().filter(|r| r[1].is_null()).cloned().collect(),
                Some(id) => self.rows.iter().filter(|r| &r[0] == id).cloned().collect(),
                None => self.rows.clone(),
            };
            Ok(Box::new(rows.into_iter()))
        }
    }

    fn start(rows: i32, datagram_size: usize) -> ServerHandle {
        let options = ServerOptions {
            datagram_size,
            workers: 2,
            ..Default::default()
        };
        LiteServer::bind("127.0.0.1:0".parse().unwrap(), MemoryExecutor::new(rows), options)
            .unwrap()
            .spawn()
            .unwrap()
    }

    fn connect(server: &ServerHandle, datagram_size: usize) -> LiteConnection {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        LiteConnection::with_channel(
            socket,
            server.local_addr(),
            Arc::new(MessagePool::default()),
            datagram_size,
            Duration::from_secs(5),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn plain_query_streams_all_rows() {
        let server = start(60, 200);
        let mut conn = connect(&server, 200);

        let mut session = conn.query("select * from LT0").unwrap();
        let rows = session.collect_rows().unwrap();
        drop(session);

        assert_eq!(rows, MemoryExecutor::new(60).rows);
        assert!(wait_for(|| server.active_queries() == 0));
        server.shutdown().unwrap();
    }

    #[test]
    fn small_result_fits_in_metadata() {
        let server = start(2, DATAGRAM_SIZE);
        let mut conn = connect(&server, DATAGRAM_SIZE);

        let mut session = conn.query("select * from LT0").unwrap();
        assert_eq!(server.active_queries(), 0);
        assert_eq!(session.columns()[1].name, "NAME");
        assert_eq!(session.collect_rows().unwrap().len(), 2);
    }

    #[test]
    fn prepared_statement_keeps_state_until_close() {
        let server = start(20, DATAGRAM_SIZE);
        let mut conn = connect(&server, DATAGRAM_SIZE);

        let mut session = conn.prepare("select * from LT0 where ID = ?").unwrap();
        assert_eq!(session.parameter_count(), 1);

        session.execute(&[Value::Integer(4)]).unwrap();
        assert_eq!(
            session.collect_rows().unwrap(),
            vec![vec![Value::Integer(4), Value::Varchar("node-4".into())]]
        );
        session.execute(&[Value::Integer(6)]).unwrap();
        assert_eq!(
            session.collect_rows().unwrap(),
            vec![vec![Value::Integer(6), Value::Null]]
        );
        assert_eq!(server.active_queries(), 1);

        session.close().unwrap();
        assert!(wait_for(|| server.active_queries() == 0));
    }

    #[test]
    fn null_parameter_reaches_the_executor_as_null() {
        let server = start(9, DATAGRAM_SIZE);
        let mut conn = connect(&server, DATAGRAM_SIZE);

        let mut session = conn.prepare("select * from LT0 where NAME is ?").unwrap();
        session.execute(&[Value::Null]).unwrap();
        let ids: Vec<Value> = session
            .collect_rows()
            .unwrap()
            .into_iter()
            .map(|row| row[0].clone())
            .collect();
        assert_eq!(
            ids,
            vec![Value::Integer(0), Value::Integer(3), Value::Integer(6)]
        );
    }

    #[test]
    fn concurrent_duplicate_query_is_answered_once() {
        let server = start(200, 300);
        let client = ProtocolTransport::new(
            UdpSocket::bind("127.0.0.1:0").unwrap(),
            Arc::new(MessagePool::default()),
            300,
        );
        let mut buf = vec![0; RECEIVE_BUFFER_SIZE];

        let mut query = Message::new(MessageType::QueryRequest);
        query.set_header("twice", 0);
        query.payload = Payload::QueryRequest(QueryRequest {
            statement_type: Some(StatementType::Plain),
            query: Some("select slow from LT0".into()),
        });
        client.send(&query, server.local_addr()).unwrap();
        client.send(&query, server.local_addr()).unwrap();

        let meta = client
            .recv(&mut buf, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(meta.kind(), MessageType::MetaData);
        assert!(matches!(
            client.recv(&mut buf, Some(Duration::from_millis(400))),
            Err(TransportError::TimedOut)
        ));
        assert_eq!(server.active_queries(), 1);
    }

    #[test]
    fn failing_query_gets_no_reply() {
        let server = start(1, DATAGRAM_SIZE);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut conn = LiteConnection::with_channel(
            socket,
            server.local_addr(),
            Arc::new(MessagePool::default()),
            DATAGRAM_SIZE,
            Duration::from_millis(300),
        );
        assert!(matches!(
            conn.query("drop table LT0"),
            Err(SessionError::Timeout { .. })
        ));
    }

    #[test]
    fn duplicate_requests_are_ignored() {
        let server = start(200, 300);
        let client = ProtocolTransport::new(
            UdpSocket::bind("127.0.0.1:0").unwrap(),
            Arc::new(MessagePool::default()),
            300,
        );
        let mut buf = vec![0; RECEIVE_BUFFER_SIZE];
        let timeout = Some(Duration::from_millis(300));

        let mut query = Message::new(MessageType::QueryRequest);
        query.set_header("dup", 0);
        query.payload = Payload::QueryRequest(QueryRequest {
            statement_type: Some(StatementType::Plain),
            query: Some("select * from LT0".into()),
        });
        client.send(&query, server.local_addr()).unwrap();
        let meta = client.recv(&mut buf, timeout).unwrap();
        assert_eq!(meta.kind(), MessageType::MetaData);
        assert_eq!(meta.sequence_number, Some(1));
        assert!(!meta.batch().unwrap().contains_last_values);

        client.send(&query, server.local_addr()).unwrap();
        assert!(matches!(
            client.recv(&mut buf, timeout),
            Err(TransportError::TimedOut)
        ));

        let mut next = Message::new(MessageType::NextValuesRequest);
        next.set_header("dup", 2);
        client.send(&next, server.local_addr()).unwrap();
        let response = client.recv(&mut buf, timeout).unwrap();
        assert_eq!(response.sequence_number, Some(3));

        client.send(&next, server.local_addr()).unwrap();
        assert!(matches!(
            client.recv(&mut buf, timeout),
            Err(TransportError::TimedOut)
        ));

        let mut close = Message::new(MessageType::CloseRequest);
        close.set_header("dup", 4);
        client.send(&close, server.local_addr()).unwrap();
        assert!(wait_for(|| server.active_queries() == 0));
    }
}
