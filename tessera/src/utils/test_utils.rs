//! Test helpers: tracing setup and an in-process node which speaks enough of
//! the protocol for the driver to bootstrap, route and run statements.
//!
//! A [`MockNode`] answers the handshake, `USE`, the system table queries the
//! driver issues during metadata refresh, `PREPARE` and `EXECUTE`. Everything
//! else gets a `Void` result. [`Rule`]s override the default reaction for
//! matching requests, and every request is recorded for later inspection.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tessera_cql::frame::request::{Request, RequestOpcode};
use tessera_cql::frame::response::authenticate::{AuthSuccess, Authenticate};
use tessera_cql::frame::response::error::{DbError, Error};
use tessera_cql::frame::response::event::Event;
use tessera_cql::frame::response::result::{
    self, ColumnSpec, PartitionKeyIndex, Prepared, PreparedMetadata, ResultMetadata, Rows,
    TableSpec,
};
use tessera_cql::frame::response::{Response, ResponseOpcode, Supported};
use tessera_cql::frame::{self, EVENT_STREAM_ID};
use tessera_cql::value::{ColumnType, CqlValue};
use tessera_cql::{Consistency, SerialConsistency};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::warn;
use uuid::Uuid;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) const SCHEMA_VERSION: Uuid = Uuid::from_u128(0x5c4e_0001);

pub(crate) fn loopback(n: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
}

/// What a node reports about itself in `system.local`, and what its peers
/// report about it in `system.peers`.
#[derive(Clone, Debug)]
pub(crate) struct NodeInfo {
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    pub(crate) tokens: Vec<i64>,
    pub(crate) host_id: Uuid,
    pub(crate) schema_version: Uuid,
}

impl NodeInfo {
    pub(crate) fn new(datacenter: &str, tokens: &[i64]) -> Self {
        Self {
            datacenter: datacenter.to_owned(),
            rack: "rack1".to_owned(),
            tokens: tokens.to_vec(),
            host_id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self::new("dc1", &[0])
    }
}

pub(crate) type SharedInfo = Arc<StdMutex<NodeInfo>>;

#[derive(Clone, Debug)]
pub(crate) enum Reaction {
    /// Answer normally, but only after the delay.
    Delay(Duration),
    Error(DbError, String),
    Result(result::Result),
    /// Close the connection without answering.
    DropConnection,
    NoReply,
}

/// Overrides the reaction to requests with the given opcode whose text
/// (query text, or prepared statement text for `EXECUTE`) contains a pattern.
#[derive(Clone, Debug)]
pub(crate) struct Rule {
    opcode: RequestOpcode,
    text: Option<String>,
    reaction: Reaction,
    remaining: Option<usize>,
}

impl Rule {
    pub(crate) fn on(opcode: RequestOpcode) -> Self {
        Self {
            opcode,
            text: None,
            reaction: Reaction::NoReply,
            remaining: None,
        }
    }

    pub(crate) fn containing(mut self, text: &str) -> Self {
        self.text = Some(text.to_owned());
        self
    }

    pub(crate) fn then(mut self, reaction: Reaction) -> Self {
        self.reaction = reaction;
        self
    }

    /// Applies only to the next `n` matching requests.
    pub(crate) fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, opcode: RequestOpcode, text: Option<&str>) -> bool {
        self.remaining != Some(0)
            && self.opcode == opcode
            && match (&self.text, text) {
                (None, _) => true,
                (Some(pattern), Some(text)) => text.contains(pattern.as_str()),
                (Some(_), None) => false,
            }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub(crate) connection: u64,
    pub(crate) stream: i16,
    pub(crate) opcode: RequestOpcode,
    pub(crate) text: Option<String>,
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<SerialConsistency>,
    pub(crate) values: Vec<Option<Vec<u8>>>,
}

struct ConnectionSlot {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    registered: bool,
    abort: AbortHandle,
}

#[derive(Default)]
struct MockState {
    peers: Vec<(IpAddr, SharedInfo)>,
    keyspaces: Vec<(String, Vec<(String, String)>)>,
    credentials: Option<(String, String)>,
    rules: Vec<Rule>,
    requests: Vec<RecordedRequest>,
    prepared: HashMap<Bytes, String>,
    statement_types: HashMap<String, (Vec<ColumnType>, Vec<u16>)>,
    connections: HashMap<u64, ConnectionSlot>,
    next_connection_id: u64,
    accepted: usize,
}

/// A fake node listening on a loopback address.
pub(crate) struct MockNode {
    address: SocketAddr,
    info: SharedInfo,
    state: Arc<StdMutex<MockState>>,
    listener: StdMutex<Option<AbortHandle>>,
}

impl MockNode {
    /// Starts a node on 127.0.0.1 with an ephemeral port.
    pub(crate) async fn start() -> MockNode {
        Self::start_at(SocketAddr::new(loopback(1), 0), NodeInfo::default()).unwrap()
    }

    pub(crate) fn start_at(addr: SocketAddr, info: NodeInfo) -> io::Result<MockNode> {
        let listener = Self::bind(addr)?;
        let node = MockNode {
            address: listener.local_addr()?,
            info: Arc::new(StdMutex::new(info)),
            state: Arc::new(StdMutex::new(MockState::default())),
            listener: StdMutex::new(None),
        };
        node.spawn_listener(listener);
        Ok(node)
    }

    fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(128)
    }

    fn spawn_listener(&self, listener: TcpListener) {
        let handle = tokio::spawn(accept_loop(listener, self.state.clone(), self.info.clone()));
        *lock(&self.listener) = Some(handle.abort_handle());
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn info(&self) -> SharedInfo {
        self.info.clone()
    }

    pub(crate) fn host_id(&self) -> Uuid {
        lock(&self.info).host_id
    }

    pub(crate) fn set_schema_version(&self, version: Uuid) {
        lock(&self.info).schema_version = version;
    }

    pub(crate) fn set_peers(&self, peers: Vec<(IpAddr, SharedInfo)>) {
        lock(&self.state).peers = peers;
    }

    pub(crate) fn set_keyspace(&self, name: &str, replication: &[(&str, &str)]) {
        let replication = replication
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut state = lock(&self.state);
        state.keyspaces.retain(|(ks, _)| ks != name);
        state.keyspaces.push((name.to_owned(), replication));
    }

    pub(crate) fn require_password(&self, username: &str, password: &str) {
        lock(&self.state).credentials = Some((username.to_owned(), password.to_owned()));
    }

    /// Bind marker types and partition key bind indexes reported on `PREPARE`.
    /// Unregistered statements get one `text` marker per `?` and no key.
    pub(crate) fn register_statement(&self, text: &str, types: Vec<ColumnType>, pk_indexes: Vec<u16>) {
        lock(&self.state)
            .statement_types
            .insert(text.to_owned(), (types, pk_indexes));
    }

    pub(crate) fn add_rule(&self, rule: Rule) {
        lock(&self.state).rules.push(rule);
    }

    pub(crate) fn clear_rules(&self) {
        lock(&self.state).rules.clear();
    }

    pub(crate) fn forget_prepared(&self) {
        lock(&self.state).prepared.clear();
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state).requests.clone()
    }

    pub(crate) fn clear_requests(&self) {
        lock(&self.state).requests.clear();
    }

    pub(crate) fn count(&self, opcode: RequestOpcode) -> usize {
        lock(&self.state)
            .requests
            .iter()
            .filter(|r| r.opcode == opcode)
            .count()
    }

    pub(crate) fn count_matching(&self, opcode: RequestOpcode, pattern: &str) -> usize {
        lock(&self.state)
            .requests
            .iter()
            .filter(|r| r.opcode == opcode && r.text.as_deref().is_some_and(|t| t.contains(pattern)))
            .count()
    }

    pub(crate) fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        lock(&self.state).accepted
    }

    /// Sends an event to every connection which registered for events.
    pub(crate) fn push_event(&self, event: &Event) {
        let frame = encode(EVENT_STREAM_ID, &Response::Event(event.clone()));
        for slot in lock(&self.state).connections.values() {
            if slot.registered {
                let _ = slot.frames.send(frame.clone());
            }
        }
    }

    /// Sends a raw frame to every connection.
    pub(crate) fn push_frame(&self, stream: i16, opcode: ResponseOpcode, body: &[u8]) {
        let frame = frame::make_response_frame(stream, opcode, body);
        for slot in lock(&self.state).connections.values() {
            let _ = slot.frames.send(frame.clone());
        }
    }

    pub(crate) fn drop_connections(&self) {
        let slots: Vec<_> = lock(&self.state).connections.drain().collect();
        for (_, slot) in slots {
            slot.abort.abort();
        }
    }

    /// Stops listening and closes every connection. New connections are refused.
    pub(crate) fn stop(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.drop_connections();
    }

    pub(crate) fn restart(&self) -> io::Result<()> {
        let listener = Self::bind(self.address)?;
        self.spawn_listener(listener);
        Ok(())
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts one node per entry on 127.0.0.1, 127.0.0.2, ... sharing one port,
/// each listing all others in `system.peers`.
pub(crate) async fn mock_cluster(infos: &[NodeInfo]) -> Vec<MockNode> {
    'attempt: for _ in 0..32 {
        let Ok(first) = MockNode::start_at(SocketAddr::new(loopback(1), 0), infos[0].clone()) else {
            continue;
        };
        let port = first.address().port();
        let mut nodes = vec![first];
        for (i, info) in infos.iter().enumerate().skip(1) {
            match MockNode::start_at(SocketAddr::new(loopback(i as u8 + 1), port), info.clone()) {
                Ok(node) => nodes.push(node),
                Err(_) => continue 'attempt,
            }
        }

        for node in &nodes {
            let peers = nodes
                .iter()
                .filter(|other| other.address() != node.address())
                .map(|other| (other.address().ip(), other.info()))
                .collect();
            node.set_peers(peers);
        }
        return nodes;
    }
    panic!("Could not bind a mock cluster of {} nodes", infos.len());
}

async fn accept_loop(listener: TcpListener, state: Arc<StdMutex<MockState>>, info: SharedInfo) {
    while let Ok((socket, _)) = listener.accept().await {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        // Registered under the lock so that a quickly finishing task
        // cannot try to unregister before it is registered.
        let mut guard = lock(&state);
        let connection_id = guard.next_connection_id;
        guard.next_connection_id += 1;
        guard.accepted += 1;
        let task = tokio::spawn(serve_connection(
            socket,
            connection_id,
            state.clone(),
            info.clone(),
            frames_tx.clone(),
            frames_rx,
        ));
        guard.connections.insert(
            connection_id,
            ConnectionSlot {
                frames: frames_tx,
                registered: false,
                abort: task.abort_handle(),
            },
        );
    }
}

async fn serve_connection(
    socket: TcpStream,
    connection_id: u64,
    state: Arc<StdMutex<MockState>>,
    info: SharedInfo,
    frames_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = socket.into_split();

    let writer = async move {
        while let Some(frame) = frames_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    };
    let reader = async {
        while let Ok((params, opcode, body)) = frame::read_request_frame(&mut read_half).await {
            let flow = handle_request(&state, &info, connection_id, params.stream, opcode, body, &frames_tx);
            if flow.is_break() {
                break;
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    lock(&state).connections.remove(&connection_id);
}

fn encode(stream: i16, response: &Response) -> Vec<u8> {
    let mut body = Vec::new();
    response.serialize(&mut body).unwrap();
    frame::make_response_frame(stream, response.opcode(), &body)
}

fn handle_request(
    state: &StdMutex<MockState>,
    info: &StdMutex<NodeInfo>,
    connection_id: u64,
    stream: i16,
    opcode: RequestOpcode,
    body: Bytes,
    frames: &mpsc::UnboundedSender<Vec<u8>>,
) -> ControlFlow<()> {
    let request = match Request::deserialize(&mut &body[..], opcode) {
        Ok(request) => request,
        Err(err) => {
            warn!("Mock node could not parse a {} request: {}", opcode, err);
            return ControlFlow::Break(());
        }
    };

    let mut state = lock(state);
    let text = match &request {
        Request::Query(q) => Some(q.contents.to_string()),
        Request::Prepare(p) => Some(p.query.to_string()),
        Request::Execute(e) => state.prepared.get(&e.id).cloned(),
        _ => None,
    };
    let parameters = match &request {
        Request::Query(q) => Some(&q.parameters),
        Request::Execute(e) => Some(&e.parameters),
        _ => None,
    };
    state.requests.push(RecordedRequest {
        connection: connection_id,
        stream,
        opcode,
        text: text.clone(),
        consistency: parameters.map(|p| p.consistency),
        serial_consistency: parameters.and_then(|p| p.serial_consistency),
        values: parameters
            .map(|p| p.values.iter().map(|v| v.map(<[u8]>::to_vec)).collect())
            .unwrap_or_default(),
    });

    let reaction = state
        .rules
        .iter_mut()
        .find(|rule| rule.matches(opcode, text.as_deref()))
        .map(|rule| {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            rule.reaction.clone()
        });

    let (delay, response) = match reaction {
        Some(Reaction::NoReply) => return ControlFlow::Continue(()),
        Some(Reaction::DropConnection) => return ControlFlow::Break(()),
        Some(Reaction::Error(error, reason)) => (None, Response::Error(Error { error, reason })),
        Some(Reaction::Result(result)) => (None, Response::Result(result)),
        Some(Reaction::Delay(delay)) => (Some(delay), state.respond(&request, connection_id, info)),
        None => (None, state.respond(&request, connection_id, info)),
    };
    drop(state);

    let frame = encode(stream, &response);
    match delay {
        Some(delay) => {
            let frames = frames.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = frames.send(frame);
            });
        }
        None => {
            let _ = frames.send(frame);
        }
    }
    ControlFlow::Continue(())
}

fn statement_id(text: &str) -> Bytes {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    Bytes::copy_from_slice(&hasher.finish().to_be_bytes())
}

fn column(table: &str, name: &str, typ: ColumnType) -> ColumnSpec {
    let (ks_name, table_name) = table.split_once('.').unwrap_or(("ks", table));
    ColumnSpec {
        table_spec: TableSpec {
            ks_name: ks_name.to_owned(),
            table_name: table_name.to_owned(),
        },
        name: name.to_owned(),
        typ,
    }
}

fn rows_response(table: &str, columns: &[(&str, ColumnType)], rows: Vec<Vec<Option<CqlValue>>>) -> Response {
    let col_specs: Vec<ColumnSpec> = columns
        .iter()
        .map(|(name, typ)| column(table, name, typ.clone()))
        .collect();
    let raw_rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(col_specs.iter())
                .map(|(value, spec)| {
                    value.map(|value| {
                        let mut buf = Vec::new();
                        value.serialize(&spec.typ, &mut buf).unwrap();
                        Bytes::from(buf)
                    })
                })
                .collect()
        })
        .collect();

    Response::Result(result::Result::Rows(Rows {
        metadata: Arc::new(ResultMetadata {
            col_count: col_specs.len(),
            col_specs,
        }),
        paging_state: None,
        rows: raw_rows,
    }))
}

fn tokens_value(tokens: &[i64]) -> CqlValue {
    CqlValue::Set(tokens.iter().map(|t| CqlValue::Text(t.to_string())).collect())
}

fn tokens_type() -> ColumnType {
    ColumnType::Set(Box::new(ColumnType::Text))
}

impl MockState {
    fn respond(&mut self, request: &Request<'_>, connection_id: u64, info: &StdMutex<NodeInfo>) -> Response {
        match request {
            Request::Options => {
                let mut options = HashMap::new();
                options.insert("CQL_VERSION".to_owned(), vec!["3.4.5".to_owned()]);
                Response::Supported(Supported { options })
            }
            Request::Startup(_) => match self.credentials {
                Some(_) => Response::Authenticate(Authenticate {
                    authenticator_name: "org.apache.cassandra.auth.PasswordAuthenticator".to_owned(),
                }),
                None => Response::Ready,
            },
            Request::AuthResponse(auth) => {
                let expected = self.credentials.as_ref().map(|(user, pass)| {
                    let mut token = vec![0];
                    token.extend_from_slice(user.as_bytes());
                    token.push(0);
                    token.extend_from_slice(pass.as_bytes());
                    token
                });
                if expected.is_some() && expected == auth.response {
                    Response::AuthSuccess(AuthSuccess {
                        success_message: None,
                    })
                } else {
                    Response::Error(Error {
                        error: DbError::AuthenticationError,
                        reason: "Provided username and/or password are incorrect".to_owned(),
                    })
                }
            }
            Request::Register(_) => {
                if let Some(slot) = self.connections.get_mut(&connection_id) {
                    slot.registered = true;
                }
                Response::Ready
            }
            Request::Query(query) => self.answer_query(&query.contents, info),
            Request::Prepare(prepare) => self.prepare(&prepare.query),
            Request::Execute(execute) => {
                if self.prepared.contains_key(&execute.id) {
                    Response::Result(result::Result::Void)
                } else {
                    Response::Error(Error {
                        error: DbError::Unprepared {
                            statement_id: execute.id.clone(),
                        },
                        reason: "Prepared statement not found".to_owned(),
                    })
                }
            }
            _ => Response::Error(Error {
                error: DbError::ProtocolError,
                reason: "Unsupported request".to_owned(),
            }),
        }
    }

    fn answer_query(&self, text: &str, info: &StdMutex<NodeInfo>) -> Response {
        let trimmed = text.trim_start();
        if trimmed.len() > 4 && trimmed[..4].eq_ignore_ascii_case("USE ") {
            let keyspace = trimmed[4..].trim().trim_matches('"');
            return Response::Result(result::Result::SetKeyspace(keyspace.to_owned()));
        }

        if text.contains("system.local") {
            let info = lock(info).clone();
            rows_response(
                "system.local",
                &[
                    ("key", ColumnType::Text),
                    ("data_center", ColumnType::Text),
                    ("rack", ColumnType::Text),
                    ("tokens", tokens_type()),
                    ("schema_version", ColumnType::Uuid),
                    ("host_id", ColumnType::Uuid),
                ],
                vec![vec![
                    Some(CqlValue::Text("local".to_owned())),
                    Some(CqlValue::Text(info.datacenter)),
                    Some(CqlValue::Text(info.rack)),
                    Some(tokens_value(&info.tokens)),
                    Some(CqlValue::Uuid(info.schema_version)),
                    Some(CqlValue::Uuid(info.host_id)),
                ]],
            )
        } else if text.contains("system.peers") {
            let rows = self
                .peers
                .iter()
                .map(|(ip, peer_info)| {
                    let info = lock(peer_info).clone();
                    vec![
                        Some(CqlValue::Inet(*ip)),
                        Some(CqlValue::Inet(*ip)),
                        Some(CqlValue::Text(info.datacenter)),
                        Some(CqlValue::Text(info.rack)),
                        Some(tokens_value(&info.tokens)),
                        Some(CqlValue::Uuid(info.schema_version)),
                        Some(CqlValue::Uuid(info.host_id)),
                    ]
                })
                .collect();
            rows_response(
                "system.peers",
                &[
                    ("peer", ColumnType::Inet),
                    ("rpc_address", ColumnType::Inet),
                    ("data_center", ColumnType::Text),
                    ("rack", ColumnType::Text),
                    ("tokens", tokens_type()),
                    ("schema_version", ColumnType::Uuid),
                    ("host_id", ColumnType::Uuid),
                ],
                rows,
            )
        } else if text.contains("system_schema.keyspaces") {
            let rows = self
                .keyspaces
                .iter()
                .map(|(name, replication)| {
                    vec![
                        Some(CqlValue::Text(name.clone())),
                        Some(CqlValue::Map(
                            replication
                                .iter()
                                .map(|(k, v)| (CqlValue::Text(k.clone()), CqlValue::Text(v.clone())))
                                .collect(),
                        )),
                    ]
                })
                .collect();
            rows_response(
                "system_schema.keyspaces",
                &[
                    ("keyspace_name", ColumnType::Text),
                    (
                        "replication",
                        ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
                    ),
                ],
                rows,
            )
        } else {
            Response::Result(result::Result::Void)
        }
    }

    fn prepare(&mut self, text: &str) -> Response {
        let id = statement_id(text);
        self.prepared.insert(id.clone(), text.to_owned());

        let (types, pk) = self
            .statement_types
            .get(text)
            .cloned()
            .unwrap_or_else(|| (vec![ColumnType::Text; text.matches('?').count()], Vec::new()));
        let col_specs: Vec<ColumnSpec> = types
            .into_iter()
            .enumerate()
            .map(|(i, typ)| column("ks.t", &format!("v{}", i), typ))
            .collect();
        let pk_indexes = pk
            .into_iter()
            .enumerate()
            .map(|(sequence, index)| PartitionKeyIndex {
                index,
                sequence: sequence as u16,
            })
            .collect();

        Response::Result(result::Result::Prepared(Prepared {
            id,
            prepared_metadata: PreparedMetadata {
                flags: 0,
                col_count: col_specs.len(),
                pk_indexes,
                col_specs,
            },
            result_metadata: ResultMetadata::default(),
        }))
    }
}
