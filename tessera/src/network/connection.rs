use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tessera_cql::frame::request::{self, options, SerializableRequest};
use tessera_cql::frame::response::event::Event;
use tessera_cql::frame::response::{result, NonErrorResponse, Response, ResponseOpcode};
use tessera_cql::frame::server_event_type::EventType;
use tessera_cql::frame::{
    self, parse_response_body_extensions, Compression, FrameParams, SerializedRequest,
    EVENT_STREAM_ID,
};
use tessera_cql::value::SerializedValues;
use tessera_cql::{Consistency, SerialConsistency};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::stream_table::{RequestId, StreamLookup, StreamTable};
use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, RequestAttemptError,
    UseKeyspaceError,
};

/// Streams abandoned longer than this are counted as old orphans.
pub(crate) const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

pub(crate) type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

/// Settings of a single connection. Derived from the session configuration.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) max_streams: usize,
    /// The connection breaks once more old orphans than this pile up.
    pub(crate) orphan_threshold: usize,
    pub(crate) orphan_age: Duration,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Set only for the control connection, which registers for events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
            max_streams: 128,
            orphan_threshold: 64,
            orphan_age: OLD_AGE_ORPHAN_THRESHOLD,
            authenticator: None,
            event_sender: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("compression", &self.compression)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("max_streams", &self.max_streams)
            .field("orphan_threshold", &self.orphan_threshold)
            .field("authenticator", &self.authenticator.is_some())
            .field("event_sender", &self.event_sender.is_some())
            .finish()
    }
}

/// A multiplexed connection to a single node.
///
/// Requests are handed to a router task which assigns them stream ids, writes
/// them and routes responses back by stream id. Dropping the connection stops
/// the router.
pub(crate) struct Connection {
    _router_task: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    // What was agreed in STARTUP; may differ from what was asked for.
    compression: Option<Compression>,
    link: Arc<RouterLink>,
    draining: Arc<AtomicUsize>,
    close_sender: StdMutex<Option<oneshot::Sender<BrokenConnectionError>>>,
}

struct PendingReply {
    reply: oneshot::Sender<Result<RawResponse, RequestAttemptError>>,
    request_id: RequestId,
}

struct Task {
    serialized: SerializedRequest,
    pending: PendingReply,
}

struct RawResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

// Sends the request id to the orphaner if the requester stops waiting
// before its response arrives.
struct OrphanGuard<'a> {
    enabled: bool,
    request_id: RequestId,
    orphans: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanGuard<'a> {
    fn new(request_id: RequestId, orphans: &'a mpsc::UnboundedSender<RequestId>) -> Self {
        Self {
            enabled: true,
            request_id,
            orphans,
        }
    }

    fn defuse(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanGuard<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.orphans.send(self.request_id);
        }
    }
}

struct LoadGuard<'a>(&'a AtomicUsize);

impl<'a> LoadGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct RouterLink {
    submit: mpsc::Sender<Task>,
    next_request_id: AtomicU64,
    orphan_sender: mpsc::UnboundedSender<RequestId>,
    in_flight: AtomicUsize,
}

impl RouterLink {
    fn new_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
    ) -> Result<RawResponse, RequestAttemptError> {
        let serialized = SerializedRequest::make(request, compression, false)?;
        let request_id = self.new_request_id();
        let _load = LoadGuard::new(&self.in_flight);

        let (reply, receiver) = oneshot::channel();
        let pending = PendingReply {
            reply,
            request_id,
        };

        // Dropping this future after the task was submitted orphans the stream.
        let orphan_guard = OrphanGuard::new(request_id, &self.orphan_sender);

        self.submit
            .send(Task {
                serialized,
                pending,
            })
            .await
            .map_err(|_| BrokenConnectionError::ChannelError)?;

        let raw = receiver
            .await
            .map_err(|_| BrokenConnectionError::ChannelError)?;

        orphan_guard.defuse();

        raw
    }
}

/// A parsed response together with its body extensions.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

/// A response which is not an `ERROR`.
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn into_result(self) -> Result<result::Result, RequestAttemptError> {
        match self.response {
            NonErrorResponse::Result(res) => Ok(res),
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("compression", &self.compression)
            .field("load", &self.load())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Connection {
    // Opens the transport and spawns the router. No handshake is performed.
    async fn new(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(config.tcp_nodelay)?;
        if let Some(idle) = config.tcp_keepalive_interval {
            SockRef::from(&stream).set_tcp_keepalive(&Self::tcp_keepalive(idle))?;
        }

        // Bounded, so that a stalled writer pushes back on submitters.
        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (close_sender, close_receiver) = oneshot::channel();
        let (orphan_sender, orphan_receiver) =
            mpsc::unbounded_channel();

        let link = Arc::new(RouterLink {
            submit: sender,
            next_request_id: AtomicU64::new(0),
            orphan_sender,
            in_flight: AtomicUsize::new(0),
        });
        let draining = Arc::new(AtomicUsize::new(0));

        let (task, _router_task) = Self::router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            orphan_receiver,
            close_receiver,
            link.clone(),
            draining.clone(),
            addr,
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _router_task,
            connect_address: addr,
            compression: config.compression,
            config,
            link,
            draining,
            close_sender: StdMutex::new(Some(close_sender)),
        };

        Ok((connection, error_receiver))
    }

    // socket2 calls the idle time before the first probe "time" and the
    // gap between probes "interval"; the configured value is the former.
    fn tcp_keepalive(idle: Duration) -> TcpKeepalive {
        let keepalive = TcpKeepalive::new().with_time(idle);
        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "windows",
        ))]
        let keepalive = keepalive.with_interval(Duration::from_secs(1));
        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
        ))]
        let keepalive = keepalive.with_retries(10);
        keepalive
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Requests submitted and not yet answered, plus streams still draining.
    pub(crate) fn load(&self) -> usize {
        self.link.in_flight.load(Ordering::Relaxed) + self.draining.load(Ordering::Relaxed)
    }

    pub(crate) fn max_streams(&self) -> usize {
        self.config.max_streams
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.load() >= self.config.max_streams
    }

    /// Breaks the connection, failing every pending request with `reason`.
    pub(crate) fn close(&self, reason: BrokenConnectionError) {
        if let Some(sender) = lock(&self.close_sender).take() {
            debug!(
                "Closing connection to {}: {}",
                self.connect_address, reason
            );
            let _ = sender.send(reason);
        }
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress { self.compression } else { None };
        let raw = self
            .link
            .send_request(request, compression)
            .await?;
        Self::parse_response(raw, self.compression)
    }

    fn parse_response(
        raw: RawResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext =
            parse_response_body_extensions(raw.params.flags, compression, raw.body)?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(raw.opcode, body_with_ext.body, None)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
        })
    }

    async fn get_options(&self) -> Result<Response, RequestAttemptError> {
        Ok(self.send_request(&request::Options, false).await?.response)
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<Response, RequestAttemptError> {
        Ok(self
            .send_request(&request::Startup { options }, false)
            .await?
            .response)
    }

    async fn perform_authenticate(&self, authenticator_name: &str) -> Result<(), ConnectionError> {
        let Some(authenticator_provider) = self.config.authenticator.as_ref() else {
            return Err(ConnectionError::MissingAuthentication(
                authenticator_name.to_owned(),
            ));
        };

        let (mut response, mut auth_session) = authenticator_provider
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionError::AuthenticationError)?;

        loop {
            let auth_response = self
                .send_request(&request::AuthResponse { response }, false)
                .await?
                .response;
            match auth_response {
                Response::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                }
                Response::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationError)?;
                    return Ok(());
                }
                Response::Error(err) => {
                    return Err(ConnectionError::DbError(err.error, err.reason));
                }
                _ => {
                    return Err(ConnectionError::UnexpectedResponse(
                        "Expected AUTH_CHALLENGE or AUTH_SUCCESS",
                    ))
                }
            }
        }
    }

    async fn register(&self, event_types_to_register_for: Vec<EventType>) -> Result<(), ConnectionError> {
        let register_frame = request::Register {
            event_types_to_register_for,
        };
        match self.send_request(&register_frame, true).await?.response {
            Response::Ready => Ok(()),
            Response::Error(err) => Err(ConnectionError::DbError(err.error, err.reason)),
            _ => Err(ConnectionError::UnexpectedResponse("Expected READY after REGISTER")),
        }
    }

    pub(crate) async fn query_unpaged(
        &self,
        contents: &str,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = request::Query {
            contents: Cow::Borrowed(contents),
            parameters: request::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
            },
        };

        self.send_request(&query_frame, true).await
    }

    pub(crate) async fn execute_unpaged(
        &self,
        id: Bytes,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute_frame = request::Execute {
            id,
            parameters: request::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
            },
        };

        self.send_request(&execute_frame, true).await
    }

    pub(crate) async fn prepare(&self, statement: &str) -> Result<result::Prepared, RequestAttemptError> {
        let response = self
            .send_request(
                &request::Prepare {
                    query: Cow::Borrowed(statement),
                },
                true,
            )
            .await?
            .into_non_error_query_response()?;

        match response.into_result()? {
            result::Result::Prepared(prepared) => Ok(prepared),
            _ => Err(RequestAttemptError::UnexpectedResponse(
                "RESULT other than Prepared",
            )),
        }
    }

    /// Runs a single-page query against system tables.
    pub(crate) async fn query_rows(&self, contents: &str) -> Result<result::Rows, RequestAttemptError> {
        let response = self
            .query_unpaged(contents, SerializedValues::EMPTY, Consistency::One, None)
            .await?
            .into_non_error_query_response()?;

        match response.into_result()? {
            result::Result::Rows(rows) => Ok(rows),
            _ => Err(RequestAttemptError::UnexpectedResponse(
                "RESULT other than Rows",
            )),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // A keyspace cannot be a bind marker, so the name goes into the text.
        let statement = if keyspace_name.is_case_sensitive {
            format!("USE \"{}\"", keyspace_name.as_str())
        } else {
            format!("USE {}", keyspace_name.as_str())
        };

        let result = self
            .query_unpaged(&statement, SerializedValues::EMPTY, Consistency::One, None)
            .await?
            .into_non_error_query_response()?
            .into_result()?;

        let result::Result::SetKeyspace(switched_to) = result else {
            return Err(UseKeyspaceError::UnexpectedResponse("RESULT other than SetKeyspace"));
        };
        if switched_to.eq_ignore_ascii_case(keyspace_name.as_str()) {
            Ok(())
        } else {
            Err(UseKeyspaceError::KeyspaceNameMismatch {
                expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                result_keyspace_name_lowercase: switched_to.to_lowercase(),
            })
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        mut task_receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<BrokenConnectionError>,
        orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
        close_receiver: oneshot::Receiver<BrokenConnectionError>,
        link: Arc<RouterLink>,
        draining: Arc<AtomicUsize>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // Reader, writer and orphaner run on the same task and never hold the
        // lock across an await point, so it is never contended.
        let streams = StdMutex::new(StreamTable::new(config.max_streams, draining));

        let k = Self::keepaliver(link, config.keepalive_interval, node_address);
        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &streams,
            config.event_sender.as_ref(),
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &streams,
            &mut task_receiver,
        );
        let o = Self::orphaner(
            &streams,
            orphan_receiver,
            config.orphan_threshold,
            config.orphan_age,
        );
        let c = Self::closer(close_receiver);

        let result = futures::try_join!(r, w, o, k, c);

        // Ok only when every submitter is gone.
        let Err(error) = result else {
            return;
        };
        debug!("Connection to {} broke: {}", node_address, error);

        // Every request in flight, and every one still queued for a stream
        // id, fails with the same error. Requesters that gave up are skipped.
        let in_flight = streams
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_handlers();
        task_receiver.close();
        let queued = std::iter::from_fn(|| task_receiver.try_recv().ok()).map(|task| task.pending);
        for handler in in_flight.into_iter().chain(queued) {
            let _ = handler.reply.send(Err(error.clone().into()));
        }

        let _ = error_sender.send(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        streams: &StdMutex<StreamTable<PendingReply>>,
        event_sender: Option<&mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(|err| BrokenConnectionError::ReadError(Arc::new(err)))?;
            let response = RawResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&EVENT_STREAM_ID) {
                std::cmp::Ordering::Less => {
                    // Other negative ids are reserved for the server.
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    if let Some(event_sender) = event_sender {
                        Self::handle_event(response, compression, event_sender).await;
                    }
                    continue;
                }
                _ => {}
            }

            let lookup = lock(streams).complete(params.stream);

            match lookup {
                StreamLookup::Handler(handler) => {
                    // The requester may have timed out in the meantime.
                    let _ = handler.reply.send(Ok(response));
                }
                StreamLookup::Drained => {
                    trace!(
                        "Received late response on stream {}; the stream is free again",
                        params.stream
                    );
                }
                StreamLookup::Missing => {
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
            }
        }
    }

    fn alloc_stream_id(
        streams: &StdMutex<StreamTable<PendingReply>>,
        pending: PendingReply,
    ) -> Option<i16> {
        let request_id = pending.request_id;
        match lock(streams).allocate(request_id, pending) {
            Ok(stream_id) => Some(stream_id),
            Err(pending) => {
                debug!("Could not allocate stream id");
                let _ = pending
                    .reply
                    .send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        streams: &StdMutex<StreamTable<PendingReply>>,
        task_receiver: &mut mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        let write_error = |err: std::io::Error| BrokenConnectionError::WriteError(Arc::new(err));

        // Ends once the Connection, and with it the submit channel, is dropped.
        while let Some(mut task) = task_receiver.recv().await {
            let mut batch_len = 0;
            let mut batch_bytes = 0;
            loop {
                let Task {
                    mut serialized,
                    pending,
                } = task;
                // A requester that already gave up needs no stream.
                if !pending.reply.is_closed() {
                    if let Some(stream_id) = Self::alloc_stream_id(streams, pending) {
                        serialized.set_stream(stream_id);
                        let frame = serialized.get_data();
                        batch_bytes += frame.len();
                        batch_len += 1;
                        write_half.write_all(frame).await.map_err(write_error)?;
                    }
                }

                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => {
                        // Give other tasks a chance to submit before flushing.
                        tokio::task::yield_now().await;
                        match task_receiver.try_recv() {
                            Ok(t) => t,
                            Err(_) => break,
                        }
                    }
                };
            }
            trace!("Flushing {} frames ({} bytes)", batch_len, batch_bytes);
            write_half.flush().await.map_err(write_error)?;
        }

        Ok(())
    }

    // Marks abandoned streams as draining and breaks the connection if too
    // many of them grow old.
    async fn orphaner(
        streams: &StdMutex<StreamTable<PendingReply>>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
        orphan_threshold: usize,
        orphan_age: Duration,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stale = lock(streams).old_orphans(Instant::now(), orphan_age);
                    if stale > orphan_threshold {
                        warn!("{} streams waited more than {:?} for a late response", stale, orphan_age);
                        let stale = u16::try_from(stale).unwrap_or(u16::MAX);
                        return Err(BrokenConnectionError::TooManyOrphanedStreamIds(stale));
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!("Request {} abandoned; its stream drains", request_id);
                    lock(streams).orphan(request_id, Instant::now());
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        link: Arc<RouterLink>,
        keepalive_interval: Option<Duration>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(period) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            // Only idle connections need proof of life.
            if link.in_flight.load(Ordering::Relaxed) > 0 {
                continue;
            }

            // The reply must come before the next keepalive is due.
            let probe = link.send_request(&request::Options, None);
            match tokio::time::timeout(period, probe).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(BrokenConnectionError::KeepaliveRequestError(Arc::new(err))),
                Err(_) => return Err(BrokenConnectionError::KeepaliveTimeout(node_address)),
            }
        }
    }

    async fn closer(
        close_receiver: oneshot::Receiver<BrokenConnectionError>,
    ) -> Result<(), BrokenConnectionError> {
        match close_receiver.await {
            Ok(reason) => Err(reason),
            // The Connection is gone, and the router with it.
            Err(_) => futures::future::pending().await,
        }
    }

    async fn handle_event(
        raw: RawResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) {
        let response = match Self::parse_response(raw, compression) {
            Ok(query_response) => query_response.response,
            Err(err) => {
                warn!("Failed to parse an event frame: {}", err);
                return;
            }
        };
        let event = match response {
            Response::Event(e) => e,
            other => {
                warn!(
                    "Expected to receive Event response, got {:?}",
                    other.opcode()
                );
                return;
            }
        };

        // The receiver may have been dropped during shutdown.
        let _ = event_sender.send(event).await;
    }
}

/// Opens a connection and performs the handshake: OPTIONS, STARTUP, the
/// optional SASL exchange, `USE` of the session keyspace, and REGISTER when
/// the connection is meant to receive events.
///
/// The whole procedure is bounded by the configured connect timeout.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    keyspace: Option<&VerifiedKeyspaceName>,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    tokio::time::timeout(config.connect_timeout, handshake(addr, keyspace, config))
        .await
        .unwrap_or(Err(ConnectionError::ConnectTimeout))
}

async fn handshake(
    addr: SocketAddr,
    keyspace: Option<&VerifiedKeyspaceName>,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    let supported = match connection.get_options().await? {
        Response::Supported(supported) => supported,
        Response::Error(err) => return Err(ConnectionError::DbError(err.error, err.reason)),
        _ => {
            return Err(ConnectionError::UnexpectedResponse(
                "Expected SUPPORTED in response to OPTIONS",
            ))
        }
    };

    let mut options: HashMap<Cow<'_, str>, Cow<'_, str>> = [
        (options::CQL_VERSION, options::DEFAULT_CQL_PROTOCOL_VERSION),
        (options::DRIVER_NAME, options::DEFAULT_DRIVER_NAME),
        (options::DRIVER_VERSION, env!("CARGO_PKG_VERSION")),
    ]
    .into_iter()
    .map(|(key, value)| (Cow::Borrowed(key), Cow::Borrowed(value)))
    .collect();

    if let Some(compression) = config.compression {
        let algorithm = compression.as_str();
        if supported.values(options::COMPRESSION).iter().any(|offered| offered == algorithm) {
            options.insert(Cow::Borrowed(options::COMPRESSION), Cow::Borrowed(algorithm));
        } else {
            warn!("{} does not offer {} compression; frames stay uncompressed", addr, algorithm);
            connection.compression = None;
        }
    }

    match connection.startup(options).await? {
        Response::Ready => {}
        Response::Authenticate(authenticate) => {
            connection
                .perform_authenticate(&authenticate.authenticator_name)
                .await?
        }
        Response::Error(err) => return Err(ConnectionError::DbError(err.error, err.reason)),
        _ => {
            return Err(ConnectionError::UnexpectedResponse(
                "Expected READY or AUTHENTICATE in response to STARTUP",
            ))
        }
    }

    if let Some(keyspace) = keyspace {
        connection
            .use_keyspace(keyspace)
            .await
            .map_err(|err| ConnectionError::UseKeyspace(Arc::new(err)))?;
    }

    if connection.config.event_sender.is_some() {
        connection.register(EventType::ALL.to_vec()).await?;
    }

    debug!("Opened connection to {}", addr);
    Ok((connection, error_receiver))
}

/// A keyspace name that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    /// Validates `keyspace_name`. A double-quoted name is case sensitive
    /// regardless of `case_sensitive`.
    pub(crate) fn new(keyspace_name: &str, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        let (name, is_case_sensitive) = match keyspace_name
            .strip_prefix('"')
            .and_then(|n| n.strip_suffix('"'))
        {
            Some(unquoted) => (unquoted, true),
            None => (keyspace_name, case_sensitive),
        };

        Self::verify_keyspace_name_is_valid(name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(name.to_owned()),
            is_case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 ASCII letters, digits or underscores. The server accepts a
    // leading underscore too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }
        if let Some(illegal) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(keyspace_name.to_owned(), illegal));
        }
        // All ASCII from here on, so bytes are characters.
        if keyspace_name.len() > 48 {
            return Err(BadKeyspaceName::TooLong(keyspace_name.to_owned(), keyspace_name.len()));
        }
        Ok(())
    }
}
