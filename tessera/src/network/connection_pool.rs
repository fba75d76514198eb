//! Per-host connection pool.
//!
//! The pool is split in two halves. [`NodeConnectionPool`] is the handle the
//! rest of the driver holds: it reads a published [`PoolState`] snapshot and
//! sends commands. A `PoolKeeper` task owns the connections, opens and
//! closes them, and republishes the snapshot after every change.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use itertools::Itertools;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::connection::{open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};
use crate::errors::{BrokenConnectionError, ConnectionError, ConnectionPoolError, RequestAttemptError, UseKeyspaceError};

/// Period of the scan for unused connections above the minimum size.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) min_connections: usize,
    pub(crate) max_connections: usize,
    pub(crate) reconnect_base_delay: Duration,
    pub(crate) reconnect_max_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            min_connections: 1,
            max_connections: 4,
            reconnect_base_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    fn min_size(&self) -> usize {
        self.min_connections.max(1)
    }

    fn max_size(&self) -> usize {
        self.max_connections.max(self.min_size())
    }
}

/// Reachability change of a pool's host.
#[derive(Debug, Clone)]
pub(crate) struct PoolEvent {
    pub(crate) address: SocketAddr,
    pub(crate) kind: PoolEventKind,
}

#[derive(Debug, Clone)]
pub(crate) enum PoolEventKind {
    /// A connection came up while none was.
    Established,
    /// The pool is empty and the last attempt to connect failed.
    Unreachable(ConnectionError),
}

/// What the handle sees of the pool.
enum PoolState {
    /// No fill has finished yet.
    Initializing,
    /// Empty after connecting failed; the keeper keeps trying.
    Broken(Arc<ConnectionError>),
    /// Host is down. Nothing is opened until resumed.
    Suspended,
    ShutDown,
    Ready(Vec<Arc<Connection>>),
}

impl PoolState {
    fn connections(&self) -> Result<&[Arc<Connection>], ConnectionPoolError> {
        match self {
            PoolState::Ready(conns) => Ok(conns),
            PoolState::Initializing => Err(ConnectionPoolError::Initializing),
            PoolState::Suspended => Err(ConnectionPoolError::Suspended),
            PoolState::ShutDown => Err(ConnectionPoolError::ShutDown),
            PoolState::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: Arc::clone(err),
            }),
        }
    }
}

impl std::fmt::Debug for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Initializing => f.write_str("Initializing"),
            PoolState::Suspended => f.write_str("Suspended"),
            PoolState::ShutDown => f.write_str("ShutDown"),
            PoolState::Broken(err) => f.debug_tuple("Broken").field(err).finish(),
            PoolState::Ready(conns) => {
                let loads = conns
                    .iter()
                    .format_with(", ", |conn, f| f(&format_args!("{:p}={}", Arc::as_ptr(conn), conn.load())));
                write!(f, "Ready[{loads}]")
            }
        }
    }
}

enum PoolCommand {
    Suspend,
    Resume,
    Shutdown(BrokenConnectionError),
    UseKeyspace {
        keyspace: VerifiedKeyspaceName,
        reply: oneshot::Sender<Result<(), UseKeyspaceError>>,
    },
}

/// Connections to one host, between a minimum and a maximum count.
///
/// Connections are multiplexed, so [`acquire`](Self::acquire) hands out a
/// shared handle to the least loaded connection that still has a free
/// stream. Nothing has to be given back. When every connection is saturated
/// the pool grows by one, up to its maximum; connections left unused above
/// the minimum are closed again. Lost connections are replaced with
/// jittered exponential backoff.
pub(crate) struct NodeConnectionPool {
    address: SocketAddr,
    state: Arc<ArcSwap<PoolState>>,
    commands: mpsc::UnboundedSender<PoolCommand>,
    grow: Arc<Notify>,
    updated: Arc<Notify>,
    acquire_timeout: Duration,
    max_size: usize,
    _keeper: RemoteHandle<()>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("address", &self.address)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        address: SocketAddr,
        config: &PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let keeper = PoolKeeper::new(address, config.clone(), keyspace, events);

        let state = keeper.state.clone();
        let grow = keeper.grow.clone();
        let updated = keeper.updated.clone();
        let (keeper_fut, keeper_handle) = keeper.run(command_receiver).remote_handle();
        tokio::spawn(keeper_fut);

        Self {
            address,
            state,
            commands,
            grow,
            updated,
            acquire_timeout: config.connection_config.connect_timeout,
            max_size: config.max_size(),
            _keeper: keeper_handle,
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.state.load(), PoolState::Ready(_))
    }

    /// A connection with a free stream.
    ///
    /// Fails at once when the pool is suspended, shut down, broken or
    /// saturated at its maximum size. While the pool is still initializing,
    /// or growing to take more load, waits for at most the connect timeout.
    pub(crate) async fn acquire(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        // Registered before the first look so that a publish in between wakes us.
        let updated = self.updated.notified();
        if let Some(outcome) = self.pick() {
            return outcome;
        }

        let _ = tokio::time::timeout(self.acquire_timeout, updated).await;
        self.pick().unwrap_or_else(|| {
            Err(match &**self.state.load() {
                PoolState::Ready(conns) => ConnectionPoolError::Saturated(conns.len()),
                _ => ConnectionPoolError::Initializing,
            })
        })
    }

    /// `None` means "try again after the next publish".
    fn pick(&self) -> Option<Result<Arc<Connection>, ConnectionPoolError>> {
        let state = self.state.load();
        let conns = match state.connections() {
            Ok(conns) => conns,
            Err(ConnectionPoolError::Initializing) => return None,
            Err(err) => return Some(Err(err)),
        };

        if let Some(conn) = conns
            .iter()
            .filter(|conn| !conn.is_saturated())
            .min_by_key(|conn| conn.load())
        {
            return Some(Ok(conn.clone()));
        }
        if conns.len() >= self.max_size {
            return Some(Err(ConnectionPoolError::Saturated(conns.len())));
        }
        trace!("[{}] Every connection is saturated, growing", self.address);
        self.grow.notify_one();
        None
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.state.load().connections().map(<[_]>::to_vec)
    }

    /// Returns once the first connection is up or the first fill has failed.
    pub(crate) async fn wait_until_initialized(&self) {
        let updated = self.updated.notified();
        if matches!(**self.state.load(), PoolState::Initializing) {
            updated.await;
        }
    }

    /// Closes every connection and stops reconnecting until [`resume`](Self::resume).
    pub(crate) fn suspend(&self) {
        // Published here as well, so no connection is handed out before the
        // keeper gets to the command.
        self.state.rcu(|state| match **state {
            PoolState::ShutDown => state.clone(),
            _ => Arc::new(PoolState::Suspended),
        });
        let _ = self.commands.send(PoolCommand::Suspend);
    }

    /// Starts reconnecting a suspended pool. Until a connection is up,
    /// `acquire` waits rather than fails.
    pub(crate) fn resume(&self) {
        self.state.rcu(|state| match **state {
            PoolState::Suspended => Arc::new(PoolState::Initializing),
            _ => state.clone(),
        });
        let _ = self.commands.send(PoolCommand::Resume);
    }

    /// Closes the pool for good. Requests in flight fail with `reason`.
    pub(crate) fn shutdown(&self, reason: BrokenConnectionError) {
        let _ = self.commands.send(PoolCommand::Shutdown(reason));
    }

    /// Switches every current and future connection to `keyspace`.
    pub(crate) async fn use_keyspace(&self, keyspace: VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        let (reply, replied) = oneshot::channel();
        self.commands
            .send(PoolCommand::UseKeyspace { keyspace, reply })
            .map_err(|_| UseKeyspaceError::SessionShutDown)?;
        replied.await.unwrap_or(Err(UseKeyspaceError::SessionShutDown))
    }
}

/// Delay before the next fill: doubles after a failed fill, resets after a
/// clean one, and is drawn from the upper half of the current value.
struct FillBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl FillBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    fn next_delay(&mut self, fill_failed: bool) -> Duration {
        self.current = if fill_failed {
            (self.current * 2).min(self.max)
        } else {
            self.base
        };
        self.jittered()
    }

    fn jittered(&self) -> Duration {
        let upper = u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(upper / 2..=upper))
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

type EventFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A connection attempt finished. `keyspace` is what the connection is
/// known to be using.
struct Opened {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace: Option<VerifiedKeyspaceName>,
}

/// A pooled connection broke.
struct Broken {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_until_broken(connection: Weak<Connection>, error_receiver: ErrorReceiver) -> Broken {
    let error = error_receiver.await.unwrap_or(BrokenConnectionError::ChannelError);
    Broken {
        connection,
        error: error.into(),
    }
}

/// Task owning the connections of one pool.
struct PoolKeeper {
    address: SocketAddr,
    config: PoolConfig,
    keyspace: Option<VerifiedKeyspaceName>,

    conns: Vec<Arc<Connection>>,
    state: Arc<ArcSwap<PoolState>>,
    updated: Arc<Notify>,
    grow: Arc<Notify>,

    // Current goal, between the minimum and maximum size.
    target: usize,
    suspended: bool,
    fill_failed: bool,
    backoff: FillBackoff,

    opening: FuturesUnordered<EventFuture<Opened>>,
    breaking: FuturesUnordered<EventFuture<Broken>>,

    events: Option<mpsc::UnboundedSender<PoolEvent>>,
    last_reported: Option<bool>,
}

impl PoolKeeper {
    fn new(
        address: SocketAddr,
        config: PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
        events: Option<mpsc::UnboundedSender<PoolEvent>>,
    ) -> Self {
        Self {
            address,
            target: config.min_size(),
            backoff: FillBackoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
            config,
            keyspace,
            conns: Vec::new(),
            state: Arc::new(ArcSwap::from_pointee(PoolState::Initializing)),
            updated: Arc::new(Notify::new()),
            grow: Arc::new(Notify::new()),
            suspended: false,
            fill_failed: false,
            opening: FuturesUnordered::new(),
            breaking: FuturesUnordered::new(),
            events,
            last_reported: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        debug!("[{}] Pool keeper started", self.address);

        let mut fill_at = Some(Instant::now());
        let mut idle_check = tokio::time::interval_at(Instant::now() + IDLE_CHECK_INTERVAL, IDLE_CHECK_INTERVAL);
        let grow = self.grow.clone();

        loop {
            let fill_due = async move {
                match fill_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = fill_due => {
                    fill_at = None;
                    self.fill_failed = false;
                    self.start_fill();
                }
                opened = self.opening.select_next_some(), if !self.opening.is_empty() => {
                    self.on_opened(opened);
                }
                broken = self.breaking.select_next_some(), if !self.breaking.is_empty() => {
                    if let Some(conn) = broken.connection.upgrade() {
                        debug!("[{}] Connection {:p} broke: {}", self.address, Arc::as_ptr(&conn), broken.error);
                        self.remove(&conn, broken.error);
                    }
                }
                () = grow.notified() => {
                    if !self.suspended && self.target < self.config.max_size() {
                        self.target += 1;
                        debug!("[{}] Pool target raised to {}", self.address, self.target);
                    }
                }
                _ = idle_check.tick() => self.close_idle(),
                command = commands.recv() => match command {
                    Some(PoolCommand::Suspend) => {
                        self.suspend();
                        fill_at = None;
                    }
                    Some(PoolCommand::Resume) if self.suspended => {
                        self.resume();
                        fill_at = Some(Instant::now());
                    }
                    Some(PoolCommand::Resume) => {}
                    Some(PoolCommand::UseKeyspace { keyspace, reply }) => self.use_keyspace(keyspace, reply),
                    Some(PoolCommand::Shutdown(reason)) => {
                        self.shutdown(reason);
                        return;
                    }
                    None => {
                        trace!("[{}] Pool handle dropped, keeper exits", self.address);
                        return;
                    }
                }
            }
            trace!(pool_state = ?self.state.load());

            if fill_at.is_none() && self.needs_fill() {
                let delay = self.backoff.next_delay(self.fill_failed);
                debug!("[{}] Next fill in {} ms", self.address, delay.as_millis());
                fill_at = Some(Instant::now() + delay);
            }
        }
    }

    fn needs_fill(&self) -> bool {
        !self.suspended && self.opening.is_empty() && self.conns.len() < self.target
    }

    fn start_fill(&mut self) {
        if self.suspended {
            return;
        }
        // An empty pool probably means a dead host: probe with one connection.
        let count = if self.conns.is_empty() {
            1
        } else {
            self.target.saturating_sub(self.conns.len())
        };
        trace!("[{}] Opening {} connection(s)", self.address, count);
        for _ in 0..count {
            self.open_one();
        }
    }

    fn open_one(&self) {
        let address = self.address;
        let config = self.config.connection_config.clone();
        let keyspace = self.keyspace.clone();
        self.opening.push(
            async move {
                let result = open_connection(address, keyspace.as_ref(), &config).await;
                Opened { result, keyspace }
            }
            .boxed(),
        );
    }

    fn on_opened(&mut self, opened: Opened) {
        let (connection, error_receiver) = match opened.result {
            Ok(opened) => opened,
            Err(err) => {
                self.fill_failed = true;
                debug!("[{}] Could not connect: {}", self.address, err);
                // Only the last failure of a fill into an empty pool counts.
                if self.opening.is_empty() && self.conns.is_empty() {
                    self.publish(Some(err.clone()));
                    self.report(PoolEventKind::Unreachable(err));
                }
                return;
            }
        };

        // The keyspace may have changed while the connection was opening.
        if let Some(keyspace) = self.keyspace.clone() {
            if opened.keyspace.as_ref() != Some(&keyspace) {
                self.switch_new_connection(connection, error_receiver, keyspace);
                return;
            }
        }

        if self.conns.len() >= self.config.max_size() {
            debug!("[{}] Pool is full, dropping the new connection", self.address);
            connection.close(BrokenConnectionError::Idle);
            return;
        }

        let conn = Arc::new(connection);
        self.breaking
            .push(wait_until_broken(Arc::downgrade(&conn), error_receiver).boxed());
        self.conns.push(conn);
        trace!("[{}] Pool now has {} connection(s)", self.address, self.conns.len());

        self.publish(None);
        self.report(PoolEventKind::Established);
    }

    /// Sends `USE` on a fresh connection and feeds it back through `opening`.
    fn switch_new_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
        keyspace: VerifiedKeyspaceName,
    ) {
        let limit = self.config.connection_config.connect_timeout;
        self.opening.push(
            async move {
                let result = match tokio::time::timeout(limit, connection.use_keyspace(&keyspace)).await {
                    Ok(Ok(())) => Ok((connection, error_receiver)),
                    Ok(Err(err)) => {
                        warn!(
                            "[{}] New connection rejected keyspace {}: {}",
                            connection.get_connect_address(),
                            keyspace.as_str(),
                            err
                        );
                        Err(ConnectionError::UseKeyspace(Arc::new(err)))
                    }
                    Err(_) => Err(ConnectionError::ConnectTimeout),
                };
                Opened {
                    result,
                    keyspace: Some(keyspace),
                }
            }
            .boxed(),
        );
    }

    /// Publishes the current connections. `error` is what an empty pool
    /// reports; without one an empty pool reads as initializing.
    fn publish(&mut self, error: Option<ConnectionError>) {
        let state = match (self.conns.is_empty(), error) {
            (false, _) => PoolState::Ready(self.conns.clone()),
            (true, Some(err)) => PoolState::Broken(Arc::new(err)),
            (true, None) => PoolState::Initializing,
        };
        self.set_state(state);
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(Arc::new(state));
        self.updated.notify_waiters();
    }

    fn report(&mut self, kind: PoolEventKind) {
        let reachable = matches!(kind, PoolEventKind::Established);
        if self.last_reported.replace(reachable) == Some(reachable) {
            return;
        }
        if let Some(events) = &self.events {
            let _ = events.send(PoolEvent {
                address: self.address,
                kind,
            });
        }
    }

    fn remove(&mut self, connection: &Arc<Connection>, error: ConnectionError) {
        let before = self.conns.len();
        self.conns.retain(|conn| !Arc::ptr_eq(conn, connection));
        if self.conns.len() != before {
            trace!("[{}] Pool now has {} connection(s)", self.address, self.conns.len());
            self.publish(Some(error));
        }
    }

    /// Closes connections with nothing in flight, never going under the
    /// minimum, and lowers the target to what is left.
    fn close_idle(&mut self) {
        let min = self.config.min_size();
        let mut surplus = if self.suspended { 0 } else { self.conns.len().saturating_sub(min) };
        if surplus > 0 {
            let before = self.conns.len();
            self.conns.retain(|conn| {
                let idle = surplus > 0 && conn.load() == 0;
                if idle {
                    surplus -= 1;
                    conn.close(BrokenConnectionError::Idle);
                }
                !idle
            });
            let closed = before - self.conns.len();
            if closed > 0 {
                debug!("[{}] Closed {} idle connection(s)", self.address, closed);
                self.publish(None);
            }
        }
        self.target = self.conns.len().max(min);
    }

    fn close_all(&mut self, reason: BrokenConnectionError) {
        // Attempts in progress are dropped along with their futures.
        self.opening = FuturesUnordered::new();
        self.conns.drain(..).for_each(|conn| conn.close(reason.clone()));
    }

    fn suspend(&mut self) {
        if std::mem::replace(&mut self.suspended, true) {
            return;
        }
        debug!("[{}] Pool suspended", self.address);
        self.close_all(BrokenConnectionError::HostDown);
        self.target = self.config.min_size();
        self.last_reported = None;
        self.set_state(PoolState::Suspended);
    }

    fn resume(&mut self) {
        debug!("[{}] Pool resumed", self.address);
        self.suspended = false;
        self.backoff.reset();
        self.set_state(PoolState::Initializing);
    }

    fn shutdown(&mut self, reason: BrokenConnectionError) {
        debug!("[{}] Pool shut down: {}", self.address, reason);
        self.close_all(reason);
        self.set_state(PoolState::ShutDown);
    }

    /// Connections opened from now on use `keyspace`. The current ones are
    /// switched in a separate task, which answers on `reply`.
    fn use_keyspace(&mut self, keyspace: VerifiedKeyspaceName, reply: oneshot::Sender<Result<(), UseKeyspaceError>>) {
        debug!("[{}] Switching to keyspace {}", self.address, keyspace.as_str());
        self.keyspace = Some(keyspace.clone());

        let conns = self.conns.clone();
        let address = self.address;
        tokio::spawn(async move {
            let results = futures::future::join_all(conns.iter().map(|conn| conn.use_keyspace(&keyspace))).await;
            let outcome = use_keyspace_result(results.into_iter());
            if let Err(err) = &outcome {
                warn!("[{}] Could not switch to keyspace {}: {}", address, keyspace.as_str(), err);
            }
            let _ = reply.send(outcome);
        });
    }
}

/// Combines the `USE` results of several connections.
///
/// A rejection by the server wins outright. Otherwise one success is
/// enough, and no connections at all counts as success.
pub(crate) fn use_keyspace_result(
    results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut any_ok = false;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(()) => any_ok = true,
            Err(err @ UseKeyspaceError::RequestError(RequestAttemptError::DbError(..))) => return Err(err),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) if !any_ok => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tessera_cql::frame::request::RequestOpcode;
    use tessera_cql::value::SerializedValues;
    use tessera_cql::Consistency;

    use super::*;
    use crate::utils::test_utils::{setup_tracing, MockNode, Reaction, Rule};

    fn config(min: usize, max: usize, max_streams: usize) -> PoolConfig {
        PoolConfig {
            connection_config: ConnectionConfig {
                max_streams,
                connect_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            min_connections: min,
            max_connections: max,
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(100),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn hang(conn: &Connection) -> Result<(), RequestAttemptError> {
        conn.query_unpaged("SELECT hang", SerializedValues::EMPTY, Consistency::One, None)
            .await
            .map(|_| ())
    }

    #[test]
    fn fill_delay_doubles_after_failures_and_resets() {
        let mut backoff = FillBackoff::new(Duration::from_millis(100), Duration::from_millis(700));
        for expected in [200, 400, 700, 700] {
            let delay = backoff.next_delay(true);
            assert_eq!(backoff.current, Duration::from_millis(expected));
            assert!(delay >= Duration::from_millis(expected / 2) && delay <= Duration::from_millis(expected));
        }

        let delay = backoff.next_delay(false);
        assert_eq!(backoff.current, Duration::from_millis(100));
        assert!(delay <= Duration::from_millis(100));

        backoff.next_delay(true);
        backoff.reset();
        assert_eq!(backoff.current, Duration::from_millis(100));
    }

    #[test]
    fn use_keyspace_result_prefers_success() {
        assert_matches!(use_keyspace_result(std::iter::empty()), Ok(()));
        assert_matches!(
            use_keyspace_result(
                vec![
                    Ok(()),
                    Err(UseKeyspaceError::RequestError(RequestAttemptError::DbError(
                        tessera_cql::frame::response::error::DbError::Invalid,
                        "no such keyspace".to_owned()
                    ))),
                ]
                .into_iter()
            ),
            Err(UseKeyspaceError::RequestError(RequestAttemptError::DbError(..)))
        );
        assert_matches!(
            use_keyspace_result(
                vec![
                    Err(UseKeyspaceError::UnexpectedResponse("x")),
                    Ok(()),
                ]
                .into_iter()
            ),
            Ok(())
        );
        assert_matches!(
            use_keyspace_result(vec![Err(UseKeyspaceError::UnexpectedResponse("x"))].into_iter()),
            Err(UseKeyspaceError::UnexpectedResponse("x"))
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn fills_to_minimum_and_reports_established() {
        setup_tracing();
        let node = MockNode::start().await;
        let (event_sender, mut events) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(node.address(), &config(2, 4, 128), None, Some(event_sender));

        pool.wait_until_initialized().await;
        wait_for(|| pool.get_working_connections().map_or(0, |c| c.len()) == 2).await;
        assert_eq!(node.accepted_connections(), 2);
        assert!(pool.is_connected());

        let event = events.recv().await.unwrap();
        assert_eq!(event.address, node.address());
        assert_matches!(event.kind, PoolEventKind::Established);

        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn acquire_prefers_least_loaded_connection() {
        setup_tracing();
        let node = MockNode::start().await;
        node.add_rule(Rule::on(RequestOpcode::Query).containing("hang").then(Reaction::NoReply));
        let pool = NodeConnectionPool::new(node.address(), &config(2, 2, 128), None, None);
        wait_for(|| pool.get_working_connections().map_or(0, |c| c.len()) == 2).await;

        let busy = pool.acquire().await.unwrap();
        let in_flight = hang(&busy);
        let check = async {
            wait_for(|| busy.load() == 1).await;
            let other = pool.acquire().await.unwrap();
            assert!(!Arc::ptr_eq(&busy, &other));
        };
        tokio::select! {
            _ = in_flight => panic!("hanging request completed"),
            _ = check => {}
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn saturated_pool_at_maximum_fails_fast() {
        setup_tracing();
        let node = MockNode::start().await;
        node.add_rule(Rule::on(RequestOpcode::Query).containing("hang").then(Reaction::NoReply));
        let pool = NodeConnectionPool::new(node.address(), &config(1, 1, 1), None, None);
        pool.wait_until_initialized().await;

        let conn = pool.acquire().await.unwrap();
        let in_flight = hang(&conn);
        let check = async {
            wait_for(|| conn.load() == 1).await;
            let started = tokio::time::Instant::now();
            assert_matches!(pool.acquire().await, Err(ConnectionPoolError::Saturated(1)));
            assert!(started.elapsed() < Duration::from_millis(500));
        };
        tokio::select! {
            _ = in_flight => panic!("hanging request completed"),
            _ = check => {}
        }
        assert_eq!(node.accepted_connections(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn saturated_pool_grows_up_to_maximum() {
        setup_tracing();
        let node = MockNode::start().await;
        node.add_rule(Rule::on(RequestOpcode::Query).containing("hang").then(Reaction::NoReply));
        let pool = NodeConnectionPool::new(node.address(), &config(1, 2, 1), None, None);
        pool.wait_until_initialized().await;

        let first = pool.acquire().await.unwrap();
        let in_flight = hang(&first);
        let check = async {
            wait_for(|| first.load() == 1).await;
            let second = pool.acquire().await.unwrap();
            assert!(!Arc::ptr_eq(&first, &second));
        };
        tokio::select! {
            _ = in_flight => panic!("hanging request completed"),
            _ = check => {}
        }
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn suspended_pool_fails_fast_without_connecting() {
        setup_tracing();
        let node = MockNode::start().await;
        let pool = NodeConnectionPool::new(node.address(), &config(1, 2, 128), None, None);
        pool.wait_until_initialized().await;
        assert_eq!(node.accepted_connections(), 1);

        pool.suspend();
        wait_for(|| !pool.is_connected()).await;
        assert_matches!(pool.acquire().await, Err(ConnectionPoolError::Suspended));
        wait_for(|| node.open_connections() == 0).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.accepted_connections(), 1);

        // Resuming reconnects.
        pool.resume();
        wait_for(|| pool.is_connected()).await;
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn broken_connection_is_replaced() {
        setup_tracing();
        let node = MockNode::start().await;
        let pool = NodeConnectionPool::new(node.address(), &config(1, 1, 128), None, None);
        pool.wait_until_initialized().await;
        let before = pool.acquire().await.unwrap();

        node.drop_connections();

        wait_for(|| {
            pool.get_working_connections()
                .is_ok_and(|conns| conns.len() == 1 && !Arc::ptr_eq(&conns[0], &before))
        })
        .await;
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_host_is_reported_and_recovers() {
        setup_tracing();
        let node = MockNode::start().await;
        let (event_sender, mut events) = mpsc::unbounded_channel();
        let pool = NodeConnectionPool::new(node.address(), &config(1, 1, 128), None, Some(event_sender));
        assert_matches!(events.recv().await.unwrap().kind, PoolEventKind::Established);

        node.stop();
        assert_matches!(events.recv().await.unwrap().kind, PoolEventKind::Unreachable(_));
        assert_matches!(pool.acquire().await, Err(ConnectionPoolError::Broken { .. }));

        node.restart().unwrap();
        assert_matches!(events.recv().await.unwrap().kind, PoolEventKind::Established);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn use_keyspace_applies_to_current_and_new_connections() {
        setup_tracing();
        let node = MockNode::start().await;
        let pool = NodeConnectionPool::new(node.address(), &config(1, 2, 1), None, None);
        pool.wait_until_initialized().await;

        pool.use_keyspace(VerifiedKeyspaceName::new("ks", false).unwrap())
            .await
            .unwrap();
        assert_eq!(node.count_matching(RequestOpcode::Query, "USE ks"), 1);

        node.drop_connections();
        wait_for(|| node.count_matching(RequestOpcode::Query, "USE ks") == 2).await;
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn shutdown_fails_pending_requests() {
        setup_tracing();
        let node = MockNode::start().await;
        node.add_rule(Rule::on(RequestOpcode::Query).containing("hang").then(Reaction::NoReply));
        let pool = NodeConnectionPool::new(node.address(), &config(1, 1, 128), None, None);
        pool.wait_until_initialized().await;
        let conn = pool.acquire().await.unwrap();

        let in_flight = hang(&conn);
        let stopper = async {
            wait_for(|| conn.load() == 1).await;
            pool.shutdown(BrokenConnectionError::SessionShutDown);
        };
        let (res, ()) = tokio::join!(in_flight, stopper);

        assert_matches!(
            res,
            Err(RequestAttemptError::BrokenConnection(BrokenConnectionError::SessionShutDown))
        );
        wait_for(|| matches!(pool.acquire().now_or_never(), Some(Err(ConnectionPoolError::ShutDown)))).await;
    }
}
