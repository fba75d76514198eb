mod connection;
pub(crate) use connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, NonErrorQueryResponse, QueryResponse,
    VerifiedKeyspaceName,
};

mod connection_pool;
pub(crate) use connection_pool::{use_keyspace_result, NodeConnectionPool, PoolConfig, PoolEvent, PoolEventKind};

mod stream_table;
pub(crate) use stream_table::MAX_STREAMS_LIMIT;
