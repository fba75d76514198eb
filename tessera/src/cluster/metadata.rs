//! Topology and schema metadata read from the system tables.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tessera_cql::frame::response::result::{RawRow, Rows};
use tessera_cql::value::{deser_cql_value, CqlValue};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::MetadataError;
use crate::network::Connection;
use crate::routing::Token;

const LOCAL_QUERY: &str =
    "SELECT data_center, rack, tokens, schema_version, host_id FROM system.local WHERE key='local'";
const PEERS_QUERY: &str =
    "SELECT peer, rpc_address, data_center, rack, tokens, schema_version, host_id FROM system.peers";
const KEYSPACES_QUERY: &str = "SELECT keyspace_name, replication FROM system_schema.keyspaces";

/// Replication strategy of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Strategy {
    SimpleStrategy {
        replication_factor: usize,
    },
    NetworkTopologyStrategy {
        // Replication factors of datacenters with given names
        datacenter_repfactors: HashMap<String, usize>,
    },
    LocalStrategy, // replication_factor == 1
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

/// A node as described by `system.local` or `system.peers`.
#[derive(Clone, Debug)]
pub(crate) struct Peer {
    pub(crate) address: SocketAddr,
    pub(crate) host_id: Option<Uuid>,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
    pub(crate) tokens: Vec<Token>,
    pub(crate) schema_version: Option<Uuid>,
}

impl Peer {
    /// A peer known only by address, used when the system tables cannot be read.
    pub(crate) fn from_address(address: SocketAddr) -> Self {
        Self {
            address,
            host_id: None,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
            schema_version: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
    pub(crate) keyspaces: HashMap<String, Strategy>,
}

impl Metadata {
    /// Metadata consisting only of the given addresses, with no tokens and no schema.
    pub(crate) fn new_dummy(addresses: &[SocketAddr]) -> Self {
        Self {
            peers: addresses.iter().copied().map(Peer::from_address).collect(),
            keyspaces: HashMap::new(),
        }
    }
}

// Looks columns up by name, so that the column order of the server does not matter.
struct RowReader<'a> {
    table: &'static str,
    rows: &'a Rows,
    columns: HashMap<&'a str, usize>,
}

impl<'a> RowReader<'a> {
    fn new(table: &'static str, rows: &'a Rows) -> Self {
        let columns = rows
            .metadata
            .col_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.name.as_str(), i))
            .collect();
        Self {
            table,
            rows,
            columns,
        }
    }

    /// Decodes a cell. A missing column reads as null.
    fn get(&self, row: &RawRow, column: &str) -> Result<Option<CqlValue>, MetadataError> {
        let Some(&index) = self.columns.get(column) else {
            return Ok(None);
        };
        let Some(cell) = row.get(index).and_then(Option::as_ref) else {
            return Ok(None);
        };
        let typ = &self.rows.metadata.col_specs[index].typ;
        deser_cql_value(typ, &mut &cell[..])
            .map(Some)
            .map_err(|error| MetadataError::Deserialize {
                table: self.table,
                error,
            })
    }

    fn text(&self, row: &RawRow, column: &str) -> Result<Option<String>, MetadataError> {
        Ok(self.get(row, column)?.and_then(CqlValue::into_string))
    }

    fn uuid(&self, row: &RawRow, column: &str) -> Result<Option<Uuid>, MetadataError> {
        Ok(self.get(row, column)?.and_then(|v| v.as_uuid()))
    }

    fn inet(&self, row: &RawRow, column: &str) -> Result<Option<IpAddr>, MetadataError> {
        Ok(self.get(row, column)?.and_then(|v| v.as_inet()))
    }

    fn tokens(&self, row: &RawRow) -> Result<Vec<Token>, MetadataError> {
        let Some(values) = self.get(row, "tokens")?.and_then(CqlValue::into_vec) else {
            return Ok(Vec::new());
        };
        values
            .iter()
            .map(|value| {
                value
                    .as_text()
                    .and_then(|text| i64::from_str(text).ok())
                    .map(Token::new)
                    .ok_or_else(|| MetadataError::MalformedRow {
                        table: self.table,
                        reason: format!("invalid token: {:?}", value),
                    })
            })
            .collect()
    }
}

async fn query(conn: &Connection, table: &'static str, statement: &str) -> Result<Rows, MetadataError> {
    conn.query_rows(statement)
        .await
        .map_err(|error| MetadataError::Query { table, error })
}

/// Reads the peers visible from `conn`: the node itself and its peers. Peers
/// are reached on the same port as the node `conn` is connected to.
pub(crate) async fn fetch_peers(conn: &Connection) -> Result<Vec<Peer>, MetadataError> {
    let connect_address = conn.get_connect_address();
    let (local, peers) = futures::try_join!(
        query(conn, "system.local", LOCAL_QUERY),
        query(conn, "system.peers", PEERS_QUERY),
    )?;

    let mut result = Vec::with_capacity(peers.rows.len() + 1);

    let reader = RowReader::new("system.local", &local);
    for row in &local.rows {
        result.push(Peer {
            address: connect_address,
            host_id: reader.uuid(row, "host_id")?,
            datacenter: reader.text(row, "data_center")?,
            rack: reader.text(row, "rack")?,
            tokens: reader.tokens(row)?,
            schema_version: reader.uuid(row, "schema_version")?,
        });
    }

    let reader = RowReader::new("system.peers", &peers);
    for row in &peers.rows {
        let ip = match reader.inet(row, "rpc_address")? {
            Some(ip) if !ip.is_unspecified() => ip,
            _ => match reader.inet(row, "peer")? {
                Some(ip) => ip,
                None => {
                    warn!("Skipping a system.peers row without an address");
                    continue;
                }
            },
        };
        result.push(Peer {
            address: SocketAddr::new(ip, connect_address.port()),
            host_id: reader.uuid(row, "host_id")?,
            datacenter: reader.text(row, "data_center")?,
            rack: reader.text(row, "rack")?,
            tokens: reader.tokens(row)?,
            schema_version: reader.uuid(row, "schema_version")?,
        });
    }

    Ok(result)
}

/// Reads the replication strategy of every keyspace.
pub(crate) async fn fetch_keyspaces(conn: &Connection) -> Result<HashMap<String, Strategy>, MetadataError> {
    let rows = query(conn, "system_schema.keyspaces", KEYSPACES_QUERY).await?;
    let reader = RowReader::new("system_schema.keyspaces", &rows);

    let mut keyspaces = HashMap::with_capacity(rows.rows.len());
    for row in &rows.rows {
        let Some(name) = reader.text(row, "keyspace_name")? else {
            continue;
        };
        let replication: HashMap<String, String> = reader
            .get(row, "replication")?
            .and_then(|value| {
                value.as_map().map(|entries| {
                    entries
                        .iter()
                        .filter_map(|(k, v)| Some((k.as_text()?.to_owned(), v.as_text()?.to_owned())))
                        .collect()
                })
            })
            .unwrap_or_default();

        match strategy_from_replication(replication) {
            Ok(strategy) => {
                keyspaces.insert(name, strategy);
            }
            Err(reason) => {
                // One broken keyspace must not make the whole refresh fail.
                warn!(keyspace = name.as_str(), "Ignoring keyspace with invalid replication: {}", reason);
            }
        }
    }
    Ok(keyspaces)
}

/// Reads the whole metadata through `conn`.
pub(crate) async fn fetch_metadata(conn: &Connection, fetch_schema: bool) -> Result<Metadata, MetadataError> {
    let peers = fetch_peers(conn).await?;
    let keyspaces = if fetch_schema {
        fetch_keyspaces(conn).await?
    } else {
        HashMap::new()
    };
    debug!(
        "Fetched metadata: {} peers, {} keyspaces",
        peers.len(),
        keyspaces.len()
    );
    Ok(Metadata { peers, keyspaces })
}

fn strategy_from_replication(mut replication: HashMap<String, String>) -> Result<Strategy, String> {
    let strategy_name = replication
        .remove("class")
        .ok_or_else(|| "missing replication class".to_owned())?;

    let strategy = match strategy_name.as_str() {
        "org.apache.cassandra.locator.SimpleStrategy" | "SimpleStrategy" => {
            let rep_factor_str = replication
                .remove("replication_factor")
                .ok_or_else(|| "missing replication_factor".to_owned())?;
            let replication_factor = usize::from_str(&rep_factor_str)
                .map_err(|_| format!("invalid replication_factor: {}", rep_factor_str))?;

            Strategy::SimpleStrategy { replication_factor }
        }
        "org.apache.cassandra.locator.NetworkTopologyStrategy" | "NetworkTopologyStrategy" => {
            let mut datacenter_repfactors = HashMap::with_capacity(replication.len());
            for (key, value) in replication {
                let rep_factor = usize::from_str(&value)
                    .map_err(|_| format!("unexpected NetworkTopologyStrategy option {}: {}", key, value))?;
                datacenter_repfactors.insert(key, rep_factor);
            }

            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        }
        "org.apache.cassandra.locator.LocalStrategy" | "LocalStrategy" => Strategy::LocalStrategy,
        _ => Strategy::Other {
            name: strategy_name,
            data: replication,
        },
    };

    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::network::{open_connection, ConnectionConfig};
    use crate::utils::test_utils::{mock_cluster, setup_tracing, NodeInfo, SCHEMA_VERSION};

    fn replication(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replication_strategies_are_parsed() {
        assert_eq!(
            strategy_from_replication(replication(&[
                ("class", "org.apache.cassandra.locator.SimpleStrategy"),
                ("replication_factor", "3"),
            ])),
            Ok(Strategy::SimpleStrategy { replication_factor: 3 })
        );
        assert_eq!(
            strategy_from_replication(replication(&[
                ("class", "NetworkTopologyStrategy"),
                ("dc1", "3"),
                ("dc2", "1"),
            ])),
            Ok(Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: [("dc1".to_owned(), 3), ("dc2".to_owned(), 1)]
                    .into_iter()
                    .collect(),
            })
        );
        assert_eq!(
            strategy_from_replication(replication(&[("class", "org.apache.cassandra.locator.LocalStrategy")])),
            Ok(Strategy::LocalStrategy)
        );
        assert_matches!(
            strategy_from_replication(replication(&[("class", "EverywhereStrategy")])),
            Ok(Strategy::Other { name, .. }) if name == "EverywhereStrategy"
        );
    }

    #[test]
    fn malformed_replication_is_rejected() {
        assert!(strategy_from_replication(replication(&[("replication_factor", "3")])).is_err());
        assert!(strategy_from_replication(replication(&[("class", "SimpleStrategy")])).is_err());
        assert!(strategy_from_replication(replication(&[
            ("class", "NetworkTopologyStrategy"),
            ("dc1", "three"),
        ]))
        .is_err());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn metadata_is_read_from_system_tables() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[-100, 100]), NodeInfo::new("dc2", &[0])]).await;
        nodes[0].set_keyspace("ks", &[("class", "SimpleStrategy"), ("replication_factor", "2")]);

        let (conn, _errors) = open_connection(nodes[0].address(), None, &ConnectionConfig::default())
            .await
            .unwrap();
        let metadata = fetch_metadata(&conn, true).await.unwrap();

        assert_eq!(metadata.peers.len(), 2);
        let local = &metadata.peers[0];
        assert_eq!(local.address, nodes[0].address());
        assert_eq!(local.datacenter.as_deref(), Some("dc1"));
        assert_eq!(local.rack.as_deref(), Some("rack1"));
        assert_eq!(local.host_id, Some(nodes[0].host_id()));
        assert_eq!(local.schema_version, Some(SCHEMA_VERSION));
        let mut tokens = local.tokens.clone();
        tokens.sort();
        assert_eq!(tokens, vec![Token::new(-100), Token::new(100)]);

        let peer = &metadata.peers[1];
        assert_eq!(peer.address, nodes[1].address());
        assert_eq!(peer.datacenter.as_deref(), Some("dc2"));
        assert_eq!(peer.tokens, vec![Token::new(0)]);

        assert_eq!(
            metadata.keyspaces.get("ks"),
            Some(&Strategy::SimpleStrategy { replication_factor: 2 })
        );

        let without_schema = fetch_metadata(&conn, false).await.unwrap();
        assert!(without_schema.keyspaces.is_empty());
    }
}
