//! Running a single logical request: walking the query plan, sending one
//! attempt at a time and asking the retry policy what to do after a failure.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tessera_cql::frame::response::error::DbError;
use tessera_cql::frame::response::{self, Response};
use tessera_cql::value::SerializedValues;
use tracing::{debug, trace, trace_span, Instrument};

use crate::cluster::ClusterState;
use crate::errors::{AggregateExecutionError, ExecutionError, RequestAttemptError};
use crate::network::{Connection, NonErrorQueryResponse};
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy};
use crate::statement::prepared::PreparedStatementSharedData;

/// What each attempt sends.
#[derive(Clone, Copy)]
pub(crate) enum RequestKind<'a> {
    Query(&'a str),
    Execute(&'a PreparedStatementSharedData),
}

pub(crate) struct ExecuteRequestContext<'a> {
    pub(crate) routing_info: &'a RoutingInfo<'a>,
    pub(crate) is_idempotent: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) load_balancing_policy: &'a dyn LoadBalancingPolicy,
    pub(crate) retry_policy: &'a dyn RetryPolicy,
}

/// Successful response, with the node which answered it.
pub(crate) struct RunRequestResult {
    pub(crate) response: NonErrorQueryResponse,
    pub(crate) coordinator: SocketAddr,
}

pub(crate) async fn run_request(
    cluster: &ClusterState,
    request: RequestKind<'_>,
    values: &SerializedValues,
    context: ExecuteRequestContext<'_>,
) -> Result<RunRequestResult, ExecutionError> {
    let span = trace_span!(
        "Request",
        consistency = ?context.routing_info.consistency,
        token = context.routing_info.token.map(|token| token.value()),
    );
    run_request_in_plan(cluster, request, values, context)
        .instrument(span)
        .await
}

async fn run_request_in_plan(
    cluster: &ClusterState,
    request: RequestKind<'_>,
    values: &SerializedValues,
    context: ExecuteRequestContext<'_>,
) -> Result<RunRequestResult, ExecutionError> {
    let routing_info = context.routing_info;
    let plan = Plan::new(context.load_balancing_policy, routing_info, cluster);
    let mut retry_session = context.retry_policy.new_session();
    let mut attempts: Vec<(SocketAddr, RequestAttemptError)> = Vec::new();
    let mut gave_up = false;

    'nodes_in_plan: for node in plan {
        let span = trace_span!("Executing request", node = %node.address);
        'same_node_retries: loop {
            trace!(parent: &span, "Execution started");
            let connection = match node.connection().await {
                Ok(connection) => connection,
                Err(e) => {
                    trace!(
                        parent: &span,
                        error = %e,
                        "Choosing connection failed"
                    );
                    // The request never left the driver, so it is not a failed attempt.
                    record_attempt(&mut attempts, node.address, e.into());
                    continue 'nodes_in_plan;
                }
            };

            let request_start = Instant::now();
            trace!(
                parent: &span,
                connection = %connection.get_connect_address(),
                "Sending"
            );
            let attempt = run_attempt(
                &connection,
                node.address,
                request,
                values,
                routing_info,
            );
            let request_result = tokio::time::timeout(context.request_timeout, attempt)
                .instrument(span.clone())
                .await
                .unwrap_or(Err(RequestAttemptError::Timeout(context.request_timeout)));

            let elapsed = request_start.elapsed();
            let request_error = match request_result {
                Ok(response) => {
                    trace!(parent: &span, "Request succeeded");
                    context
                        .load_balancing_policy
                        .on_request_success(routing_info, elapsed, node);
                    return Ok(RunRequestResult {
                        response,
                        coordinator: node.address,
                    });
                }
                Err(e) => {
                    trace!(
                        parent: &span,
                        last_error = %e,
                        "Request failed"
                    );
                    context
                        .load_balancing_policy
                        .on_request_failure(routing_info, elapsed, node, &e);
                    e
                }
            };

            // The consistency passed here is the one every attempt is sent with.
            let retry_decision = retry_session.decide_should_retry(RequestInfo {
                error: &request_error,
                is_idempotent: context.is_idempotent,
                consistency: routing_info.consistency,
            });
            trace!(
                parent: &span,
                retry_decision = ?retry_decision
            );

            record_attempt(&mut attempts, node.address, request_error);

            match retry_decision {
                RetryDecision::RetrySameTarget => continue 'same_node_retries,
                RetryDecision::RetryNextTarget => continue 'nodes_in_plan,
                RetryDecision::DontRetry => {
                    gave_up = true;
                    break 'nodes_in_plan;
                }
            }
        }
    }

    Err(execution_error(attempts, gave_up))
}

/// Sends the request once over the given connection. For a prepared
/// statement the host's statement id is used, preparing it on the host if
/// it does not know the statement yet.
async fn run_attempt(
    connection: &Connection,
    address: SocketAddr,
    request: RequestKind<'_>,
    values: &SerializedValues,
    routing_info: &RoutingInfo<'_>,
) -> Result<NonErrorQueryResponse, RequestAttemptError> {
    let consistency = routing_info.consistency;
    let serial_consistency = routing_info.serial_consistency;

    let prepared = match request {
        RequestKind::Query(contents) => {
            return connection
                .query_unpaged(contents, values, consistency, serial_consistency)
                .await?
                .into_non_error_query_response();
        }
        RequestKind::Execute(prepared) => prepared,
    };

    let id = prepared.id_for_host(address, connection).await?;
    let response = connection
        .execute_unpaged(id.clone(), values, consistency, serial_consistency)
        .await?;

    if let Response::Error(response::Error {
        error: DbError::Unprepared { .. },
        ..
    }) = &response.response
    {
        debug!(
            "Host {} does not know the prepared statement, preparing it again",
            address
        );
        prepared.forget_host_id(address, &id);
        let id = prepared.id_for_host(address, connection).await?;
        return connection
            .execute_unpaged(id, values, consistency, serial_consistency)
            .await?
            .into_non_error_query_response();
    }

    response.into_non_error_query_response()
}

// Keeps only the last error of each host; plans never repeat a host.
fn record_attempt(
    attempts: &mut Vec<(SocketAddr, RequestAttemptError)>,
    address: SocketAddr,
    error: RequestAttemptError,
) {
    match attempts.last_mut() {
        Some((last_address, cause)) if *last_address == address => *cause = error,
        _ => attempts.push((address, error)),
    }
}

fn execution_error(
    mut attempts: Vec<(SocketAddr, RequestAttemptError)>,
    gave_up: bool,
) -> ExecutionError {
    if attempts.is_empty() {
        return ExecutionError::EmptyPlan;
    }

    // The retry policy stopped after the very first host: the error is
    // returned as is, e.g. a syntax error does not need an aggregate.
    if gave_up && attempts.len() == 1 {
        if let Some((_, error)) = attempts.pop() {
            return match error {
                RequestAttemptError::DbError(db_error, reason) => {
                    ExecutionError::DbError(db_error, reason)
                }
                other => ExecutionError::LastAttemptError(other),
            };
        }
    }

    ExecutionError::Aggregate(AggregateExecutionError { attempts })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::errors::{BrokenConnectionError, ConnectionPoolError};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, n], 9042))
    }

    #[test]
    fn same_host_retries_keep_only_the_last_cause() {
        let mut attempts = Vec::new();
        record_attempt(
            &mut attempts,
            addr(1),
            RequestAttemptError::DbError(DbError::Overloaded, "busy".to_owned()),
        );
        record_attempt(&mut attempts, addr(1), RequestAttemptError::Timeout(Duration::from_secs(1)));
        record_attempt(
            &mut attempts,
            addr(2),
            RequestAttemptError::BrokenConnection(BrokenConnectionError::ChannelError),
        );

        assert_eq!(attempts.len(), 2);
        assert_matches!(attempts[0], (a, RequestAttemptError::Timeout(_)) if a == addr(1));
        assert_matches!(attempts[1], (a, RequestAttemptError::BrokenConnection(_)) if a == addr(2));
    }

    #[test]
    fn final_error_distinguishes_nothing_attempted_from_all_failed() {
        assert_matches!(execution_error(Vec::new(), false), ExecutionError::EmptyPlan);

        let syntax_error = vec![(
            addr(1),
            RequestAttemptError::DbError(DbError::SyntaxError, "bad".to_owned()),
        )];
        assert_matches!(
            execution_error(syntax_error.clone(), true),
            ExecutionError::DbError(DbError::SyntaxError, _)
        );
        // Plan exhausted on its only host.
        assert_matches!(
            execution_error(syntax_error, false),
            ExecutionError::Aggregate(AggregateExecutionError { attempts }) if attempts.len() == 1
        );

        let two_hosts = vec![
            (
                addr(1),
                RequestAttemptError::HostUnavailable(ConnectionPoolError::Suspended),
            ),
            (
                addr(2),
                RequestAttemptError::DbError(DbError::Invalid, "no".to_owned()),
            ),
        ];
        assert_matches!(
            execution_error(two_hosts, true),
            ExecutionError::Aggregate(err) if err.hosts().collect::<Vec<_>>() == vec![addr(1), addr(2)]
        );
    }
}
