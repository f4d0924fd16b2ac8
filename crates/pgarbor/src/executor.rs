//! Asynchronous query execution with stale-connection recovery.
//!
//! `submit` validates the connection with a cheap ping, reestablishes it
//! once through the registry when the ping fails, runs the query on a
//! spawned task and reports everything back over an unbounded channel. The
//! caller never blocks on the database.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row, SimpleQueryMessage};
use tracing::{info, warn};

use crate::registry::{ConnectionOutcome, ConnectionRegistry, PgConnection};
use crate::util::format_pg_error;

const PING_QUERY: &str = "SELECT 42;";

const CONNECTION_INVALID_MESSAGE: &str =
    "The current database connection is invalid and cannot be used. This usually means the \
     connection to the database server was lost and could not be reestablished. Further \
     information can be found in the log.";

/// A query with optional text parameters.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub sql: String,
    pub params: Vec<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// The shaped result of one query.
///
/// Statements without a result description (INSERT, CREATE, ...) come back
/// as a synthetic one-cell result under a `Status` header, so consumers can
/// always render a grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Completion status reported by the driver, e.g. `3 rows`.
    pub status: Option<String>,
}

impl QueryOutcome {
    fn status_only(status: String) -> Self {
        Self {
            headers: vec!["Status".to_string()],
            rows: vec![vec![format!("Query successful: {}", status)]],
            status: Some(status),
        }
    }
}

/// Events delivered to the submitter over the executor channel.
#[derive(Debug)]
pub enum QueryEvent {
    /// The query produced a result.
    Finished(QueryOutcome),
    /// The query or its connection failed; title and message for display.
    Failed { title: String, message: String },
    /// The stale connection was replaced before executing. Consumers should
    /// swap their handle for the fresh one.
    Reconnected(PgConnection),
    /// A cancel request went out to the server.
    CancelRequested,
}

/// Runs queries on the tokio runtime and reports back over a channel.
pub struct QueryExecutor {
    registry: Arc<ConnectionRegistry>,
    timeout_ms: u64,
    events_tx: mpsc::UnboundedSender<QueryEvent>,
}

impl QueryExecutor {
    /// Create an executor and the receiving end of its event channel.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        timeout_ms: u64,
    ) -> (Self, mpsc::UnboundedReceiver<QueryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                timeout_ms,
                events_tx,
            },
            events_rx,
        )
    }

    /// Validate the connection and run the query on a spawned task.
    ///
    /// Returns immediately; the outcome arrives as [`QueryEvent`]s.
    /// Overlapping submissions on one connection serialize on the client
    /// lock in no particular order.
    pub fn submit(&self, connection: PgConnection, request: QueryRequest) {
        let registry = self.registry.clone();
        let tx = self.events_tx.clone();
        let timeout_ms = self.timeout_ms;

        tokio::spawn(async move {
            let connection = match ensure_usable(&registry, connection, timeout_ms, &tx).await {
                Some(connection) => connection,
                None => {
                    let _ = tx.send(QueryEvent::Failed {
                        title: "Connection Error".to_string(),
                        message: CONNECTION_INVALID_MESSAGE.to_string(),
                    });
                    return;
                }
            };

            match run_query(&connection, &request).await {
                Ok(outcome) => {
                    let _ = tx.send(QueryEvent::Finished(outcome));
                }
                Err(e) => {
                    let _ = tx.send(QueryEvent::Failed {
                        title: "SQL Error".to_string(),
                        message: format_pg_error(&e),
                    });
                }
            }
        });
    }

    /// Ask the server to abort whatever runs on `connection`.
    pub fn cancel(&self, connection: &PgConnection) {
        let token = connection.cancel_token();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            // Best effort; if the query dies it surfaces its own error.
            let _ = token.cancel_query(NoTls).await;
            let _ = tx.send(QueryEvent::CancelRequested);
        });
    }
}

/// Ping the connection and reestablish it once if the ping fails.
async fn ensure_usable(
    registry: &ConnectionRegistry,
    connection: PgConnection,
    timeout_ms: u64,
    tx: &mpsc::UnboundedSender<QueryEvent>,
) -> Option<PgConnection> {
    if ping(&connection).await {
        return Some(connection);
    }

    // Only registry connections can be recovered.
    let key = registry.parameters_for(&connection).await?;
    info!("Connection to {} is stale, reestablishing", key);

    match registry.reestablish(&key, timeout_ms).await {
        ConnectionOutcome::Open(fresh) => {
            let _ = tx.send(QueryEvent::Reconnected(fresh.clone()));
            if ping(&fresh).await {
                Some(fresh)
            } else {
                None
            }
        }
        ConnectionOutcome::CredentialsMissing | ConnectionOutcome::Failed => None,
    }
}

async fn ping(connection: &PgConnection) -> bool {
    let client = connection.client();
    let guard = client.lock().await;
    match guard.simple_query(PING_QUERY).await {
        Ok(_) => true,
        Err(e) => {
            warn!("Connection check failed: {}", format_pg_error(&e));
            false
        }
    }
}

async fn run_query(
    connection: &PgConnection,
    request: &QueryRequest,
) -> Result<QueryOutcome, tokio_postgres::Error> {
    let client = connection.client();
    let guard = client.lock().await;

    if request.params.is_empty() {
        let messages = guard.simple_query(&request.sql).await?;
        return Ok(shape_simple(messages));
    }

    // Parameterized queries go through the extended protocol.
    let statement = guard.prepare(&request.sql).await?;
    let params: Vec<&(dyn ToSql + Sync)> = request
        .params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();

    if statement.columns().is_empty() {
        let affected = guard.execute(&statement, &params).await?;
        return Ok(QueryOutcome::status_only(format!("{} rows", affected)));
    }

    let headers: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let rows = guard.query(&statement, &params).await?;
    let rows = rows.iter().map(row_text).collect();

    Ok(QueryOutcome {
        headers,
        rows,
        status: None,
    })
}

/// Shape the message stream of a simple query into a grid.
///
/// A statement that carries a result description yields its header row plus
/// all data rows, even when no row came back. Without a description the
/// result is the synthetic status grid.
fn shape_simple(messages: Vec<SimpleQueryMessage>) -> QueryOutcome {
    let mut headers: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut status: Option<String> = None;

    for message in messages {
        match message {
            SimpleQueryMessage::Row(row) => {
                if headers.is_none() {
                    headers = Some(
                        row.columns()
                            .iter()
                            .map(|c| c.name().to_string())
                            .collect(),
                    );
                }

                let mut out = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    out.push(row.get(i).unwrap_or("NULL").to_string());
                }
                rows.push(out);
            }
            SimpleQueryMessage::RowDescription(description) => {
                if headers.is_none() {
                    headers = Some(description.iter().map(|c| c.name().to_string()).collect());
                }
            }
            SimpleQueryMessage::CommandComplete(affected) => {
                status = Some(format!("{} rows", affected));
            }
            _ => {}
        }
    }

    match headers {
        Some(headers) => QueryOutcome {
            headers,
            rows,
            status,
        },
        None => QueryOutcome::status_only(status.unwrap_or_else(|| "0 rows".to_string())),
    }
}

fn row_text(row: &Row) -> Vec<String> {
    (0..row.len()).map(|i| cell_text(row, i)).collect()
}

/// Render one typed cell as text, decoding the common column types and
/// falling back to a string read for the rest.
fn cell_text(row: &Row, idx: usize) -> String {
    let column_type = row.columns()[idx].type_();

    let rendered: Result<Option<String>, tokio_postgres::Error> = match *column_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .map(|v| v.map(|b| b.to_string())),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map(|n| n.to_string())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map(|n| n.to_string())),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .map(|v| v.map(|n| n.to_string())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map(|n| n.to_string())),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .map(|v| v.map(|n| n.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|t| t.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|t| t.to_string())),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(|d| d.to_string())),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .map(|v| v.map(|t| t.to_string())),
        _ => row.try_get::<_, Option<String>>(idx),
    };

    match rendered {
        Ok(Some(text)) => text,
        Ok(None) => "NULL".to_string(),
        // Types we cannot decode still render, just opaquely.
        Err(_) => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_shape() {
        let outcome = QueryOutcome::status_only("1 rows".to_string());
        assert_eq!(outcome.headers, vec!["Status"]);
        assert_eq!(outcome.rows, vec![vec!["Query successful: 1 rows"]]);
        assert_eq!(outcome.status.as_deref(), Some("1 rows"));
    }

    #[test]
    fn test_request_builders() {
        let plain = QueryRequest::new("SELECT 1");
        assert!(plain.params.is_empty());

        let with = QueryRequest::with_params("SELECT $1::text", vec!["x".to_string()]);
        assert_eq!(with.params, vec!["x"]);
    }
}
