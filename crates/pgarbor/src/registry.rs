//! Shared registry of live database connections.
//!
//! Connections are cached by their parameters, so every consumer asking for
//! the same server and database gets the same underlying client. Passwords
//! come from an injected [`Credentials`] source; the registry never prompts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{CancelToken, Client, Config, NoTls};
use tracing::{error, info, warn};

use crate::credentials::Credentials;

/// Statement timeout handed to new connections when nothing is configured.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// The parameters that identify one database connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl ConnectionKey {
    pub fn new(
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            database: database.into(),
        }
    }

    /// Identifier used for keychain lookups. Every database on the same
    /// server shares it.
    pub fn credential_id(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    /// The same parameters pointed at another database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }

    /// Connection URL without a password.
    fn url(&self) -> String {
        format!(
            "postgresql://{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}

/// A live connection handle.
///
/// Cloning is cheap; clones share the same client. `close` aborts the task
/// driving the socket, which makes [`PgConnection::is_closed`] observable on
/// every clone.
#[derive(Clone)]
pub struct PgConnection {
    client: Arc<Mutex<Client>>,
    cancel_token: CancelToken,
    driver: Arc<JoinHandle<()>>,
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl PgConnection {
    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel_token.clone()
    }

    /// Whether this connection can no longer reach the server.
    pub async fn is_closed(&self) -> bool {
        self.client.lock().await.is_closed()
    }

    /// Stop driving the connection. The client is unusable afterwards.
    pub fn close(&self) {
        self.driver.abort();
    }

    /// True when both handles wrap the same underlying client.
    pub fn same_as(&self, other: &PgConnection) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }
}

/// What came out of asking the registry for a connection.
///
/// The two failure cases are deliberately distinct: a missing credential is
/// recoverable by asking the user for a password, a failed connection is not.
#[derive(Debug, Clone)]
pub enum ConnectionOutcome {
    /// A usable connection.
    Open(PgConnection),
    /// No password is stored for these parameters.
    CredentialsMissing,
    /// Connecting to the server failed. Details are in the log.
    Failed,
}

impl ConnectionOutcome {
    /// The connection, if there is one.
    pub fn open(self) -> Option<PgConnection> {
        match self {
            ConnectionOutcome::Open(connection) => Some(connection),
            _ => None,
        }
    }
}

/// Keyed cache of live connections.
pub struct ConnectionRegistry {
    credentials: Box<dyn Credentials>,
    connections: Mutex<HashMap<ConnectionKey, PgConnection>>,
}

impl ConnectionRegistry {
    pub fn new(credentials: impl Credentials + 'static) -> Self {
        Self {
            credentials: Box::new(credentials),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached connection for `key`, opening a new one if needed.
    ///
    /// Concurrent callers for an uncached key may race to open it; the last
    /// insert wins and earlier handles stay usable until dropped.
    pub async fn get(&self, key: &ConnectionKey, timeout_ms: u64) -> ConnectionOutcome {
        if let Some(existing) = self.connections.lock().await.get(key) {
            return ConnectionOutcome::Open(existing.clone());
        }

        let password = match self.credentials.get(&key.credential_id()) {
            Ok(password) => password,
            Err(e) => {
                error!("Keychain lookup for {} failed: {}", key.credential_id(), e);
                return ConnectionOutcome::CredentialsMissing;
            }
        };
        let Some(password) = password else {
            warn!("No password stored for {}", key.credential_id());
            return ConnectionOutcome::CredentialsMissing;
        };

        match open_connection(key, &password, timeout_ms).await {
            Ok(connection) => {
                info!("Connected to {}", key);
                self.connections
                    .lock()
                    .await
                    .insert(key.clone(), connection.clone());
                ConnectionOutcome::Open(connection)
            }
            Err(e) => {
                error!("Connecting to {} failed: {:#}", key, e);
                ConnectionOutcome::Failed
            }
        }
    }

    /// Reverse lookup: the key a registry connection was opened under.
    pub async fn parameters_for(&self, connection: &PgConnection) -> Option<ConnectionKey> {
        self.connections
            .lock()
            .await
            .iter()
            .find(|(_, candidate)| candidate.same_as(connection))
            .map(|(key, _)| key.clone())
    }

    /// Close a connection and drop it from the registry.
    ///
    /// Returns false when the connection was not a registry one.
    pub async fn close_and_forget(&self, connection: &PgConnection) -> bool {
        let mut connections = self.connections.lock().await;
        let Some(key) = connections
            .iter()
            .find(|(_, candidate)| candidate.same_as(connection))
            .map(|(key, _)| key.clone())
        else {
            return false;
        };

        connections.remove(&key);
        drop(connections);

        connection.close();
        info!("Closed connection to {}", key);
        true
    }

    /// Close any cached connection for `key` and open a fresh one.
    pub async fn reestablish(&self, key: &ConnectionKey, timeout_ms: u64) -> ConnectionOutcome {
        if let Some(existing) = self.connections.lock().await.remove(key) {
            existing.close();
        }
        self.get(key, timeout_ms).await
    }

    /// Try the parameters with an explicit password, caching nothing.
    ///
    /// Used to validate a connection dialog before anything is stored.
    pub async fn test_connection(
        &self,
        key: &ConnectionKey,
        password: &str,
        timeout_ms: u64,
    ) -> bool {
        match open_connection(key, password, timeout_ms).await {
            Ok(connection) => {
                connection.close();
                true
            }
            Err(e) => {
                warn!("Test connection to {} failed: {:#}", key, e);
                false
            }
        }
    }
}

/// Open a connection and spawn the task that drives its socket.
async fn open_connection(
    key: &ConnectionKey,
    password: &str,
    timeout_ms: u64,
) -> Result<PgConnection> {
    let mut config: Config = key
        .url()
        .parse()
        .with_context(|| format!("Invalid connection parameters for {}", key))?;
    config.password(password);
    // Server-side cap on statement runtime. Autocommit is the driver default.
    config.options(format!("-c statement_timeout={}", timeout_ms).as_str());

    let (client, connection) = config
        .connect(NoTls)
        .await
        .with_context(|| format!("Failed to connect to {}", key))?;

    let lost_key = key.clone();
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("Connection to {} terminated: {}", lost_key, e);
        }
    });

    let cancel_token = client.cancel_token();

    Ok(PgConnection {
        client: Arc::new(Mutex::new(client)),
        cancel_token,
        driver: Arc::new(driver),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// In-memory password source for tests.
    pub(crate) struct StaticCredentials(pub HashMap<String, String>);

    impl Credentials for StaticCredentials {
        fn get(&self, identifier: &str) -> Result<Option<String>> {
            Ok(self.0.get(identifier).cloned())
        }
    }

    fn key() -> ConnectionKey {
        ConnectionKey::new("postgres", "localhost", 5432, "testdb")
    }

    #[test]
    fn test_key_display_and_credential_id() {
        let key = key();
        assert_eq!(key.to_string(), "postgres@localhost:5432/testdb");
        assert_eq!(key.credential_id(), "postgres@localhost:5432");
    }

    #[test]
    fn test_key_with_database() {
        let other = key().with_database("postgres");
        assert_eq!(other.database, "postgres");
        assert_eq!(other.host, "localhost");
        // Same server, same credential.
        assert_eq!(other.credential_id(), key().credential_id());
    }

    #[test]
    fn test_outcome_open_accessor() {
        assert!(ConnectionOutcome::CredentialsMissing.open().is_none());
        assert!(ConnectionOutcome::Failed.open().is_none());
    }

    #[tokio::test]
    async fn test_get_without_credentials_is_distinguishable() {
        let registry = ConnectionRegistry::new(StaticCredentials(HashMap::new()));
        let outcome = registry.get(&key(), DEFAULT_TIMEOUT_MS).await;
        assert!(matches!(outcome, ConnectionOutcome::CredentialsMissing));
    }

    #[tokio::test]
    async fn test_parameters_for_unknown_connection() {
        let registry = ConnectionRegistry::new(StaticCredentials(HashMap::new()));
        // Nothing cached, so there is nothing to find.
        assert!(registry.connections.lock().await.is_empty());
    }
}
