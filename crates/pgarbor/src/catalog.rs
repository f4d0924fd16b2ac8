//! Lazy catalog tree over servers, databases, schemas, tables and views.
//!
//! Children are fetched on first expansion only. Server and database nodes
//! enumerate over a short-lived registry connection that is closed right
//! after the query; group nodes keep their connection cached for the
//! queries that follow.

use anyhow::{anyhow, ensure, Context, Result};
use tracing::warn;

use crate::registry::{ConnectionKey, ConnectionOutcome, ConnectionRegistry, PgConnection};

const LIST_DATABASES: &str = "SELECT datname FROM pg_database ORDER BY datname ASC";
const LIST_NAMED_DATABASE: &str =
    "SELECT datname FROM pg_database WHERE datname = $1 ORDER BY datname ASC";
// The ::text casts are required: information_schema reports these columns as
// the sql_identifier domain, which the driver's String decoding rejects.
const LIST_SCHEMATA: &str = "SELECT schema_name::text FROM information_schema.schemata \
     WHERE schema_name != 'pg_toast' AND schema_name != 'pg_toast_temp_1' \
     AND schema_name != 'pg_temp_1' ORDER BY schema_name ASC";
const LIST_TABLES: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = $1::text ORDER BY table_name ASC";
const LIST_VIEWS: &str = "SELECT table_name::text FROM information_schema.views \
     WHERE table_schema = $1::text ORDER BY table_name ASC";

/// The node variants of the tree, top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Server,
    Database,
    Schema,
    /// Grouping node under a schema for its tables.
    Tables,
    /// Grouping node under a schema for its views.
    Views,
    Table,
    View,
}

/// Expansion state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Children have not been fetched yet.
    Unexpanded,
    /// Children are present.
    Expanded,
    /// The node's connection failed; it stays a childless leaf.
    Invalid,
}

/// Connection parameters carried by every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeParams {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub database: String,
    pub timeout_ms: u64,
}

impl NodeParams {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.user, &self.host, self.port, &self.database)
    }

    fn same_server(&self, other: &NodeParams) -> bool {
        self.host == other.host && self.user == other.user && self.port == other.port
    }
}

/// One node of the catalog tree.
#[derive(Debug, Clone)]
pub struct CatalogNode {
    pub name: String,
    pub kind: NodeKind,
    pub params: NodeParams,
    /// Schema the node belongs to; set on group nodes and below.
    pub schema: Option<String>,
    pub state: NodeState,
    pub children: Vec<CatalogNode>,
    /// Server nodes only: enumerate every database instead of the named one.
    pub load_all_databases: bool,
}

impl CatalogNode {
    /// A root node for one server. The display name is usually
    /// `user@host:port`, but callers are free to label it differently.
    pub fn server(name: impl Into<String>, params: NodeParams, load_all_databases: bool) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Server,
            params,
            schema: None,
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases,
        }
    }

    fn child(&self, name: String, kind: NodeKind, params: NodeParams) -> Self {
        Self {
            name,
            kind,
            params,
            schema: self.schema.clone(),
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases: false,
        }
    }

    /// Fetch this node's children if it has not been expanded yet.
    ///
    /// A node whose connection fails is marked [`NodeState::Invalid`] and is
    /// not retried; query errors after a successful connection propagate.
    pub async fn fetch_children(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        if self.state != NodeState::Unexpanded {
            return Ok(());
        }

        match self.kind {
            NodeKind::Table | NodeKind::View => {
                self.state = NodeState::Expanded;
                Ok(())
            }
            NodeKind::Schema => {
                // No query needed: a schema always groups into exactly one
                // tables node and one views node.
                self.children.push(self.group_child(NodeKind::Tables));
                self.children.push(self.group_child(NodeKind::Views));
                self.state = NodeState::Expanded;
                Ok(())
            }
            NodeKind::Server => self.fetch_databases(registry).await,
            NodeKind::Database => self.fetch_schemata(registry).await,
            NodeKind::Tables | NodeKind::Views => self.fetch_relations(registry).await,
        }
    }

    /// Discard the children and fetch them again.
    ///
    /// Unlike a plain fetch this also retries a previously invalid node,
    /// since a refresh is an explicit user action.
    pub async fn refresh(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        self.children.clear();
        self.state = NodeState::Unexpanded;
        self.fetch_children(registry).await
    }

    fn group_child(&self, kind: NodeKind) -> CatalogNode {
        let name = match kind {
            NodeKind::Views => "Views",
            _ => "Tables",
        };
        CatalogNode {
            name: name.to_string(),
            kind,
            params: self.params.clone(),
            schema: Some(self.name.clone()),
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases: false,
        }
    }

    /// Get a registry connection, marking the node invalid when that fails.
    async fn open(&mut self, registry: &ConnectionRegistry) -> Option<PgConnection> {
        match registry.get(&self.params.key(), self.params.timeout_ms).await {
            ConnectionOutcome::Open(connection) => Some(connection),
            ConnectionOutcome::CredentialsMissing | ConnectionOutcome::Failed => {
                warn!(
                    "No usable connection for {}, marking node '{}' invalid",
                    self.params.key(),
                    self.name
                );
                self.state = NodeState::Invalid;
                None
            }
        }
    }

    async fn fetch_databases(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        let Some(connection) = self.open(registry).await else {
            return Ok(());
        };

        let rows = {
            let client = connection.client();
            let guard = client.lock().await;
            if self.load_all_databases {
                guard.query(LIST_DATABASES, &[]).await
            } else {
                guard
                    .query(LIST_NAMED_DATABASE, &[&self.params.database])
                    .await
            }
        };
        // One enumeration per server is enough; keep the slot free.
        registry.close_and_forget(&connection).await;
        let rows = rows
            .with_context(|| format!("Failed to list databases on {}", self.params.key()))?;

        for row in rows {
            let datname: String = row.try_get(0)?;
            // template0 does not accept connections.
            if datname == "template0" {
                continue;
            }
            let mut params = self.params.clone();
            params.database = datname.clone();
            self.children
                .push(self.child(datname, NodeKind::Database, params));
        }

        self.state = NodeState::Expanded;
        Ok(())
    }

    async fn fetch_schemata(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        let Some(connection) = self.open(registry).await else {
            return Ok(());
        };

        let rows = {
            let client = connection.client();
            let guard = client.lock().await;
            guard.query(LIST_SCHEMATA, &[]).await
        };
        registry.close_and_forget(&connection).await;
        let rows = rows
            .with_context(|| format!("Failed to list schemas on {}", self.params.key()))?;

        for row in rows {
            let name: String = row.try_get(0)?;
            self.children
                .push(self.child(name, NodeKind::Schema, self.params.clone()));
        }

        self.state = NodeState::Expanded;
        Ok(())
    }

    async fn fetch_relations(&mut self, registry: &ConnectionRegistry) -> Result<()> {
        let Some(schema) = self.schema.clone() else {
            // Group nodes are only ever created under a schema.
            return Ok(());
        };
        let Some(connection) = self.open(registry).await else {
            return Ok(());
        };

        let (query, child_kind) = match self.kind {
            NodeKind::Views => (LIST_VIEWS, NodeKind::View),
            _ => (LIST_TABLES, NodeKind::Table),
        };

        let rows = {
            let client = connection.client();
            let guard = client.lock().await;
            guard.query(query, &[&schema]).await
        }
        .with_context(|| {
            format!(
                "Failed to list relations in schema {} on {}",
                schema,
                self.params.key()
            )
        })?;

        for row in rows {
            let name: String = row.try_get(0)?;
            self.children
                .push(self.child(name, child_kind, self.params.clone()));
        }

        self.state = NodeState::Expanded;
        Ok(())
    }
}

/// Kinds of objects a DDL statement can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlTarget {
    Database,
    Schema,
    Table,
    View,
}

/// A structural change reported after a successful DDL statement.
#[derive(Debug, Clone)]
pub struct DdlChange {
    pub target: DdlTarget,
    pub host: String,
    pub user: String,
    pub port: u16,
    pub database: String,
}

/// The root of the catalog: one node per registered server.
#[derive(Debug, Clone, Default)]
pub struct CatalogTree {
    servers: Vec<CatalogNode>,
}

impl CatalogTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> &[CatalogNode] {
        &self.servers
    }

    pub fn servers_mut(&mut self) -> &mut [CatalogNode] {
        &mut self.servers
    }

    /// Add a server node, rejecting a second node for the same server.
    ///
    /// Two nodes count as the same server when host, user and port match,
    /// regardless of the database they start from.
    pub fn add_server(&mut self, node: CatalogNode) -> Result<()> {
        ensure!(
            node.kind == NodeKind::Server,
            "Only server nodes can be added at the root"
        );
        if self
            .servers
            .iter()
            .any(|server| server.params.same_server(&node.params))
        {
            return Err(anyhow!(
                "A server node for {}@{}:{} already exists",
                node.params.user,
                node.params.host,
                node.params.port
            ));
        }

        self.servers.push(node);
        Ok(())
    }

    /// Remove the server node matching host, user and port.
    pub fn remove_server(&mut self, host: &str, user: &str, port: u16) -> bool {
        let before = self.servers.len();
        self.servers.retain(|server| {
            !(server.params.host == host
                && server.params.user == user
                && server.params.port == port)
        });
        self.servers.len() != before
    }

    /// Re-fetch the part of the tree a DDL statement changed.
    ///
    /// A database change refreshes the owning server node, a schema change
    /// the database node, and a table or view change every matching group
    /// node under the database. Unexpanded parts are left alone; they will
    /// pick up the change when first expanded.
    pub async fn apply_ddl_change(
        &mut self,
        change: &DdlChange,
        registry: &ConnectionRegistry,
    ) -> Result<()> {
        let Some(server) = self.servers.iter_mut().find(|server| {
            server.params.host == change.host
                && server.params.user == change.user
                && server.params.port == change.port
        }) else {
            warn!(
                "No server node for {}@{}:{}, nothing to refresh",
                change.user, change.host, change.port
            );
            return Ok(());
        };

        if change.target == DdlTarget::Database {
            return server.refresh(registry).await;
        }

        let Some(database) = server
            .children
            .iter_mut()
            .find(|node| node.name == change.database)
        else {
            return Ok(());
        };

        if change.target == DdlTarget::Schema {
            return database.refresh(registry).await;
        }

        let group_kind = match change.target {
            DdlTarget::View => NodeKind::Views,
            _ => NodeKind::Tables,
        };
        for schema in database.children.iter_mut() {
            for group in schema.children.iter_mut() {
                if group.kind == group_kind {
                    group.refresh(registry).await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::registry::ConnectionRegistry;

    struct NoCredentials;

    impl Credentials for NoCredentials {
        fn get(&self, _identifier: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    fn params(database: &str) -> NodeParams {
        NodeParams {
            host: "localhost".to_string(),
            user: "postgres".to_string(),
            port: 5432,
            database: database.to_string(),
            timeout_ms: 10_000,
        }
    }

    #[tokio::test]
    async fn test_schema_node_always_gets_two_groups() {
        let registry = ConnectionRegistry::new(NoCredentials);
        let mut schema = CatalogNode {
            name: "public".to_string(),
            kind: NodeKind::Schema,
            params: params("testdb"),
            schema: None,
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases: false,
        };

        schema.fetch_children(&registry).await.unwrap();

        assert_eq!(schema.state, NodeState::Expanded);
        assert_eq!(schema.children.len(), 2);
        assert_eq!(schema.children[0].kind, NodeKind::Tables);
        assert_eq!(schema.children[1].kind, NodeKind::Views);
        // Both groups carry the schema they belong to.
        assert_eq!(schema.children[0].schema.as_deref(), Some("public"));
        assert_eq!(schema.children[1].schema.as_deref(), Some("public"));

        // A second fetch must not duplicate the groups.
        schema.fetch_children(&registry).await.unwrap();
        assert_eq!(schema.children.len(), 2);
    }

    #[tokio::test]
    async fn test_leaf_nodes_have_no_children() {
        let registry = ConnectionRegistry::new(NoCredentials);
        let mut table = CatalogNode {
            name: "users".to_string(),
            kind: NodeKind::Table,
            params: params("testdb"),
            schema: Some("public".to_string()),
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases: false,
        };

        table.fetch_children(&registry).await.unwrap();
        assert_eq!(table.state, NodeState::Expanded);
        assert!(table.children.is_empty());
    }

    #[tokio::test]
    async fn test_server_without_credentials_goes_invalid() {
        let registry = ConnectionRegistry::new(NoCredentials);
        let mut server = CatalogNode::server("postgres@localhost:5432", params("postgres"), true);

        server.fetch_children(&registry).await.unwrap();

        assert_eq!(server.state, NodeState::Invalid);
        assert!(server.children.is_empty());

        // Invalid is terminal for plain fetches.
        server.fetch_children(&registry).await.unwrap();
        assert_eq!(server.state, NodeState::Invalid);
    }

    #[test]
    fn test_duplicate_server_detection_ignores_database() {
        let mut tree = CatalogTree::new();
        tree.add_server(CatalogNode::server("first", params("postgres"), true))
            .unwrap();

        // Same host/user/port, different database: still a duplicate.
        let duplicate = CatalogNode::server("second", params("otherdb"), false);
        assert!(tree.add_server(duplicate).is_err());
        assert_eq!(tree.servers().len(), 1);
    }

    #[test]
    fn test_only_server_nodes_at_root() {
        let mut tree = CatalogTree::new();
        let node = CatalogNode {
            name: "testdb".to_string(),
            kind: NodeKind::Database,
            params: params("testdb"),
            schema: None,
            state: NodeState::Unexpanded,
            children: Vec::new(),
            load_all_databases: false,
        };
        assert!(tree.add_server(node).is_err());
    }

    #[test]
    fn test_remove_server() {
        let mut tree = CatalogTree::new();
        tree.add_server(CatalogNode::server("s", params("postgres"), true))
            .unwrap();

        assert!(tree.remove_server("localhost", "postgres", 5432));
        assert!(tree.servers().is_empty());
        assert!(!tree.remove_server("localhost", "postgres", 5432));
    }

    #[tokio::test]
    async fn test_ddl_change_without_matching_server_is_a_noop() {
        let registry = ConnectionRegistry::new(NoCredentials);
        let mut tree = CatalogTree::new();
        tree.add_server(CatalogNode::server("s", params("postgres"), true))
            .unwrap();

        let change = DdlChange {
            target: DdlTarget::Table,
            host: "otherhost".to_string(),
            user: "postgres".to_string(),
            port: 5432,
            database: "testdb".to_string(),
        };

        tree.apply_ddl_change(&change, &registry).await.unwrap();
        assert_eq!(tree.servers()[0].state, NodeState::Unexpanded);
    }

    #[tokio::test]
    async fn test_ddl_change_skips_unexpanded_database() {
        let registry = ConnectionRegistry::new(NoCredentials);
        let mut tree = CatalogTree::new();
        tree.add_server(CatalogNode::server("s", params("postgres"), true))
            .unwrap();

        // The server has no children yet, so a table change has no target
        // and must not touch the node.
        let change = DdlChange {
            target: DdlTarget::Table,
            host: "localhost".to_string(),
            user: "postgres".to_string(),
            port: 5432,
            database: "testdb".to_string(),
        };

        tree.apply_ddl_change(&change, &registry).await.unwrap();
        assert_eq!(tree.servers()[0].state, NodeState::Unexpanded);
        assert!(tree.servers()[0].children.is_empty());
    }
}
