use std::env;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

use pgarbor::catalog::{CatalogNode, NodeParams, NodeState};
use pgarbor::config::{ConnectionStore, SavedConnection, Settings};
use pgarbor::credentials::CredentialStore;
use pgarbor::executor::{QueryEvent, QueryExecutor, QueryOutcome, QueryRequest};
use pgarbor::history::CommandHistory;
use pgarbor::registry::{ConnectionOutcome, ConnectionRegistry};

fn print_version() {
    println!("pgarbor {}", env!("CARGO_PKG_VERSION"));
}

fn print_usage() {
    println!("pgarbor - PostgreSQL administration from the command line");
    println!();
    println!("USAGE:");
    println!("    pgarbor [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    list                List saved connections");
    println!("    add <url>           Save connection parameters from a postgres:// URL;");
    println!("                        a password in the URL goes to the OS keychain");
    println!("    remove <index>      Delete a saved connection and its stored password");
    println!("    test <index>        Try to connect with the stored credentials");
    println!("    tree <index>        Expand and print the full catalog tree");
    println!("    exec <index> <sql>  Run a query and print the result grid");
    println!("    history [pattern]   Show or fuzzy-search the command history");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help          Print this help message");
    println!("    -V, --version       Print version information");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pgarbor=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() || args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    if args.iter().any(|a| a == "-V" || a == "--version") {
        print_version();
        return Ok(());
    }

    let settings = Settings::load();
    let mut store = ConnectionStore::load();
    let credentials = CredentialStore::default();

    let rt = Runtime::new().context("Failed to create tokio runtime")?;

    let command = args[0].as_str();
    let rest = &args[1..];

    match command {
        "list" => {
            cmd_list(&store);
            Ok(())
        }
        "add" => {
            let url = rest
                .first()
                .ok_or_else(|| anyhow!("Missing URL; usage: pgarbor add <url>"))?;
            cmd_add(&mut store, &credentials, url)
        }
        "remove" => cmd_remove(&mut store, &credentials, rest),
        "test" => {
            let connection = connection_at(&store, rest)?;
            rt.block_on(cmd_test(connection, &credentials, settings.timeout_ms()))
        }
        "tree" => {
            let connection = connection_at(&store, rest)?;
            rt.block_on(cmd_tree(connection, &credentials, settings.timeout_ms()))
        }
        "exec" => {
            let connection = connection_at(&store, rest)?;
            let sql = rest
                .get(1)
                .ok_or_else(|| anyhow!("Missing query; usage: pgarbor exec <index> <sql>"))?;
            rt.block_on(cmd_exec(connection, &credentials, &settings, sql))
        }
        "history" => cmd_history(&settings, rest.first().map(String::as_str)),
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    }
}

/// Resolve a positional connection index against the store.
fn connection_at<'a>(store: &'a ConnectionStore, args: &[String]) -> Result<&'a SavedConnection> {
    let index: usize = args
        .first()
        .ok_or_else(|| anyhow!("Missing connection index; see `pgarbor list`"))?
        .parse()
        .context("Connection index must be a number")?;

    store
        .get(index)
        .ok_or_else(|| anyhow!("No saved connection with index {}", index))
}

fn cmd_list(store: &ConnectionStore) {
    if store.is_empty() {
        println!("No saved connections.");
        return;
    }

    for (index, connection) in store.connections().iter().enumerate() {
        println!("{:3}  {}", index, connection.identifier());
    }
}

fn cmd_add(store: &mut ConnectionStore, credentials: &CredentialStore, url: &str) -> Result<()> {
    let (connection, password) = SavedConnection::from_url(url)?;

    if let Some(password) = password {
        credentials.set(&connection.credential_id(), &password)?;
    }

    let identifier = connection.identifier();
    store.add(connection)?;
    store.save()?;

    println!("Saved {}", identifier);
    Ok(())
}

fn cmd_remove(
    store: &mut ConnectionStore,
    credentials: &CredentialStore,
    args: &[String],
) -> Result<()> {
    let connection = connection_at(store, args)?.clone();

    store.delete(&connection);
    store.save()?;
    credentials.delete(&connection.credential_id())?;

    println!("Removed {}", connection.identifier());
    Ok(())
}

async fn cmd_test(
    connection: &SavedConnection,
    credentials: &CredentialStore,
    timeout_ms: u64,
) -> Result<()> {
    let password = credentials
        .get_with_timeout(&connection.credential_id(), 3000)?
        .ok_or_else(|| anyhow!("No password stored for {}", connection.credential_id()))?;

    let registry = ConnectionRegistry::new(credentials.clone());
    if registry
        .test_connection(&connection.key(), &password, timeout_ms)
        .await
    {
        println!("Connection to {} OK", connection.identifier());
        Ok(())
    } else {
        bail!("Connection to {} failed", connection.identifier());
    }
}

async fn cmd_tree(
    connection: &SavedConnection,
    credentials: &CredentialStore,
    timeout_ms: u64,
) -> Result<()> {
    let registry = ConnectionRegistry::new(credentials.clone());

    let params = NodeParams {
        host: connection.host.clone(),
        user: connection.username.clone(),
        port: connection.port,
        database: connection.database.clone(),
        timeout_ms,
    };
    let mut server = CatalogNode::server(
        connection.credential_id(),
        params,
        connection.load_all_databases,
    );

    expand(&mut server, &registry).await?;
    print_node(&server, 0);
    Ok(())
}

/// Depth-first full expansion of a catalog subtree.
fn expand<'a>(
    node: &'a mut CatalogNode,
    registry: &'a ConnectionRegistry,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        node.fetch_children(registry).await?;
        for child in node.children.iter_mut() {
            expand(child, registry).await?;
        }
        Ok(())
    })
}

fn print_node(node: &CatalogNode, depth: usize) {
    let marker = match node.state {
        NodeState::Invalid => " [invalid]",
        _ => "",
    };
    println!("{}{}{}", "  ".repeat(depth), node.name, marker);
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

async fn cmd_exec(
    connection: &SavedConnection,
    credentials: &CredentialStore,
    settings: &Settings,
    sql: &str,
) -> Result<()> {
    let registry = Arc::new(ConnectionRegistry::new(credentials.clone()));
    let (executor, mut events) = QueryExecutor::new(registry.clone(), settings.timeout_ms());

    let live = match registry.get(&connection.key(), settings.timeout_ms()).await {
        ConnectionOutcome::Open(live) => live,
        ConnectionOutcome::CredentialsMissing => bail!(
            "No password stored for {}; save one with `pgarbor add`",
            connection.credential_id()
        ),
        ConnectionOutcome::Failed => bail!("Could not connect to {}", connection.identifier()),
    };

    let mut history = CommandHistory::load(settings.command_limit())
        .unwrap_or_else(|_| CommandHistory::new_empty(settings.command_limit()));
    history.push(sql.to_string(), connection.identifier());

    executor.submit(live, QueryRequest::new(sql));

    while let Some(event) = events.recv().await {
        match event {
            QueryEvent::Finished(outcome) => {
                print_grid(&outcome);
                break;
            }
            QueryEvent::Failed { title, message } => bail!("{}: {}", title, message),
            QueryEvent::Reconnected(_) | QueryEvent::CancelRequested => continue,
        }
    }

    Ok(())
}

fn print_grid(outcome: &QueryOutcome) {
    let mut widths: Vec<usize> = outcome.headers.iter().map(|h| h.len()).collect();
    for row in &outcome.rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() && cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let header = outcome
        .headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:<width$}", h, width = widths[i]))
        .collect::<Vec<_>>()
        .join(" | ");
    println!("{}", header);
    println!("{}", "-".repeat(header.len()));

    for row in &outcome.rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths.get(i).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" | ");
        println!("{}", line);
    }

    if let Some(status) = &outcome.status {
        println!("({})", status);
    }
}

fn cmd_history(settings: &Settings, pattern: Option<&str>) -> Result<()> {
    let history = CommandHistory::load(settings.command_limit())?;

    match pattern {
        Some(pattern) => {
            for m in history.search(pattern) {
                println!(
                    "{}  {}",
                    m.entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    m.entry.command
                );
            }
        }
        None => {
            for entry in history.entries() {
                println!(
                    "{}  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.command
                );
            }
        }
    }

    Ok(())
}
