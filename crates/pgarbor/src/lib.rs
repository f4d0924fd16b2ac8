//! Headless core of a PostgreSQL administration tool.
//!
//! The pieces fit together like this: the [`registry`] hands out shared,
//! cached connections keyed by their parameters and pulls passwords from the
//! [`credentials`] store; the [`catalog`] expands a lazy tree of servers,
//! databases, schemas, tables and views over those connections; the
//! [`executor`] runs user queries on the runtime and reports back over a
//! channel; [`config`] and [`history`] persist everything worth keeping
//! between runs as YAML files.

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod history;
pub mod registry;
pub mod util;
