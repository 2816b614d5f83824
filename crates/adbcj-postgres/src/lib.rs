//! PostgreSQL backend for the adbcj asynchronous database client.
//!
//! Implements the v3.0 frontend/backend protocol: startup with MD5
//! authentication, extended-query execution (Parse/Bind/Describe/Execute/
//! Sync against the default portal), and streamed result sets, driven
//! through the protocol-neutral session pipeline in `adbcj-core`.

pub mod config;
pub mod connection;
pub mod handler;
pub mod manager;
pub mod protocol;

pub use config::PgConfig;
pub use connection::PgConnection;
pub use manager::PgConnectionManager;

/// Default PostgreSQL server port.
pub const DEFAULT_PORT: u16 = 5432;
