//! Asynchronous database client for MySQL and PostgreSQL.
//!
//! Connections are created through a [`ConnectionManager`] selected by a
//! connection URL of the form `adbcj:<protocol>://host:port/database`.
//! Every operation returns a [`DbFuture`] that settles with the result,
//! an error, or a cancellation, and notifies listeners on completion:
//!
//! ```no_run
//! use adbcj::connect_manager;
//!
//! let manager = connect_manager("adbcj:mysql://localhost/test", "user", "pw").unwrap();
//! let connection = manager.connect().get().unwrap();
//! let rows = connection.execute_query("SELECT id FROM t").unwrap().get().unwrap();
//! for row in rows.rows() {
//!     println!("{:?}", row.get_named("id"));
//! }
//! connection.close(false).get().unwrap();
//! ```

use std::sync::Arc;

pub use adbcj_core::{
    ColumnSet, Connection, ConnectionManager, ConnectUrl, DbError, DbFuture, DbListener,
    DbSessionFuture, Field, Result, ResultEventHandler, ResultSet, Row, SqlType, UpdateResult,
    Value,
};
pub use adbcj_mysql::{MysqlConfig, MysqlConnection, MysqlConnectionManager};
pub use adbcj_postgres::{PgConfig, PgConnection, PgConnectionManager};

/// Create a connection manager for the backend named by the URL scheme.
///
/// `adbcj:mysql://...` selects MySQL; `adbcj:postgres://...` (or
/// `postgresql`) selects PostgreSQL.
pub fn connect_manager(
    url: &str,
    user: &str,
    password: &str,
) -> Result<Arc<dyn ConnectionManager>> {
    let parsed = ConnectUrl::parse(url)?;
    match parsed.protocol.as_str() {
        "mysql" => {
            let config = MysqlConfig::from_url(&parsed, user, password);
            let manager: Arc<dyn ConnectionManager> = MysqlConnectionManager::new(config);
            Ok(manager)
        }
        "postgres" | "postgresql" => {
            let config = PgConfig::from_url(&parsed, user, password);
            let manager: Arc<dyn ConnectionManager> = PgConnectionManager::new(config);
            Ok(manager)
        }
        other => Err(DbError::Config(format!(
            "unknown database protocol '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mysql_scheme_selects_mysql() {
        let manager = connect_manager("adbcj:mysql://localhost:3306/db", "u", "p").unwrap();
        assert!(!manager.is_closed());
    }

    #[test]
    fn test_postgres_schemes_select_postgres() {
        assert!(connect_manager("adbcj:postgres://localhost/db", "u", "p").is_ok());
        assert!(connect_manager("adbcj:postgresql://localhost/db", "u", "p").is_ok());
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(matches!(
            connect_manager("adbcj:oracle://localhost/db", "u", "p"),
            Err(DbError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        assert!(connect_manager("mysql://localhost/db", "u", "p").is_err());
    }
}
