//! Public connection and connection-manager traits.
//!
//! These are the object-safe surfaces the backends implement. The generic
//! streaming query (`execute_query_with`) lives on the concrete backend
//! connection types, since generic methods cannot be part of a trait object.

use std::sync::Arc;

use crate::error::Result;
use crate::future::{DbFuture, DbSessionFuture};
use crate::result::{ResultSet, UpdateResult};

/// One open database connection.
pub trait Connection: Send + Sync {
    fn execute_query(&self, sql: &str) -> Result<DbSessionFuture<ResultSet>>;

    fn execute_update(&self, sql: &str) -> Result<DbSessionFuture<UpdateResult>>;

    fn begin_transaction(&self) -> Result<()>;

    fn commit(&self) -> Result<DbSessionFuture<()>>;

    fn rollback(&self) -> Result<DbSessionFuture<()>>;

    /// Close the connection, immediately or after the queued work drains.
    fn close(&self, immediate: bool) -> DbSessionFuture<()>;

    fn is_closed(&self) -> bool;

    fn is_in_transaction(&self) -> bool;

    /// Whether queued requests may have their frames written ahead of their
    /// predecessors' responses.
    fn is_pipelining_enabled(&self) -> bool;

    fn set_pipelining_enabled(&self, enabled: bool);
}

/// Mints connections to one configured database endpoint.
pub trait ConnectionManager: Send + Sync {
    /// Initiate a new connection. The future settles once the session has
    /// authenticated and is ready for queries.
    fn connect(&self) -> DbFuture<Arc<dyn Connection>>;

    /// Close the manager and its live connections.
    fn close(&self, immediate: bool) -> DbFuture<()>;

    fn is_closed(&self) -> bool;
}
