//! Public PostgreSQL connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use adbcj_core::{
    Connection, DbSession, DbSessionFuture, Result, ResultEventHandler, ResultSet, UpdateResult,
};

#[derive(Debug, Default)]
struct BackendInfo {
    process_id: i32,
    secret_key: i32,
    parameters: HashMap<String, String>,
}

/// One open PostgreSQL connection, backed by the core session pipeline.
pub struct PgConnection {
    session: Arc<DbSession>,
    id: u64,
    backend: Mutex<BackendInfo>,
}

impl PgConnection {
    pub fn new(session: Arc<DbSession>, id: u64) -> Arc<Self> {
        Arc::new(Self {
            session,
            id,
            backend: Mutex::new(BackendInfo::default()),
        })
    }

    /// Manager-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<DbSession> {
        &self.session
    }

    /// Backend process id, for out-of-band cancellation requests.
    pub fn process_id(&self) -> i32 {
        self.backend.lock().unwrap().process_id
    }

    /// Backend secret key, for out-of-band cancellation requests.
    pub fn secret_key(&self) -> i32 {
        self.backend.lock().unwrap().secret_key
    }

    /// A server parameter reported during startup (or later).
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.backend.lock().unwrap().parameters.get(name).cloned()
    }

    pub(crate) fn set_key(&self, process_id: i32, secret_key: i32) {
        let mut backend = self.backend.lock().unwrap();
        backend.process_id = process_id;
        backend.secret_key = secret_key;
    }

    pub(crate) fn set_parameter(&self, name: String, value: String) {
        self.backend.lock().unwrap().parameters.insert(name, value);
    }

    /// Execute a query streaming rows through `handler` into `accumulator`.
    pub fn execute_query_with<T, H>(
        &self,
        sql: &str,
        handler: H,
        accumulator: T,
    ) -> Result<DbSessionFuture<T>>
    where
        T: Send + 'static,
        H: ResultEventHandler<T> + Sync + 'static,
    {
        self.session.execute_query_with(sql, handler, accumulator)
    }
}

impl Connection for PgConnection {
    fn execute_query(&self, sql: &str) -> Result<DbSessionFuture<ResultSet>> {
        self.session.execute_query(sql)
    }

    fn execute_update(&self, sql: &str) -> Result<DbSessionFuture<UpdateResult>> {
        self.session.execute_update(sql)
    }

    fn begin_transaction(&self) -> Result<()> {
        self.session.begin_transaction()
    }

    fn commit(&self) -> Result<DbSessionFuture<()>> {
        self.session.commit()
    }

    fn rollback(&self) -> Result<DbSessionFuture<()>> {
        self.session.rollback()
    }

    fn close(&self, immediate: bool) -> DbSessionFuture<()> {
        self.session.close(immediate)
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    fn is_in_transaction(&self) -> bool {
        self.session.is_in_transaction()
    }

    fn is_pipelining_enabled(&self) -> bool {
        self.session.is_pipelining_enabled()
    }

    fn set_pipelining_enabled(&self, enabled: bool) {
        self.session.set_pipelining_enabled(enabled);
    }
}
