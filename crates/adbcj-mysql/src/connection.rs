//! Public MySQL connection.

use std::sync::{Arc, Mutex};

use adbcj_core::{
    Connection, DbSession, DbSessionFuture, Result, ResultEventHandler, ResultSet, UpdateResult,
};

use crate::protocol::messages::ServerGreeting;

#[derive(Debug, Default, Clone)]
struct ServerInfo {
    thread_id: u32,
    version: String,
}

/// One open MySQL connection, backed by the core session pipeline.
pub struct MysqlConnection {
    session: Arc<DbSession>,
    id: u64,
    server: Mutex<ServerInfo>,
}

impl MysqlConnection {
    pub fn new(session: Arc<DbSession>, id: u64) -> Arc<Self> {
        Arc::new(Self {
            session,
            id,
            server: Mutex::new(ServerInfo::default()),
        })
    }

    /// Manager-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Arc<DbSession> {
        &self.session
    }

    /// Backend thread id reported in the greeting.
    pub fn thread_id(&self) -> u32 {
        self.server.lock().unwrap().thread_id
    }

    /// Server version string reported in the greeting.
    pub fn server_version(&self) -> String {
        self.server.lock().unwrap().version.clone()
    }

    pub(crate) fn record_greeting(&self, greeting: &ServerGreeting) {
        let mut server = self.server.lock().unwrap();
        server.thread_id = greeting.thread_id;
        server.version = greeting.version.clone();
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

impl Connection for MysqlConnection {
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
