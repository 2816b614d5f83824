//! PostgreSQL connection manager.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use adbcj_core::transport::read_loop;
use adbcj_core::{
    Connection, ConnectionManager, DbError, DbFuture, DbSession, Result, TcpTransport, Transport,
};
use log::{debug, trace};

use crate::config::PgConfig;
use crate::connection::PgConnection;
use crate::handler::{PgOps, ProtocolHandler};

#[derive(Default)]
struct ConnectState {
    opened: bool,
    cancelled: bool,
}

/// Mints PostgreSQL connections to one configured endpoint and tracks the
/// live ones.
pub struct PgConnectionManager {
    config: PgConfig,
    connections: Mutex<HashMap<u64, Arc<PgConnection>>>,
    next_id: AtomicU64,
    close_future: Mutex<Option<DbFuture<()>>>,
    weak_self: Weak<Self>,
}

impl PgConnectionManager {
    pub fn new(config: PgConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            close_future: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Connections currently tracked by the manager.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        trace!("removing connection {}", id);
        self.connections.lock().unwrap().remove(&id);
    }

    fn connect_stream(config: &PgConfig) -> Result<TcpStream> {
        let addr = config
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| DbError::transport(format!("cannot resolve {}", config.host), e))?
            .next()
            .ok_or_else(|| {
                DbError::Config(format!("no address found for {}", config.socket_addr()))
            })?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)
            .map_err(|e| DbError::transport(format!("failed to connect to {}", addr), e))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Runs on the connector thread, which then becomes the session's I/O
    /// thread.
    fn run_session(
        self: Arc<Self>,
        stream: TcpStream,
        connect_future: DbFuture<Arc<dyn Connection>>,
    ) {
        let write_half = match stream.try_clone() {
            Ok(half) => half,
            Err(e) => {
                let _ = connect_future.set_error(DbError::transport("failed to clone socket", e));
                return;
            }
        };
        let transport = Arc::new(TcpTransport::new(write_half));
        let dyn_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
        let ops = Arc::new(PgOps::new(Arc::clone(&dyn_transport)));
        let ops_dyn: Arc<dyn adbcj_core::ProtocolOps> =
            Arc::clone(&ops) as Arc<dyn adbcj_core::ProtocolOps>;
        let session = DbSession::new(ops_dyn, Arc::clone(&dyn_transport));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = PgConnection::new(Arc::clone(&session), id);
        self.connections
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&connection));

        // The frontend speaks first.
        if let Err(e) = ops.send_startup(&self.config) {
            let _ = connect_future.set_error(e);
            self.remove_connection(id);
            return;
        }

        let mut handler = ProtocolHandler::new(
            session,
            dyn_transport,
            self.config.clone(),
            ops,
            connect_future,
            connection,
            self.weak_self.clone(),
        );
        read_loop(stream, &transport, &mut handler);
    }
}

impl ConnectionManager for PgConnectionManager {
    fn connect(&self) -> DbFuture<Arc<dyn Connection>> {
        if self.is_closed() {
            return DbFuture::completed_err(DbError::SessionClosed(
                "connection manager is closed".to_string(),
            ));
        }
        debug!("starting connection to {}", self.config.socket_addr());
        let future: DbFuture<Arc<dyn Connection>> = DbFuture::new();

        let connect_state = Arc::new(Mutex::new(ConnectState::default()));
        {
            let connect_state = Arc::clone(&connect_state);
            future.set_cancel_hook(Box::new(move |_| {
                let mut state = connect_state.lock().unwrap();
                if state.opened {
                    return false;
                }
                state.cancelled = true;
                true
            }));
        }

        let Some(manager) = self.weak_self.upgrade() else {
            return DbFuture::completed_err(DbError::SessionClosed(
                "connection manager dropped".to_string(),
            ));
        };
        let thread_future = future.clone();
        std::thread::Builder::new()
            .name("adbcj-pg-connect".to_string())
            .spawn(move || {
                let stream = match Self::connect_stream(&manager.config) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = thread_future.set_error(e);
                        return;
                    }
                };
                {
                    let mut state = connect_state.lock().unwrap();
                    if state.cancelled {
                        // Cancelled before the session opened; tear down.
                        debug!("connect cancelled, dropping socket");
                        return;
                    }
                    state.opened = true;
                }
                manager.run_session(stream, thread_future);
            })
            .expect("failed to spawn connector thread");

        future
    }

    fn close(&self, immediate: bool) -> DbFuture<()> {
        let future = {
            let mut close_future = self.close_future.lock().unwrap();
            if let Some(existing) = close_future.as_ref() {
                return existing.clone();
            }
            let future: DbFuture<()> = DbFuture::new();
            *close_future = Some(future.clone());
            future
        };
        let connections: Vec<Arc<PgConnection>> =
            self.connections.lock().unwrap().values().cloned().collect();
        if connections.is_empty() {
            let _ = future.set_result(());
            return future;
        }
        let remaining = Arc::new(AtomicUsize::new(connections.len()));
        for connection in connections {
            let future = future.clone();
            let remaining = Arc::clone(&remaining);
            connection.close(immediate).add_listener(move |_| {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = future.set_result(());
                }
            });
        }
        self.close_future.lock().unwrap().clone().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.close_future.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<PgConnectionManager> {
        PgConnectionManager::new(
            PgConfig::new()
                .host("localhost")
                .user("u")
                .password("p")
                .database("d"),
        )
    }

    #[test]
    fn test_close_with_no_connections_settles_immediately() {
        let manager = manager();
        assert!(!manager.is_closed());
        let future = manager.close(false);
        assert!(future.is_done());
        assert!(manager.is_closed());
    }

    #[test]
    fn test_connect_after_close_fails() {
        let manager = manager();
        manager.close(true);
        let future = manager.connect();
        assert!(matches!(future.get(), Err(DbError::SessionClosed(_))));
    }
}
