//! MySQL protocol handler: outbound operations and inbound dispatch.

use std::sync::{Arc, Weak};

use adbcj_core::error::ServerError;
use adbcj_core::{
    Connection, DbError, DbFuture, DbSession, InboundHandler, ProtocolOps, Result, Transport,
    UpdateResult,
};
use log::{debug, trace, warn};

use crate::connection::MysqlConnection;
use crate::manager::MysqlConnectionManager;
use crate::protocol::messages::{
    build_login_packet, build_query_packet, build_quit_packet, EofContext, LoginCredentials,
    ServerMessage,
};
use crate::protocol::{MessageDecoder, MysqlCharset};

/// Outbound half: frames session operations as MySQL command packets.
///
/// BEGIN/COMMIT/ROLLBACK are plain text statements on MySQL; terminate is
/// COM_QUIT.
pub struct MysqlOps {
    transport: Arc<dyn Transport>,
}

impl MysqlOps {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl ProtocolOps for MysqlOps {
    fn send_query(&self, sql: &str) -> Result<()> {
        debug!("issuing query: {}", sql);
        self.transport.write(&build_query_packet(sql))
    }

    fn send_begin(&self) -> Result<()> {
        self.transport.write(&build_query_packet("BEGIN"))
    }

    fn send_commit(&self) -> Result<()> {
        self.transport.write(&build_query_packet("COMMIT"))
    }

    fn send_rollback(&self) -> Result<()> {
        self.transport.write(&build_query_packet("ROLLBACK"))
    }

    fn send_terminate(&self) -> Result<()> {
        self.transport.write(&build_quit_packet())
    }
}

/// Inbound half: consumes decoded messages on the session's I/O thread and
/// drives the pipeline.
pub struct ProtocolHandler {
    decoder: MessageDecoder,
    session: Arc<DbSession>,
    transport: Arc<dyn Transport>,
    credentials: LoginCredentials,
    charset: MysqlCharset,
    connect_future: DbFuture<Arc<dyn Connection>>,
    connection: Arc<MysqlConnection>,
    manager: Weak<MysqlConnectionManager>,
}

impl ProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<DbSession>,
        transport: Arc<dyn Transport>,
        credentials: LoginCredentials,
        charset: MysqlCharset,
        connect_future: DbFuture<Arc<dyn Connection>>,
        connection: Arc<MysqlConnection>,
        manager: Weak<MysqlConnectionManager>,
    ) -> Self {
        Self {
            decoder: MessageDecoder::new(charset),
            session,
            transport,
            credentials,
            charset,
            connect_future,
            connection,
            manager,
        }
    }

    fn handle(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Greeting(greeting) => {
                debug!(
                    "server {} (thread {}), sending login",
                    greeting.version, greeting.thread_id
                );
                self.connection.record_greeting(&greeting);
                let packet = build_login_packet(&self.credentials, self.charset, &greeting.salt);
                self.transport.write(&packet)
            }
            ServerMessage::Ok(ok) => {
                if !self.connect_future.is_done() {
                    debug!("login complete");
                    let connection: Arc<dyn Connection> = Arc::clone(&self.connection) as Arc<dyn Connection>;
                    if self.connect_future.set_result(connection).is_err() {
                        trace!("connect future settled before login OK");
                    }
                    return Ok(());
                }
                let request = self.active_request("OK response")?;
                let mut result = UpdateResult::new(ok.affected_rows);
                if ok.insert_id != 0 {
                    result.insert_id = Some(ok.insert_id);
                }
                request.complete_update(result);
                Ok(())
            }
            ServerMessage::Error(err) => {
                let error = DbError::Server(ServerError {
                    vendor_code: Some(u32::from(err.error_number)),
                    sql_state: Some(err.sql_state),
                    message: err.message,
                });
                if !self.connect_future.is_done() {
                    let _ = self.connect_future.set_error(error);
                    return Ok(());
                }
                if let Some(request) = self.session.active_request() {
                    request.error(error);
                    return Ok(());
                }
                Err(error)
            }
            ServerMessage::ResultSetHeader { field_count } => {
                trace!("result set with {} fields", field_count);
                let request = self.active_request("result set header")?;
                request.start_fields();
                Ok(())
            }
            ServerMessage::FieldDefinition(field) => {
                let request = self.active_request("field definition")?;
                request.field(field.field);
                Ok(())
            }
            ServerMessage::Eof(eof) => {
                let request = self.active_request("EOF response")?;
                match eof.context {
                    EofContext::Field => {
                        request.end_fields();
                        request.start_results();
                    }
                    EofContext::Row => {
                        request.complete_results();
                    }
                }
                Ok(())
            }
            ServerMessage::Row(values) => {
                let request = self.active_request("result row")?;
                request.start_row();
                for value in values {
                    request.value(value);
                }
                request.end_row();
                Ok(())
            }
        }
    }

    fn active_request(&self, what: &str) -> Result<Arc<adbcj_core::Request>> {
        self.session
            .active_request()
            .ok_or_else(|| DbError::protocol(format!("received a {} without an active request", what)))
    }

    /// Route a failure: connect future first, then the active request, and
    /// as a last resort tear the transport down.
    fn route_error(&self, error: DbError) {
        if !self.connect_future.is_done() {
            let _ = self.connect_future.set_error(error);
            return;
        }
        if let Some(request) = self.session.active_request() {
            request.error(error);
            return;
        }
        warn!("unroutable session error, closing transport: {}", error);
        self.transport.close();
        self.session.error_pending_requests(error);
    }
}

impl InboundHandler for ProtocolHandler {
    fn data(&mut self, bytes: &[u8]) {
        self.decoder.feed(bytes);
        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle(message) {
                        self.route_error(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The frame stream is unrecoverable past a decode error.
                    self.route_error(e);
                    self.transport.close();
                    break;
                }
            }
        }
    }

    fn closed(&mut self, error: Option<DbError>) {
        debug!("session transport closed");
        if !self.connect_future.is_done() {
            let error = error
                .clone()
                .unwrap_or_else(|| DbError::transport_msg("connection closed during login"));
            let _ = self.connect_future.set_error(error);
        }
        if let Some(error) = error {
            self.session.error_pending_requests(error);
        }
        self.session.handle_transport_closed();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_connection(self.connection.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbcj_core::{MemoryTransport, Value};

    use crate::protocol::PacketHeader;

    fn packet(number: u8, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            packet_number: number,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn greeting_packet(salt_byte: u8) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(10);
        p.extend_from_slice(b"5.1.23\0");
        p.extend_from_slice(&42u32.to_le_bytes());
        p.extend_from_slice(&[salt_byte; 8]);
        p.push(0);
        p.extend_from_slice(&0xA28Du16.to_le_bytes());
        p.push(33);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&[0u8; 13]);
        p.extend_from_slice(&[salt_byte; 12]);
        p.push(0);
        packet(0, &p)
    }

    fn ok_packet(number: u8, affected: u8) -> Vec<u8> {
        let mut p = vec![0x00, affected];
        if affected > 0 {
            p.push(0); // insert id
        }
        p.extend_from_slice(&2u16.to_le_bytes());
        p.extend_from_slice(&0u16.to_le_bytes());
        packet(number, &p)
    }

    struct Fixture {
        handler: ProtocolHandler,
        session: Arc<DbSession>,
        transport: Arc<MemoryTransport>,
        connect_future: DbFuture<Arc<dyn Connection>>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MemoryTransport::new());
        let dyn_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
        let ops = Arc::new(MysqlOps::new(Arc::clone(&dyn_transport)));
        let session = DbSession::new(ops, Arc::clone(&dyn_transport));
        let connection = MysqlConnection::new(Arc::clone(&session), 1);
        let connect_future: DbFuture<Arc<dyn Connection>> = DbFuture::new();
        let credentials = LoginCredentials {
            username: "user".to_string(),
            password: "password".to_string(),
            database: "testdb".to_string(),
        };
        let handler = ProtocolHandler::new(
            Arc::clone(&session),
            dyn_transport,
            credentials,
            MysqlCharset::Utf8,
            connect_future.clone(),
            connection,
            Weak::new(),
        );
        Fixture {
            handler,
            session,
            transport,
            connect_future,
        }
    }

    #[test]
    fn test_handshake_and_select_one() {
        let mut fx = fixture();

        // Greeting: the handler answers with the login packet.
        fx.handler.data(&greeting_packet(7));
        let writes = fx.transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][3], 1); // login is packet number 1
        assert!(!fx.connect_future.is_done());

        // Login OK settles the connect future with the connection.
        fx.handler.data(&ok_packet(2, 0));
        assert!(fx.connect_future.is_done());
        let connection = fx.connect_future.get().unwrap();

        // Issue SELECT 1 and stream the server's answer through the handler.
        let future = connection.execute_query("SELECT 1").unwrap();
        let last = fx.transport.writes().last().unwrap().clone();
        assert_eq!(last[4], 0x03); // COM_QUERY
        assert_eq!(&last[5..], b"SELECT 1");

        fx.handler.data(&packet(1, &[0x01])); // one field
        let mut field = Vec::new();
        for part in ["def", "", "", "", "1", "1"] {
            field.push(part.len() as u8);
            field.extend_from_slice(part.as_bytes());
        }
        field.push(0x0C);
        field.extend_from_slice(&33u16.to_le_bytes());
        field.extend_from_slice(&1u32.to_le_bytes());
        field.push(0x03); // LONG
        field.extend_from_slice(&0u16.to_le_bytes());
        field.push(0);
        field.extend_from_slice(&[0, 0]);
        fx.handler.data(&packet(2, &field));
        fx.handler.data(&packet(3, &[0xFE, 0, 0, 2, 0]));
        fx.handler.data(&packet(4, &[0x01, b'1']));
        fx.handler.data(&packet(5, &[0xFE, 0, 0, 2, 0]));

        let rs = future.get().unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.fields().len(), 1);
        assert_eq!(rs.fields()[0].name, "1");
        assert_eq!(rs[0][0], Value::Int(1));
    }

    #[test]
    fn test_login_scramble_matches_salt() {
        let mut fx = fixture();
        fx.handler.data(&greeting_packet(9));
        let login = fx.transport.writes()[0].clone();
        let payload = &login[4..];
        // username begins after caps/max-packet/charset/filler.
        let rest = &payload[2 + 2 + 4 + 1 + 23..];
        assert_eq!(&rest[..5], b"user\0");
        let scramble = &rest[5..25];
        let expected = crate::auth::native_password("password", &[9u8; 20]);
        assert_eq!(scramble, &expected[..]);
    }

    #[test]
    fn test_bad_credentials_error_settles_connect_future() {
        let mut fx = fixture();
        fx.handler.data(&greeting_packet(1));

        let mut err = vec![0xFF];
        err.extend_from_slice(&1045u16.to_le_bytes());
        err.push(b'#');
        err.extend_from_slice(b"28000");
        err.extend_from_slice(b"Access denied for user");
        fx.handler.data(&packet(2, &err));

        assert!(fx.connect_future.is_done());
        assert!(!fx.connect_future.is_cancelled());
        match fx.connect_future.get() {
            Err(DbError::Server(e)) => {
                assert_eq!(e.vendor_code, Some(1045));
                assert_eq!(e.sql_state.as_deref(), Some("28000"));
            }
            other => panic!("expected server error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_update_completes_with_affected_rows() {
        let mut fx = fixture();
        fx.handler.data(&greeting_packet(1));
        fx.handler.data(&ok_packet(2, 0));
        let connection = fx.connect_future.get().unwrap();

        let future = connection.execute_update("DELETE FROM t").unwrap();
        fx.handler.data(&ok_packet(1, 3));
        let result = future.get().unwrap();
        assert_eq!(result.affected_rows, 3);
    }

    #[test]
    fn test_server_error_fails_active_request() {
        let mut fx = fixture();
        fx.handler.data(&greeting_packet(1));
        fx.handler.data(&ok_packet(2, 0));
        let connection = fx.connect_future.get().unwrap();

        let future = connection.execute_update("BROKEN").unwrap();
        let mut err = vec![0xFF];
        err.extend_from_slice(&1064u16.to_le_bytes());
        err.push(b'#');
        err.extend_from_slice(b"42000");
        err.extend_from_slice(b"You have an error in your SQL syntax");
        fx.handler.data(&packet(1, &err));

        assert!(matches!(future.get(), Err(DbError::Server(_))));
        // The pipeline is free again.
        assert!(fx.session.active_request().is_none());
    }

    #[test]
    fn test_transport_close_settles_everything() {
        let mut fx = fixture();
        fx.handler.data(&greeting_packet(1));
        fx.handler.data(&ok_packet(2, 0));
        let connection = fx.connect_future.get().unwrap();
        let future = connection.execute_update("INSERT 1").unwrap();

        fx.handler
            .closed(Some(DbError::transport_msg("connection reset")));
        assert!(matches!(future.get(), Err(DbError::Transport(_))));
        assert!(fx.session.is_closed() || fx.transport.is_closing() || future.is_done());
    }
}
