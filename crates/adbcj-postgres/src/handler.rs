//! PostgreSQL protocol handler: outbound operations and inbound dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use adbcj_core::error::ServerError;
use adbcj_core::{
    Connection, DbError, DbFuture, DbSession, InboundHandler, ProtocolOps, Request, Result,
    Transport, UpdateResult, Value,
};
use log::{debug, trace, warn};
use regex::Regex;

use crate::config::PgConfig;
use crate::connection::PgConnection;
use crate::manager::PgConnectionManager;
use crate::protocol::messages::{BackendMessage, ErrorFields, PgColumn, TransactionStatus};
use crate::protocol::{FormatCode, FrontendMessage, MessageReader, MessageWriter};

/// Outbound half: frames session operations as extended-query sequences.
///
/// Each SQL statement becomes `Parse | Bind | Describe | Execute | Sync`
/// against the anonymous statement and default portal, batched into one
/// transport write. The transaction keywords go through a server-side
/// prepared-statement cache so their Parse is elided on repeat.
pub struct PgOps {
    transport: Arc<dyn Transport>,
    statement_counter: AtomicU64,
    statement_cache: Mutex<HashMap<String, String>>,
}

impl PgOps {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            statement_counter: AtomicU64::new(0),
            statement_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Send the startup message.
    pub fn send_startup(&self, config: &PgConfig) -> Result<()> {
        let mut writer = MessageWriter::new();
        writer.write(&FrontendMessage::Startup {
            params: config.startup_params(),
        });
        self.transport.write(&writer.take())
    }

    /// Send a password response.
    pub fn send_password(&self, password: String) -> Result<()> {
        let mut writer = MessageWriter::new();
        writer.write(&FrontendMessage::Password(password));
        self.transport.write(&writer.take())
    }

    /// Execute a transaction keyword through the statement cache.
    fn execute_statement(&self, statement: &str) -> Result<()> {
        let mut writer = MessageWriter::new();
        let statement_id = {
            let mut cache = self.statement_cache.lock().unwrap();
            match cache.get(statement) {
                Some(id) => id.clone(),
                None => {
                    let id = format!("S_{}", self.statement_counter.fetch_add(1, Ordering::SeqCst) + 1);
                    writer.write(&FrontendMessage::Parse {
                        name: id.clone(),
                        query: statement.to_string(),
                    });
                    cache.insert(statement.to_string(), id.clone());
                    id
                }
            }
        };
        writer
            .write(&FrontendMessage::Bind {
                portal: String::new(),
                statement: statement_id,
            })
            .write(&FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            })
            .write(&FrontendMessage::Sync);
        self.transport.write(&writer.take())
    }
}

impl ProtocolOps for PgOps {
    fn send_query(&self, sql: &str) -> Result<()> {
        debug!("issuing query: {}", sql);
        let mut writer = MessageWriter::new();
        writer
            .write(&FrontendMessage::Parse {
                name: String::new(),
                query: sql.to_string(),
            })
            .write(&FrontendMessage::Bind {
                portal: String::new(),
                statement: String::new(),
            })
            .write(&FrontendMessage::DescribePortal(String::new()))
            .write(&FrontendMessage::Execute {
                portal: String::new(),
                max_rows: 0,
            })
            .write(&FrontendMessage::Sync);
        self.transport.write(&writer.take())
    }

    fn send_begin(&self) -> Result<()> {
        self.execute_statement("BEGIN")
    }

    fn send_commit(&self) -> Result<()> {
        self.execute_statement("COMMIT")
    }

    fn send_rollback(&self) -> Result<()> {
        self.execute_statement("ROLLBACK")
    }

    fn send_terminate(&self) -> Result<()> {
        let mut writer = MessageWriter::new();
        writer.write(&FrontendMessage::Terminate);
        self.transport.write(&writer.take())
    }
}

/// Compute the MD5 password response:
/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    use std::fmt::Write;

    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    let mut outer_input = format!("{:x}", inner_hash).into_bytes();
    outer_input.extend_from_slice(&salt);
    let outer_hash = md5::compute(&outer_input);

    let mut result = String::with_capacity(35);
    result.push_str("md5");
    write!(&mut result, "{:x}", outer_hash).expect("writing to a String cannot fail");
    result
}

fn command_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\w+)\s*(\d*)\s*(\d*)$").unwrap())
}

/// Inbound half: consumes decoded backend messages on the session's I/O
/// thread and drives the pipeline. Failures come back as `Err` values and
/// are routed by the dispatcher rather than thrown through it.
pub struct ProtocolHandler {
    reader: MessageReader,
    session: Arc<DbSession>,
    transport: Arc<dyn Transport>,
    config: PgConfig,
    ops: Arc<PgOps>,
    connect_future: DbFuture<Arc<dyn Connection>>,
    connection: Arc<PgConnection>,
    manager: Weak<PgConnectionManager>,
}

impl ProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<DbSession>,
        transport: Arc<dyn Transport>,
        config: PgConfig,
        ops: Arc<PgOps>,
        connect_future: DbFuture<Arc<dyn Connection>>,
        connection: Arc<PgConnection>,
        manager: Weak<PgConnectionManager>,
    ) -> Self {
        Self {
            reader: MessageReader::new(),
            session,
            transport,
            config,
            ops,
            connect_future,
            connection,
            manager,
        }
    }

    fn handle(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::AuthenticationOk => {
                debug!("authenticated successfully");
                Ok(())
            }
            BackendMessage::AuthenticationMd5Password(salt) => {
                let hash = md5_password(&self.config.user, &self.config.password, salt);
                self.ops.send_password(hash)
            }
            BackendMessage::AuthenticationUnsupported(code) => Err(DbError::auth(format!(
                "authentication method {} is not supported",
                code
            ))),
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.connection.set_key(process_id, secret_key);
                Ok(())
            }
            BackendMessage::ParameterStatus { name, value } => {
                trace!("server parameter {}={}", name, value);
                self.connection.set_parameter(name, value);
                Ok(())
            }
            BackendMessage::RowDescription(columns) => {
                let request = self.active_request("row description")?;
                request.start_fields();
                for column in &columns {
                    request.field(column.field.clone());
                }
                request.end_fields();
                request.start_results();
                request.set_payload(Arc::new(columns));
                Ok(())
            }
            BackendMessage::DataRow(cells) => {
                let request = self.active_request("data row")?;
                let columns = request
                    .payload()
                    .and_then(|payload| payload.downcast::<Vec<PgColumn>>().ok())
                    .ok_or_else(|| {
                        DbError::protocol("received a data row without field definitions")
                    })?;
                if cells.len() != columns.len() {
                    return Err(DbError::protocol(format!(
                        "data row has {} cells but the description has {} columns",
                        cells.len(),
                        columns.len()
                    )));
                }
                request.start_row();
                for (column, cell) in columns.iter().zip(cells) {
                    let value = match cell {
                        None => Value::Null,
                        Some(bytes) => decode_cell(column, &bytes)?,
                    };
                    request.value(value);
                }
                request.end_row();
                Ok(())
            }
            BackendMessage::CommandComplete(tag) => self.handle_command_complete(&tag),
            BackendMessage::ErrorResponse(fields) => Err(server_error(&fields)),
            BackendMessage::NoticeResponse(fields) => {
                warn!("server notice: {} {}", fields.severity, fields.message);
                Ok(())
            }
            BackendMessage::ReadyForQuery(status) => self.handle_ready(status),
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::EmptyQueryResponse
            | BackendMessage::PortalSuspended => Ok(()),
        }
    }

    fn handle_command_complete(&self, tag: &str) -> Result<()> {
        let captures = command_tag_pattern()
            .captures(tag)
            .ok_or_else(|| DbError::protocol(format!("unable to parse command tag '{}'", tag)))?;
        let command = captures.get(1).map_or("", |m| m.as_str());
        // `INSERT <oid> <rows>` puts the row count last; the other
        // data-modifying tags carry it in the second position.
        let count: u64 = captures
            .get(3)
            .filter(|m| !m.as_str().is_empty())
            .or_else(|| captures.get(2).filter(|m| !m.as_str().is_empty()))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);

        let request = self.active_request("command completion")?;
        match command {
            "SELECT" => {
                request.complete_results();
                Ok(())
            }
            "BEGIN" | "COMMIT" | "ROLLBACK" => {
                request.complete_unit();
                Ok(())
            }
            "INSERT" | "UPDATE" | "DELETE" => {
                request.complete_update(UpdateResult::new(count));
                Ok(())
            }
            other => Err(DbError::protocol(format!(
                "command completions of type {} are not implemented",
                other
            ))),
        }
    }

    fn handle_ready(&self, status: TransactionStatus) -> Result<()> {
        if !self.connect_future.is_done() {
            debug!("connection ready");
            let connection: Arc<dyn Connection> = Arc::clone(&self.connection) as Arc<dyn Connection>;
            let _ = self.connect_future.set_result(connection);
            return Ok(());
        }
        match status {
            TransactionStatus::Idle => Ok(()),
            TransactionStatus::Transaction => {
                let transactional = self.session.is_in_transaction()
                    || self
                        .session
                        .active_request()
                        .is_some_and(|request| request.in_transaction());
                if transactional {
                    Ok(())
                } else {
                    Err(DbError::protocol(
                        "a transactional request returned outside of a transaction",
                    ))
                }
            }
            TransactionStatus::Error => {
                // The failing statement already errored its request and
                // cancelled the transaction; a ROLLBACK can still be sent.
                if let Some(request) = self.session.active_request() {
                    if !request.is_done() {
                        request.error(DbError::TransactionFailed(
                            "transaction is in an error state".to_string(),
                        ));
                    }
                } else {
                    trace!("ready(error) with no active request");
                }
                Ok(())
            }
        }
    }

    fn active_request(&self, what: &str) -> Result<Arc<Request>> {
        self.session
            .active_request()
            .ok_or_else(|| DbError::protocol(format!("received a {} without an active request", what)))
    }

    /// Route a failure: connect future first, then the active request
    /// (cancelling its transaction), and as a last resort tear the
    /// transport down.
    fn route_error(&self, error: DbError) {
        if !self.connect_future.is_done() {
            let _ = self.connect_future.set_error(error);
            return;
        }
        if let Some(request) = self.session.active_request() {
            request.error(error);
            return;
        }
        if error.is_fatal() {
            warn!("unroutable session error, closing transport: {}", error);
            self.transport.close();
            self.session.error_pending_requests(error);
        } else {
            debug!("server error with no outstanding request: {}", error);
        }
    }
}

impl InboundHandler for ProtocolHandler {
    fn data(&mut self, bytes: &[u8]) {
        self.reader.feed(bytes);
        loop {
            match self.reader.next_message() {
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
                .unwrap_or_else(|| DbError::transport_msg("connection closed during startup"));
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

fn server_error(fields: &ErrorFields) -> DbError {
    DbError::Server(ServerError {
        vendor_code: None,
        sql_state: if fields.code.is_empty() {
            None
        } else {
            Some(fields.code.clone())
        },
        message: fields.message.clone(),
    })
}

/// Decode one cell per the column's declared type and format code.
fn decode_cell(column: &PgColumn, bytes: &[u8]) -> Result<Value> {
    use adbcj_core::SqlType;

    if column.format == FormatCode::Binary {
        return match column.column_type() {
            SqlType::Integer => {
                if bytes.len() != 4 {
                    return Err(DbError::protocol("binary INTEGER cell is not 4 bytes"));
                }
                Ok(Value::Int(i32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ])))
            }
            other => Err(DbError::protocol(format!(
                "binary format is not supported for {:?} columns",
                other
            ))),
        };
    }

    let text = String::from_utf8_lossy(bytes);
    let bad = |what: &str| DbError::protocol(format!("cannot parse '{}' as {}", text, what));
    let value = match column.column_type() {
        SqlType::Boolean => match text.as_ref() {
            "t" | "true" => Value::Bool(true),
            "f" | "false" => Value::Bool(false),
            _ => return Err(bad("BOOLEAN")),
        },
        SqlType::SmallInteger | SqlType::Short => {
            Value::SmallInt(text.parse().map_err(|_| bad("SMALLINT"))?)
        }
        SqlType::Integer => Value::Int(text.parse().map_err(|_| bad("INTEGER"))?),
        SqlType::BigInteger => Value::BigInt(text.parse().map_err(|_| bad("BIGINT"))?),
        SqlType::Real | SqlType::Float => Value::Float(text.parse().map_err(|_| bad("REAL"))?),
        SqlType::Double => Value::Double(text.parse().map_err(|_| bad("DOUBLE"))?),
        SqlType::Numeric | SqlType::Decimal => Value::Decimal(text.into_owned()),
        SqlType::Char | SqlType::Varchar => Value::Text(text.into_owned()),
        SqlType::Date => Value::Date(text.into_owned()),
        other => {
            return Err(DbError::protocol(format!(
                "unable to decode column of type {:?}",
                other
            )));
        }
    };
    Ok(value)
}
