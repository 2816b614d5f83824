//! Typed PostgreSQL protocol messages.

use adbcj_core::{Field, SqlType};

use super::FormatCode;

/// Server transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I': not in a transaction block
    Idle,
    /// 'T': in a transaction block
    Transaction,
    /// 'E': in a failed transaction block
    Error,
}

/// Fields of an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    pub severity: String,
    /// SQLSTATE code
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
}

/// One column of a row description.
#[derive(Debug, Clone)]
pub struct PgColumn {
    /// Protocol-neutral descriptor handed to event handlers
    pub field: Field,
    pub table_oid: i32,
    pub column_attribute: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FormatCode,
}

impl PgColumn {
    pub fn column_type(&self) -> SqlType {
        self.field.column_type
    }
}

/// A decoded backend message.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    /// MD5 challenge with its 4-byte salt.
    AuthenticationMd5Password([u8; 4]),
    /// An authentication method this client does not implement.
    AuthenticationUnsupported(i32),
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    RowDescription(Vec<PgColumn>),
    /// Raw cells; `None` is NULL. Typed narrowing happens in the handler,
    /// which holds the row description.
    DataRow(Vec<Option<Vec<u8>>>),
    /// The completion tag string, e.g. `SELECT 1` or `INSERT 0 5`.
    CommandComplete(String),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    NoticeResponse(ErrorFields),
    ErrorResponse(ErrorFields),
    ReadyForQuery(TransactionStatus),
}

/// A frontend message this client sends.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    Startup {
        params: Vec<(String, String)>,
    },
    Password(String),
    Parse {
        /// Prepared statement name; empty for the anonymous statement.
        name: String,
        query: String,
    },
    Bind {
        /// Portal name; empty for the default portal.
        portal: String,
        /// Statement to bind; empty for the anonymous statement.
        statement: String,
    },
    /// Describe a portal.
    DescribePortal(String),
    Execute {
        portal: String,
        max_rows: i32,
    },
    Sync,
    Terminate,
}
