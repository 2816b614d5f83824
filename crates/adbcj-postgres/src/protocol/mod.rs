//! PostgreSQL v3.0 wire protocol definitions.
//!
//! Every backend message except the initial handshake stream starts with a
//! 1-byte type tag and a 4-byte big-endian length that includes the length
//! field itself.

pub mod messages;
pub mod reader;
pub mod writer;

pub use messages::{BackendMessage, ErrorFields, FrontendMessage, PgColumn, TransactionStatus};
pub use reader::MessageReader;
pub use writer::MessageWriter;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Frontend message type bytes.
pub mod frontend_type {
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const PARSE: u8 = b'P';
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Backend message type bytes.
pub mod backend_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const DATA_ROW: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const KEY: u8 = b'K';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
}

/// Authentication sub-message codes.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const KERBEROS_5: i32 = 2;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const CRYPT_PASSWORD: i32 = 4;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SCM_CREDENTIAL: i32 = 6;
    pub const GSS: i32 = 7;
}

/// Type OIDs this client maps into the catalog.
pub mod oid {
    pub const BOOLEAN: i32 = 16;
    pub const CHAR: i32 = 18;
    pub const BIGINT: i32 = 20;
    pub const SMALLINT: i32 = 21;
    pub const INTEGER: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const REAL: i32 = 700;
    pub const DOUBLE: i32 = 701;
    pub const VARCHAR: i32 = 1043;
    pub const DATE: i32 = 1082;
    pub const NUMERIC: i32 = 1700;
}

/// Result column wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatCode {
    Text,
    Binary,
}

impl FormatCode {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(FormatCode::Text),
            1 => Some(FormatCode::Binary),
            _ => None,
        }
    }
}
