//! Typed MySQL protocol messages.

use adbcj_core::{Field, Value};

use super::writer::{build_command_packet, PacketWriter};
use super::{capabilities, commands, MysqlCharset, MAX_PACKET_SIZE};
use crate::auth;

/// Length of the scramble sent with the login response.
pub const CHALLENGE_RESPONSE_LENGTH: usize = 20;

/// Filler bytes between the charset and the username in the login packet.
pub const LOGIN_FILLER_LENGTH: usize = 23;

/// The server's initial handshake.
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub protocol: u8,
    pub version: String,
    pub thread_id: u32,
    /// Both salt parts, concatenated (8 + 12 bytes).
    pub salt: [u8; 20],
    pub server_capabilities: u16,
    pub charset_id: u8,
    pub server_status: u16,
}

/// An OK completion packet.
#[derive(Debug, Clone)]
pub struct OkResponse {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub server_status: u16,
    pub warning_count: u16,
    pub message: String,
}

/// A server error packet.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub error_number: u16,
    pub sql_state: String,
    pub message: String,
}

/// Whether an EOF packet ends the field block or the row stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofContext {
    Field,
    Row,
}

/// An EOF packet.
#[derive(Debug, Clone)]
pub struct EofResponse {
    pub warnings: u16,
    pub server_status: u16,
    pub context: EofContext,
}

/// One column definition of a result set.
#[derive(Debug, Clone)]
pub struct MysqlField {
    /// Protocol-neutral descriptor handed to event handlers
    pub field: Field,
    pub catalog: String,
    pub schema: String,
    pub table_label: String,
    pub table: String,
    pub column_name: String,
    pub charset_id: u16,
    pub length: u32,
    pub type_id: u8,
    pub flags: u16,
    pub decimals: u8,
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Greeting(ServerGreeting),
    Ok(OkResponse),
    Error(ErrorResponse),
    /// Header of a result set: the number of field packets that follow.
    ResultSetHeader { field_count: u64 },
    FieldDefinition(MysqlField),
    Eof(EofResponse),
    Row(Vec<Value>),
}

/// Credentials presented during login.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Build the login response to a server greeting. Always packet number 1.
///
/// Layout: 2-byte capabilities, 2-byte extended capabilities, 4-byte max
/// packet size, charset byte, 23 filler bytes, NUL-terminated username,
/// the 20-byte challenge response when a password is set, one filler byte,
/// NUL-terminated database name.
pub fn build_login_packet(
    credentials: &LoginCredentials,
    charset: MysqlCharset,
    salt: &[u8],
) -> Vec<u8> {
    let caps = capabilities::DEFAULT_CLIENT_FLAGS;
    let mut writer = PacketWriter::new();
    writer.write_u16_le((caps & 0xFFFF) as u16);
    writer.write_u16_le((caps >> 16) as u16);
    writer.write_u32_le(MAX_PACKET_SIZE);
    writer.write_u8(charset.id());
    writer.write_zeros(LOGIN_FILLER_LENGTH);
    writer.write_null_string(&credentials.username);
    if !credentials.password.is_empty() {
        let scramble = auth::native_password(&credentials.password, salt);
        writer.write_bytes(&scramble);
    }
    writer.write_zeros(1);
    writer.write_null_string(&credentials.database);
    writer.into_packet(1)
}

/// Build a COM_QUERY packet.
pub fn build_query_packet(sql: &str) -> Vec<u8> {
    build_command_packet(commands::COM_QUERY, sql.as_bytes())
}

/// Build a COM_QUIT packet.
pub fn build_quit_packet() -> Vec<u8> {
    build_command_packet(commands::COM_QUIT, &[])
}
