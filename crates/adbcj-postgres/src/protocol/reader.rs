//! Decoder for inbound PostgreSQL backend messages.

use adbcj_core::{DbError, Field, Result, SqlType};
use log::{trace, warn};

use super::messages::{BackendMessage, ErrorFields, PgColumn, TransactionStatus};
use super::{auth_type, backend_type, oid, FormatCode};

/// Accumulates backend bytes and yields one typed message per complete
/// frame. Each frame's payload is bounded before decoding, so a malformed
/// message cannot read past its own length.
#[derive(Default)]
pub struct MessageReader {
    buffer: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete message, or `None` when more bytes are
    /// needed.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>> {
        // Need the tag and the length to size the frame.
        if self.buffer.len() < 5 {
            return Ok(None);
        }
        let tag = self.buffer[0];
        let length =
            i32::from_be_bytes([self.buffer[1], self.buffer[2], self.buffer[3], self.buffer[4]]);
        if length < 4 {
            return Err(DbError::protocol(format!(
                "invalid backend message length {}",
                length
            )));
        }
        let total = 1 + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload: Vec<u8> = self.buffer[5..total].to_vec();
        self.buffer.drain(..total);
        trace!("decoding backend message '{}'", tag as char);

        let mut cursor = Cursor::new(&payload);
        let message = decode_message(tag, &mut cursor)?;
        if !cursor.is_empty() {
            return Err(DbError::protocol(format!(
                "{} bytes left over after decoding backend message '{}'",
                cursor.remaining(),
                tag as char
            )));
        }
        Ok(Some(message))
    }
}

fn decode_message(tag: u8, cursor: &mut Cursor<'_>) -> Result<BackendMessage> {
    match tag {
        backend_type::AUTHENTICATION => decode_authentication(cursor),
        backend_type::KEY => Ok(BackendMessage::BackendKeyData {
            process_id: cursor.read_i32()?,
            secret_key: cursor.read_i32()?,
        }),
        backend_type::PARAMETER_STATUS => Ok(BackendMessage::ParameterStatus {
            name: cursor.read_cstr()?,
            value: cursor.read_cstr()?,
        }),
        backend_type::ROW_DESCRIPTION => decode_row_description(cursor),
        backend_type::DATA_ROW => decode_data_row(cursor),
        backend_type::COMMAND_COMPLETE => {
            Ok(BackendMessage::CommandComplete(cursor.read_cstr()?))
        }
        backend_type::ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(decode_fields(cursor)?)),
        backend_type::NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(decode_fields(cursor)?)),
        backend_type::READY_FOR_QUERY => {
            let status = match cursor.read_u8()? {
                b'I' => TransactionStatus::Idle,
                b'T' => TransactionStatus::Transaction,
                b'E' => TransactionStatus::Error,
                other => {
                    return Err(DbError::protocol(format!(
                        "unrecognized server status '{}'",
                        other as char
                    )));
                }
            };
            Ok(BackendMessage::ReadyForQuery(status))
        }
        backend_type::PARSE_COMPLETE => Ok(BackendMessage::ParseComplete),
        backend_type::BIND_COMPLETE => Ok(BackendMessage::BindComplete),
        backend_type::CLOSE_COMPLETE => Ok(BackendMessage::CloseComplete),
        backend_type::NO_DATA => Ok(BackendMessage::NoData),
        backend_type::EMPTY_QUERY_RESPONSE => Ok(BackendMessage::EmptyQueryResponse),
        backend_type::PORTAL_SUSPENDED => Ok(BackendMessage::PortalSuspended),
        other => Err(DbError::protocol(format!(
            "unrecognized backend message type '{}' (0x{:02x})",
            other as char, other
        ))),
    }
}

fn decode_authentication(cursor: &mut Cursor<'_>) -> Result<BackendMessage> {
    let code = cursor.read_i32()?;
    match code {
        auth_type::OK => Ok(BackendMessage::AuthenticationOk),
        auth_type::MD5_PASSWORD => {
            let salt_bytes = cursor.read_bytes(4)?;
            let mut salt = [0u8; 4];
            salt.copy_from_slice(salt_bytes);
            Ok(BackendMessage::AuthenticationMd5Password(salt))
        }
        other => {
            // Drain whatever payload the method carries.
            cursor.read_rest();
            Ok(BackendMessage::AuthenticationUnsupported(other))
        }
    }
}

fn decode_row_description(cursor: &mut Cursor<'_>) -> Result<BackendMessage> {
    let count = cursor.read_i16()?;
    let mut columns = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let name = cursor.read_cstr()?;
        let table_oid = cursor.read_i32()?;
        let column_attribute = cursor.read_i16()?;
        let type_oid = cursor.read_i32()?;
        let type_size = cursor.read_i16()?;
        let type_modifier = cursor.read_i32()?;
        let format = FormatCode::from_code(cursor.read_i16()?)
            .ok_or_else(|| DbError::protocol("unrecognized format code"))?;
        let column_type = map_type_oid(type_oid)?;
        columns.push(PgColumn {
            field: Field::new(index, name, column_type),
            table_oid,
            column_attribute,
            type_oid,
            type_size,
            type_modifier,
            format,
        });
    }
    Ok(BackendMessage::RowDescription(columns))
}

fn decode_data_row(cursor: &mut Cursor<'_>) -> Result<BackendMessage> {
    let count = cursor.read_i16()?;
    let mut cells = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let length = cursor.read_i32()?;
        if length < 0 {
            cells.push(None);
        } else {
            cells.push(Some(cursor.read_bytes(length as usize)?.to_vec()));
        }
    }
    Ok(BackendMessage::DataRow(cells))
}

fn decode_fields(cursor: &mut Cursor<'_>) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    loop {
        let token = cursor.read_u8()?;
        if token == 0 {
            break;
        }
        let value = cursor.read_cstr()?;
        match token {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = value.parse().ok(),
            other => {
                warn!(
                    "unrecognized error field '{}' with value '{}'",
                    other as char, value
                );
            }
        }
    }
    // Anything after the terminator is the server's business, not ours.
    cursor.read_rest();
    Ok(fields)
}

/// Map a type OID into the catalog.
fn map_type_oid(type_oid: i32) -> Result<SqlType> {
    match type_oid {
        oid::BOOLEAN => Ok(SqlType::Boolean),
        oid::CHAR => Ok(SqlType::Char),
        oid::BIGINT => Ok(SqlType::BigInteger),
        oid::SMALLINT => Ok(SqlType::SmallInteger),
        oid::INTEGER => Ok(SqlType::Integer),
        oid::TEXT | oid::VARCHAR => Ok(SqlType::Varchar),
        oid::REAL => Ok(SqlType::Real),
        oid::DOUBLE => Ok(SqlType::Double),
        oid::DATE => Ok(SqlType::Date),
        oid::NUMERIC => Ok(SqlType::Numeric),
        other => Err(DbError::protocol(format!(
            "unable to handle field type with oid {}",
            other
        ))),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| DbError::protocol("truncated backend message"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_i16(&mut self) -> Result<i16> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(DbError::protocol("truncated backend message"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_cstr(&mut self) -> Result<String> {
        let start = self.pos;
        let rel = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DbError::protocol("string missing NUL terminator"))?;
        let s = String::from_utf8_lossy(&self.data[start..start + rel]).into_owned();
        self.pos = start + rel + 1;
        Ok(s)
    }

    fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
