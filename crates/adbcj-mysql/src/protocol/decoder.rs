//! Stateful decoder for inbound MySQL packets.
//!
//! Bytes accumulate in an internal buffer; [`MessageDecoder::next_message`]
//! emits one typed message per complete packet and leaves partial packets
//! for the next read. What a payload means depends on where the exchange
//! stands, so the decoder runs a small state machine:
//!
//! ```text
//! CONNECTING -> RESPONSE -> FIELD -> FIELD_EOF -> ROW -> RESPONSE
//! ```

use adbcj_core::{DbError, Field, Result, SqlType, Value};
use log::trace;

use super::messages::{
    EofContext, EofResponse, ErrorResponse, MysqlField, OkResponse, ServerGreeting, ServerMessage,
};
use super::reader::{LengthEncoded, PacketReader};
use super::{MysqlCharset, PacketHeader};

const RESPONSE_OK: u8 = 0x00;
const RESPONSE_EOF: u8 = 0xFE;
const RESPONSE_ERROR: u8 = 0xFF;

const SALT_PART1_SIZE: usize = 8;
const SALT_PART2_SIZE: usize = 12;
const GREETING_RESERVED_SIZE: usize = 13;
const SQL_STATE_LENGTH: usize = 5;

/// Column flag: the value is unsigned.
pub const UNSIGNED_FLAG: u16 = 0x0020;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Connecting,
    Response,
    Field,
    FieldEof,
    Row,
}

/// Accumulate-and-decode state machine for one session.
pub struct MessageDecoder {
    state: DecodeState,
    buffer: Vec<u8>,
    charset: MysqlCharset,
    fields_remaining: u64,
    fields: Vec<MysqlField>,
}

impl MessageDecoder {
    pub fn new(charset: MysqlCharset) -> Self {
        Self {
            state: DecodeState::Connecting,
            buffer: Vec::new(),
            charset,
            fields_remaining: 0,
            fields: Vec::new(),
        }
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete packet, or `None` when more bytes are
    /// needed.
    pub fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        if self.buffer.len() < PacketHeader::SIZE {
            return Ok(None);
        }
        let mut header_bytes = [0u8; 4];
        header_bytes.copy_from_slice(&self.buffer[..4]);
        let header = PacketHeader::from_bytes(&header_bytes);
        let payload_len = header.payload_length as usize;
        let frame_len = PacketHeader::SIZE + payload_len;
        if self.buffer.len() < frame_len {
            // Await the rest of the packet.
            return Ok(None);
        }

        let payload: Vec<u8> = self.buffer[PacketHeader::SIZE..frame_len].to_vec();
        self.buffer.drain(..frame_len);

        trace!(
            "decoding packet {} ({} bytes) in state {:?}",
            header.packet_number,
            payload_len,
            self.state
        );

        let message = match self.state {
            DecodeState::Connecting => {
                let greeting = self.decode_greeting(&payload)?;
                self.state = DecodeState::Response;
                ServerMessage::Greeting(greeting)
            }
            DecodeState::Response => self.decode_response(&payload)?,
            DecodeState::Field => {
                let field = self.decode_field(&payload)?;
                self.fields_remaining -= 1;
                if self.fields_remaining == 0 {
                    self.state = DecodeState::FieldEof;
                }
                ServerMessage::FieldDefinition(field)
            }
            DecodeState::FieldEof => {
                let eof = decode_eof(&payload, EofContext::Field)?;
                self.state = DecodeState::Row;
                ServerMessage::Eof(eof)
            }
            DecodeState::Row => {
                if payload.first() == Some(&RESPONSE_EOF) && payload.len() < 9 {
                    let eof = decode_eof(&payload, EofContext::Row)?;
                    self.state = DecodeState::Response;
                    ServerMessage::Eof(eof)
                } else {
                    ServerMessage::Row(self.decode_row(&payload)?)
                }
            }
        };
        Ok(Some(message))
    }

    fn decode_greeting(&self, payload: &[u8]) -> Result<ServerGreeting> {
        let mut reader = PacketReader::new(payload);
        let protocol = need(reader.read_u8(), "greeting protocol")?;
        let version_bytes = need(reader.read_null_terminated(), "greeting version")?;
        let version = String::from_utf8_lossy(version_bytes).into_owned();
        let thread_id = need(reader.read_u32_le(), "greeting thread id")?;

        let mut salt = [0u8; SALT_PART1_SIZE + SALT_PART2_SIZE];
        let part1 = need(reader.read_bytes(SALT_PART1_SIZE), "greeting salt")?;
        salt[..SALT_PART1_SIZE].copy_from_slice(part1);
        reader.skip(1);

        let server_capabilities = need(reader.read_u16_le(), "greeting capabilities")?;
        let charset_id = need(reader.read_u8(), "greeting charset")?;
        let server_status = need(reader.read_u16_le(), "greeting status")?;
        if !reader.skip(GREETING_RESERVED_SIZE) {
            return Err(DbError::protocol("truncated greeting"));
        }
        let part2 = need(reader.read_bytes(SALT_PART2_SIZE), "greeting salt")?;
        salt[SALT_PART1_SIZE..].copy_from_slice(part2);
        reader.skip(1);

        Ok(ServerGreeting {
            protocol,
            version,
            thread_id,
            salt,
            server_capabilities,
            charset_id,
            server_status,
        })
    }

    fn decode_response(&mut self, payload: &[u8]) -> Result<ServerMessage> {
        match payload.first().copied() {
            Some(RESPONSE_OK) => {
                let mut reader = PacketReader::new(payload);
                reader.skip(1);
                let affected_rows = need(reader.read_lenenc_int(), "ok affected rows")?;
                let insert_id = if affected_rows > 0 {
                    need(reader.read_lenenc_int(), "ok insert id")?
                } else {
                    0
                };
                let server_status = need(reader.read_u16_le(), "ok status")?;
                let warning_count = need(reader.read_u16_le(), "ok warnings")?;
                let message = self.charset.decode(reader.read_rest());
                Ok(ServerMessage::Ok(OkResponse {
                    affected_rows,
                    insert_id,
                    server_status,
                    warning_count,
                    message,
                }))
            }
            Some(RESPONSE_ERROR) => {
                let mut reader = PacketReader::new(payload);
                reader.skip(1);
                let error_number = need(reader.read_u16_le(), "error number")?;
                reader.skip(1); // SQL-state marker
                let state_bytes = need(reader.read_bytes(SQL_STATE_LENGTH), "sql state")?;
                let sql_state = String::from_utf8_lossy(state_bytes).into_owned();
                let message = self.charset.decode(reader.read_rest());
                Ok(ServerMessage::Error(ErrorResponse {
                    error_number,
                    sql_state,
                    message,
                }))
            }
            Some(RESPONSE_EOF) => Err(DbError::protocol(
                "did not expect an EOF response from the server",
            )),
            Some(_) => {
                // Result set header: the field count.
                let mut reader = PacketReader::new(payload);
                let field_count = need(reader.read_lenenc_int(), "field count")?;
                if field_count == 0 {
                    return Err(DbError::protocol("result set with zero fields"));
                }
                // Optional 'extra' value; nothing uses it.
                if !reader.is_empty() {
                    let _ = reader.read_lenenc();
                }
                self.state = DecodeState::Field;
                self.fields_remaining = field_count;
                self.fields.clear();
                Ok(ServerMessage::ResultSetHeader { field_count })
            }
            None => Err(DbError::protocol("empty response packet")),
        }
    }

    fn decode_field(&mut self, payload: &[u8]) -> Result<MysqlField> {
        let mut reader = PacketReader::new(payload);
        let catalog = self.read_lenenc_string(&mut reader, "field catalog")?;
        let schema = self.read_lenenc_string(&mut reader, "field schema")?;
        let table_label = self.read_lenenc_string(&mut reader, "field table label")?;
        let table = self.read_lenenc_string(&mut reader, "field table")?;
        let column_label = self.read_lenenc_string(&mut reader, "field label")?;
        let column_name = self.read_lenenc_string(&mut reader, "field name")?;
        // Length of the fixed-size block that follows.
        need(reader.read_lenenc_int(), "field fixed-block length")?;
        let charset_id = need(reader.read_u16_le(), "field charset")?;
        let length = need(reader.read_u32_le(), "field length")?;
        let type_id = need(reader.read_u8(), "field type")?;
        let flags = need(reader.read_u16_le(), "field flags")?;
        let decimals = need(reader.read_u8(), "field decimals")?;
        reader.skip(2);
        // A default value may trail; it is not part of the descriptor.

        let column_type = map_column_type(type_id, flags)?;
        let index = self.fields.len();
        let field = MysqlField {
            field: Field::new(index, column_label, column_type),
            catalog,
            schema,
            table_label,
            table,
            column_name,
            charset_id,
            length,
            type_id,
            flags,
            decimals,
        };
        self.fields.push(field.clone());
        Ok(field)
    }

    fn decode_row(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let mut reader = PacketReader::new(payload);
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match need(reader.read_lenenc(), "row value length")? {
                LengthEncoded::Null => Value::Null,
                LengthEncoded::Value(len) => {
                    let bytes = need(reader.read_bytes(len as usize), "row value")?;
                    let text = self.charset.decode(bytes);
                    narrow_value(field.field.column_type, &text)?
                }
            };
            values.push(value);
        }
        if !reader.is_empty() {
            return Err(DbError::protocol(format!(
                "{} bytes left over after decoding row",
                reader.remaining()
            )));
        }
        Ok(values)
    }

    fn read_lenenc_string(&self, reader: &mut PacketReader<'_>, what: &str) -> Result<String> {
        let bytes = need(reader.read_lenenc_bytes(), what)?;
        Ok(self.charset.decode(bytes))
    }
}

fn decode_eof(payload: &[u8], context: EofContext) -> Result<EofResponse> {
    let mut reader = PacketReader::new(payload);
    let marker = need(reader.read_u8(), "eof marker")?;
    if marker != RESPONSE_EOF {
        return Err(DbError::protocol("expected an EOF response from the server"));
    }
    let warnings = need(reader.read_u16_le(), "eof warnings")?;
    let server_status = need(reader.read_u16_le(), "eof status")?;
    Ok(EofResponse {
        warnings,
        server_status,
        context,
    })
}

fn need<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| DbError::protocol(format!("malformed packet: missing {}", what)))
}

/// Map a wire type id (plus its flags) into the catalog.
fn map_column_type(type_id: u8, flags: u16) -> Result<SqlType> {
    let unsigned = flags & UNSIGNED_FLAG != 0;
    let column_type = match type_id {
        0x00 | 0xF6 => SqlType::Decimal,
        0x01 => {
            if unsigned {
                SqlType::Byte
            } else {
                SqlType::TinyInteger
            }
        }
        0x02 => SqlType::SmallInteger,
        0x03 => {
            if unsigned {
                SqlType::UnsignedInteger
            } else {
                SqlType::Integer
            }
        }
        0x04 => SqlType::Float,
        0x05 => SqlType::Double,
        0x08 => {
            if unsigned {
                SqlType::BigUnsignedInteger
            } else {
                SqlType::BigInteger
            }
        }
        0x09 => {
            if unsigned {
                SqlType::MediumUnsignedInteger
            } else {
                SqlType::MediumInteger
            }
        }
        0x0A | 0x0E => SqlType::Date,
        0x0F | 0xFD => SqlType::Varchar,
        0xFE => SqlType::Char,
        other => {
            return Err(DbError::protocol(format!(
                "unsupported column type id 0x{:02x}",
                other
            )));
        }
    };
    Ok(column_type)
}

/// Narrow a text-form wire value to the column's catalog type.
fn narrow_value(column_type: SqlType, text: &str) -> Result<Value> {
    let bad = |what: &str| {
        DbError::protocol(format!("cannot parse '{}' as {}", text, what))
    };
    let value = match column_type {
        SqlType::TinyInteger => Value::TinyInt(text.parse().map_err(|_| bad("TINYINT"))?),
        SqlType::Byte => {
            let v: u8 = text.parse().map_err(|_| bad("unsigned TINYINT"))?;
            Value::SmallInt(i16::from(v))
        }
        SqlType::SmallInteger | SqlType::Short => {
            Value::SmallInt(text.parse().map_err(|_| bad("SMALLINT"))?)
        }
        SqlType::MediumInteger | SqlType::Integer => {
            Value::Int(text.parse().map_err(|_| bad("INTEGER"))?)
        }
        SqlType::MediumUnsignedInteger | SqlType::UnsignedInteger => {
            let v: u32 = text.parse().map_err(|_| bad("unsigned INTEGER"))?;
            Value::BigInt(i64::from(v))
        }
        SqlType::BigInteger => Value::BigInt(text.parse().map_err(|_| bad("BIGINT"))?),
        SqlType::BigUnsignedInteger => {
            Value::UnsignedBigInt(text.parse().map_err(|_| bad("unsigned BIGINT"))?)
        }
        SqlType::Float | SqlType::Real => Value::Float(text.parse().map_err(|_| bad("FLOAT"))?),
        SqlType::Double => Value::Double(text.parse().map_err(|_| bad("DOUBLE"))?),
        SqlType::Decimal | SqlType::Numeric => Value::Decimal(text.to_string()),
        SqlType::Char | SqlType::Varchar => Value::Text(text.to_string()),
        SqlType::Date => Value::Date(text.to_string()),
        SqlType::Boolean => Value::Bool(text != "0"),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(number: u8, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            payload_length: payload.len() as u32,
            packet_number: number,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn greeting_payload() -> Vec<u8> {
        let mut p = Vec::new();
        p.push(10); // protocol
        p.extend_from_slice(b"5.1.23\0");
        p.extend_from_slice(&77u32.to_le_bytes()); // thread id
        p.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // salt part 1
        p.push(0);
        p.extend_from_slice(&0xA28Du16.to_le_bytes()); // capabilities
        p.push(33); // charset
        p.extend_from_slice(&2u16.to_le_bytes()); // status
        p.extend_from_slice(&[0u8; 13]); // reserved
        p.extend_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]); // salt part 2
        p.push(0);
        p
    }

    fn lenenc_str(s: &str) -> Vec<u8> {
        let mut v = vec![s.len() as u8];
        v.extend_from_slice(s.as_bytes());
        v
    }

    fn field_payload(name: &str, type_id: u8, flags: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&lenenc_str("def"));
        p.extend_from_slice(&lenenc_str("test"));
        p.extend_from_slice(&lenenc_str("t"));
        p.extend_from_slice(&lenenc_str("t"));
        p.extend_from_slice(&lenenc_str(name));
        p.extend_from_slice(&lenenc_str(name));
        p.push(0x0C); // fixed block length
        p.extend_from_slice(&33u16.to_le_bytes()); // charset
        p.extend_from_slice(&11u32.to_le_bytes()); // display length
        p.push(type_id);
        p.extend_from_slice(&flags.to_le_bytes());
        p.push(0); // decimals
        p.extend_from_slice(&[0, 0]); // filler
        p
    }

    fn decoder_past_handshake() -> MessageDecoder {
        let mut decoder = MessageDecoder::new(MysqlCharset::Utf8);
        decoder.feed(&packet(0, &greeting_payload()));
        decoder.next_message().unwrap().unwrap();
        decoder
    }

    #[test]
    fn test_decode_greeting() {
        let mut decoder = MessageDecoder::new(MysqlCharset::Utf8);
        decoder.feed(&packet(0, &greeting_payload()));
        let msg = decoder.next_message().unwrap().unwrap();
        let ServerMessage::Greeting(g) = msg else {
            panic!("expected greeting");
        };
        assert_eq!(g.protocol, 10);
        assert_eq!(g.version, "5.1.23");
        assert_eq!(g.thread_id, 77);
        assert_eq!(g.salt[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(g.salt[8..], [9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20]);
        assert_eq!(g.charset_id, 33);
    }

    #[test]
    fn test_partial_packet_waits_for_more_bytes() {
        let mut decoder = MessageDecoder::new(MysqlCharset::Utf8);
        let full = packet(0, &greeting_payload());
        decoder.feed(&full[..3]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.feed(&full[3..10]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.feed(&full[10..]);
        assert!(matches!(
            decoder.next_message().unwrap(),
            Some(ServerMessage::Greeting(_))
        ));
    }

    #[test]
    fn test_decode_ok_with_affected_rows() {
        let mut decoder = decoder_past_handshake();
        // affected=1, insert id=42, status=2, warnings=0, message "done"
        let mut payload = vec![0x00, 0x01, 0x2A];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(b"done");
        decoder.feed(&packet(1, &payload));
        let ServerMessage::Ok(ok) = decoder.next_message().unwrap().unwrap() else {
            panic!("expected ok");
        };
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.insert_id, 42);
        assert_eq!(ok.server_status, 2);
        assert_eq!(ok.message, "done");
    }

    #[test]
    fn test_decode_ok_zero_rows_has_no_insert_id() {
        let mut decoder = decoder_past_handshake();
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        decoder.feed(&packet(1, &payload));
        let ServerMessage::Ok(ok) = decoder.next_message().unwrap().unwrap() else {
            panic!("expected ok");
        };
        assert_eq!(ok.affected_rows, 0);
        assert_eq!(ok.insert_id, 0);
        assert_eq!(ok.server_status, 2);
    }

    #[test]
    fn test_decode_error_response() {
        let mut decoder = decoder_past_handshake();
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1045u16.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied");
        decoder.feed(&packet(1, &payload));
        let ServerMessage::Error(err) = decoder.next_message().unwrap().unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.error_number, 1045);
        assert_eq!(err.sql_state, "28000");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn test_select_round_trip() {
        let mut decoder = decoder_past_handshake();
        // SELECT 1: header(1 field), field "1" INTEGER, EOF, row "1", EOF
        decoder.feed(&packet(1, &[0x01]));
        decoder.feed(&packet(2, &field_payload("1", 0x03, 0)));
        decoder.feed(&packet(3, &[0xFE, 0, 0, 2, 0]));
        let mut row = lenenc_str("1");
        decoder.feed(&packet(4, &row));
        row = vec![0xFE, 0, 0, 2, 0];
        decoder.feed(&packet(5, &row));

        assert!(matches!(
            decoder.next_message().unwrap(),
            Some(ServerMessage::ResultSetHeader { field_count: 1 })
        ));
        let ServerMessage::FieldDefinition(field) = decoder.next_message().unwrap().unwrap()
        else {
            panic!("expected field");
        };
        assert_eq!(field.field.name, "1");
        assert_eq!(field.field.column_type, SqlType::Integer);
        assert!(matches!(
            decoder.next_message().unwrap(),
            Some(ServerMessage::Eof(EofResponse {
                context: EofContext::Field,
                ..
            }))
        ));
        let ServerMessage::Row(values) = decoder.next_message().unwrap().unwrap() else {
            panic!("expected row");
        };
        assert_eq!(values, vec![Value::Int(1)]);
        assert!(matches!(
            decoder.next_message().unwrap(),
            Some(ServerMessage::Eof(EofResponse {
                context: EofContext::Row,
                ..
            }))
        ));
        // Back in RESPONSE state: an OK decodes cleanly.
        let mut payload = vec![0x00, 0x00];
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        decoder.feed(&packet(1, &payload));
        assert!(matches!(
            decoder.next_message().unwrap(),
            Some(ServerMessage::Ok(_))
        ));
    }

    #[test]
    fn test_row_with_null_and_text() {
        let mut decoder = decoder_past_handshake();
        decoder.feed(&packet(1, &[0x02]));
        decoder.feed(&packet(2, &field_payload("id", 0x08, 0)));
        decoder.feed(&packet(3, &field_payload("name", 0xFD, 0)));
        decoder.feed(&packet(4, &[0xFE, 0, 0, 2, 0]));
        let mut row = vec![0xFB]; // NULL id
        row.extend_from_slice(&lenenc_str("ada"));
        decoder.feed(&packet(5, &row));

        decoder.next_message().unwrap(); // header
        decoder.next_message().unwrap(); // id
        decoder.next_message().unwrap(); // name
        decoder.next_message().unwrap(); // eof
        let ServerMessage::Row(values) = decoder.next_message().unwrap().unwrap() else {
            panic!("expected row");
        };
        assert_eq!(values, vec![Value::Null, Value::Text("ada".to_string())]);
    }

    #[test]
    fn test_row_narrowing_covers_catalog() {
        assert_eq!(
            narrow_value(SqlType::TinyInteger, "-5").unwrap(),
            Value::TinyInt(-5)
        );
        assert_eq!(
            narrow_value(SqlType::SmallInteger, "1000").unwrap(),
            Value::SmallInt(1000)
        );
        assert_eq!(
            narrow_value(SqlType::BigInteger, "-9000000000").unwrap(),
            Value::BigInt(-9_000_000_000)
        );
        assert_eq!(
            narrow_value(SqlType::BigUnsignedInteger, "18446744073709551615").unwrap(),
            Value::UnsignedBigInt(u64::MAX)
        );
        assert_eq!(
            narrow_value(SqlType::Decimal, "12.50").unwrap(),
            Value::Decimal("12.50".to_string())
        );
        assert_eq!(
            narrow_value(SqlType::Double, "2.5").unwrap(),
            Value::Double(2.5)
        );
        assert_eq!(
            narrow_value(SqlType::Date, "2008-01-02").unwrap(),
            Value::Date("2008-01-02".to_string())
        );
        assert!(narrow_value(SqlType::Integer, "abc").is_err());
    }

    #[test]
    fn test_unsupported_column_type_fails_loudly() {
        assert!(map_column_type(0x10, 0).is_err()); // BIT
        assert!(map_column_type(0xFC, 0).is_err()); // BLOB
    }

    #[test]
    fn test_unsigned_flag_selects_unsigned_types() {
        assert_eq!(map_column_type(0x03, 0).unwrap(), SqlType::Integer);
        assert_eq!(
            map_column_type(0x03, UNSIGNED_FLAG).unwrap(),
            SqlType::UnsignedInteger
        );
        assert_eq!(
            map_column_type(0x08, UNSIGNED_FLAG).unwrap(),
            SqlType::BigUnsignedInteger
        );
    }

    #[test]
    fn test_eof_in_response_state_is_protocol_error() {
        let mut decoder = decoder_past_handshake();
        decoder.feed(&packet(1, &[0xFE, 0, 0, 2, 0]));
        assert!(decoder.next_message().is_err());
    }
}
