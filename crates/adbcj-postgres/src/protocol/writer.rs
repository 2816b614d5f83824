//! Encoder for outbound PostgreSQL frontend messages.

#![allow(clippy::cast_possible_truncation)]

use super::messages::FrontendMessage;
use super::{frontend_type, PROTOCOL_VERSION};

/// Buffer for writing frontend messages.
///
/// All multi-byte integers are big-endian. Messages append, so the frames
/// of one operation (Parse|Bind|Describe|Execute|Sync) can be batched into
/// a single transport write.
#[derive(Debug, Clone, Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(1024),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Take the accumulated bytes, leaving an empty buffer behind.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Append one frontend message.
    pub fn write(&mut self, msg: &FrontendMessage) -> &mut Self {
        match msg {
            FrontendMessage::Startup { params } => self.write_startup(params),
            FrontendMessage::Password(password) => {
                self.write_simple_string_message(frontend_type::PASSWORD, password);
            }
            FrontendMessage::Parse { name, query } => self.write_parse(name, query),
            FrontendMessage::Bind { portal, statement } => self.write_bind(portal, statement),
            FrontendMessage::DescribePortal(name) => self.write_describe_portal(name),
            FrontendMessage::Execute { portal, max_rows } => {
                self.write_execute(portal, *max_rows);
            }
            FrontendMessage::Sync => self.write_empty_message(frontend_type::SYNC),
            FrontendMessage::Terminate => self.write_empty_message(frontend_type::TERMINATE),
        }
        self
    }

    // ==================== Message Encoders ====================

    /// Startup message (no type byte).
    fn write_startup(&mut self, params: &[(String, String)]) {
        let mut body_len = 4; // version
        for (key, value) in params {
            body_len += key.len() + 1 + value.len() + 1;
        }
        body_len += 1; // terminating null

        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        for (key, value) in params {
            self.buf.extend_from_slice(key.as_bytes());
            self.buf.push(0);
            self.buf.extend_from_slice(value.as_bytes());
            self.buf.push(0);
        }
        self.buf.push(0);
    }

    fn write_parse(&mut self, name: &str, query: &str) {
        self.buf.push(frontend_type::PARSE);
        // name + query (both NUL-terminated) + zero parameter types.
        let body_len = name.len() + 1 + query.len() + 1 + 2;
        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(query.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(&0i16.to_be_bytes());
    }

    /// Bind with no parameters, text result format.
    fn write_bind(&mut self, portal: &str, statement: &str) {
        self.buf.push(frontend_type::BIND);
        // portal + statement + zero format codes, parameters and result
        // format codes.
        let body_len = portal.len() + 1 + statement.len() + 1 + 2 + 2 + 2;
        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.extend_from_slice(portal.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(statement.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(&0i16.to_be_bytes());
        self.buf.extend_from_slice(&0i16.to_be_bytes());
        self.buf.extend_from_slice(&0i16.to_be_bytes());
    }

    fn write_describe_portal(&mut self, name: &str) {
        self.buf.push(frontend_type::DESCRIBE);
        let body_len = 1 + name.len() + 1;
        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.push(b'P');
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
    }

    fn write_execute(&mut self, portal: &str, max_rows: i32) {
        self.buf.push(frontend_type::EXECUTE);
        let body_len = portal.len() + 1 + 4;
        let total_len = (body_len + 4) as i32;
        self.buf.extend_from_slice(&total_len.to_be_bytes());
        self.buf.extend_from_slice(portal.as_bytes());
        self.buf.push(0);
        self.buf.extend_from_slice(&max_rows.to_be_bytes());
    }

    // ==================== Helper Methods ====================

    fn write_empty_message(&mut self, type_byte: u8) {
        self.buf.push(type_byte);
        self.buf.extend_from_slice(&4i32.to_be_bytes());
    }

    fn write_simple_string_message(&mut self, type_byte: u8, s: &str) {
        self.buf.push(type_byte);
        let len = (s.len() + 5) as i32;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &FrontendMessage) -> Vec<u8> {
        let mut writer = MessageWriter::new();
        writer.write(msg);
        writer.take()
    }

    #[test]
    fn test_startup_message() {
        let data = encode(&FrontendMessage::Startup {
            params: vec![
                ("user".to_string(), "postgres".to_string()),
                ("database".to_string(), "test".to_string()),
            ],
        });
        let len = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(len as usize, data.len());
        let version = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
        assert!(data.ends_with(&[0]));
        let body = &data[8..];
        assert!(body
            .windows(b"user\0postgres\0".len())
            .any(|w| w == b"user\0postgres\0"));
    }

    #[test]
    fn test_password_message() {
        let data = encode(&FrontendMessage::Password("md5abc".to_string()));
        assert_eq!(data[0], b'p');
        let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        assert_eq!(len, 4 + 6 + 1);
        assert_eq!(&data[5..11], b"md5abc");
        assert_eq!(data[11], 0);
    }

    #[test]
    fn test_sync_and_terminate() {
        assert_eq!(encode(&FrontendMessage::Sync), vec![b'S', 0, 0, 0, 4]);
        assert_eq!(encode(&FrontendMessage::Terminate), vec![b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn test_parse_message() {
        let data = encode(&FrontendMessage::Parse {
            name: "S_1".to_string(),
            query: "BEGIN".to_string(),
        });
        assert_eq!(data[0], b'P');
        assert_eq!(&data[5..9], b"S_1\0");
        assert_eq!(&data[9..15], b"BEGIN\0");
        // Zero parameter types.
        assert_eq!(&data[15..], &[0, 0]);
    }

    #[test]
    fn test_bind_default_portal() {
        let data = encode(&FrontendMessage::Bind {
            portal: String::new(),
            statement: String::new(),
        });
        assert_eq!(data[0], b'B');
        let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        assert_eq!(len as usize, data.len() - 1);
        // Empty portal, empty statement, three zero counts.
        assert_eq!(&data[5..], &[0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_describe_portal() {
        let data = encode(&FrontendMessage::DescribePortal(String::new()));
        assert_eq!(data[0], b'D');
        assert_eq!(data[5], b'P');
        assert_eq!(data[6], 0);
    }

    #[test]
    fn test_execute_default() {
        let data = encode(&FrontendMessage::Execute {
            portal: String::new(),
            max_rows: 0,
        });
        assert_eq!(data[0], b'E');
        assert_eq!(&data[6..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_batched_frames_accumulate() {
        let mut writer = MessageWriter::new();
        writer
            .write(&FrontendMessage::Parse {
                name: String::new(),
                query: "SELECT 1".to_string(),
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
        let data = writer.take();
        assert_eq!(data[0], b'P');
        assert_eq!(*data.last().unwrap(), 4);
        // The batch holds all five frames.
        let tags: Vec<u8> = {
            let mut tags = Vec::new();
            let mut pos = 0;
            while pos < data.len() {
                tags.push(data[pos]);
                let len = i32::from_be_bytes([
                    data[pos + 1],
                    data[pos + 2],
                    data[pos + 3],
                    data[pos + 4],
                ]) as usize;
                pos += 1 + len;
            }
            tags
        };
        assert_eq!(tags, vec![b'P', b'B', b'D', b'E', b'S']);
    }
}
