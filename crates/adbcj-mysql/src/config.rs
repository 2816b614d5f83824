//! MySQL connection configuration.

use std::time::Duration;

use adbcj_core::ConnectUrl;

use crate::protocol::MysqlCharset;
use crate::DEFAULT_PORT;

/// Connection parameters for a MySQL endpoint.
#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Schema selected at login
    pub database: String,
    pub charset: MysqlCharset,
    pub connect_timeout: Duration,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            charset: MysqlCharset::Utf8,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl MysqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a parsed connection URL plus credentials.
    pub fn from_url(url: &ConnectUrl, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: url.host.clone(),
            port: url.port_or(DEFAULT_PORT),
            user: user.into(),
            password: password.into(),
            database: url.database.clone(),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn charset(mut self, charset: MysqlCharset) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` string for connecting.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
