//! PostgreSQL connection configuration.

use std::time::Duration;

use adbcj_core::ConnectUrl;

use crate::DEFAULT_PORT;

/// Connection parameters for a PostgreSQL endpoint.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
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

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `host:port` string for connecting.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parameters sent with the startup message.
    pub fn startup_params(&self) -> Vec<(String, String)> {
        vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
            ("client_encoding".to_string(), "UNICODE".to_string()),
            ("DateStyle".to_string(), "ISO".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = PgConfig::new()
            .host("pg.example.com")
            .port(5433)
            .user("app")
            .password("secret")
            .database("prod");
        assert_eq!(config.socket_addr(), "pg.example.com:5433");
        assert_eq!(config.database, "prod");
    }

    #[test]
    fn test_startup_params_include_encoding_and_date_style() {
        let config = PgConfig::new().user("u").database("d");
        let params = config.startup_params();
        assert!(params.contains(&("user".to_string(), "u".to_string())));
        assert!(params.contains(&("database".to_string(), "d".to_string())));
        assert!(params.contains(&("client_encoding".to_string(), "UNICODE".to_string())));
        assert!(params.contains(&("DateStyle".to_string(), "ISO".to_string())));
    }

    #[test]
    fn test_from_url_applies_default_port() {
        let url = ConnectUrl::parse("adbcj:postgres://pghost/app").unwrap();
        let config = PgConfig::from_url(&url, "u", "p");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.host, "pghost");
        assert_eq!(config.database, "app");
    }
}
