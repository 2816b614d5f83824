//! Connection URL parsing.
//!
//! URLs take the form `adbcj:<protocol>://host:port/database`, where
//! `<protocol>` selects the backend. The port is optional; backends apply
//! their own defaults.

use crate::error::{DbError, Result};

pub const URL_SCHEME: &str = "adbcj";

/// A parsed connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUrl {
    /// Backend protocol name (`mysql`, `postgres`, ...)
    pub protocol: String,
    pub host: String,
    /// Port, when the URL names one
    pub port: Option<u16>,
    pub database: String,
}

impl ConnectUrl {
    /// Parse an `adbcj:<protocol>://host:port/database` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let rest = url
            .strip_prefix(URL_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| {
                DbError::Config(format!("URL must start with '{}:': {}", URL_SCHEME, url))
            })?;

        let (protocol, rest) = rest
            .split_once("://")
            .ok_or_else(|| DbError::Config(format!("missing '://' in URL: {}", url)))?;
        if protocol.is_empty() {
            return Err(DbError::Config(format!("missing protocol in URL: {}", url)));
        }

        let (authority, database) = rest
            .split_once('/')
            .ok_or_else(|| DbError::Config(format!("missing database in URL: {}", url)))?;
        if database.is_empty() {
            return Err(DbError::Config(format!("missing database in URL: {}", url)));
        }

        let (host, port) = split_host_port(authority, url)?;
        if host.is_empty() {
            return Err(DbError::Config(format!("missing host in URL: {}", url)));
        }

        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            database: database.to_string(),
        })
    }

    /// Port to use, falling back to the supplied backend default.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }
}

fn split_host_port<'a>(authority: &'a str, url: &str) -> Result<(&'a str, Option<u16>)> {
    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| DbError::Config(format!("unterminated IPv6 literal in URL: {}", url)))?;
        let host = &rest[..end];
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Ok((host, None));
        }
        let port = after
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| DbError::Config(format!("invalid port in URL: {}", url)))?;
        return Ok((host, Some(port)));
    }

    match authority.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| DbError::Config(format!("invalid port in URL: {}", url)))?;
            Ok((host, Some(port)))
        }
        None => Ok((authority, None)),
    }
}
