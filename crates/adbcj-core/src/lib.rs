//! Core of the adbcj asynchronous database client.
//!
//! This crate provides the protocol-neutral machinery the backend crates
//! build on:
//!
//! - [`DbFuture`]/[`DbSessionFuture`] — completion futures with listeners
//! - [`DbSession`] — the per-connection request pipeline with pipelining,
//!   transactions and deferred close
//! - [`ResultSet`]/[`Row`]/[`Value`] and the [`SqlType`] catalog
//! - the [`Transport`] abstraction and TCP implementation
//! - the public [`Connection`]/[`ConnectionManager`] traits and URL parsing

pub mod error;
pub mod field;
pub mod future;
pub mod manager;
pub mod result;
pub mod session;
pub mod transport;
pub mod types;
pub mod url;
pub mod value;

pub use error::{DbError, Result};
pub use field::Field;
pub use future::{DbFuture, DbListener, DbSessionFuture};
pub use manager::{Connection, ConnectionManager};
pub use result::{ColumnSet, ResultEventHandler, ResultSet, ResultSetHandler, Row, UpdateResult};
pub use session::{DbSession, ProtocolOps, Request, Transaction};
pub use transport::{InboundHandler, MemoryTransport, TcpTransport, Transport};
pub use types::{SqlType, TypeInfo};
pub use url::{ConnectUrl, URL_SCHEME};
pub use value::Value;
