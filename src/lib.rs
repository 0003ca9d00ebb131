//! # qail-mysqlclient
//!
//! A small blocking MySQL client: connect, run statements, read buffered
//! results, escape literals.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use qail_mysqlclient::prelude::*;
//!
//! let params = ConnectionParams::builder()
//!     .host("127.0.0.1")
//!     .port(3306)
//!     .user("app")
//!     .password("secret")
//!     .database("shop")
//!     .build()?;
//!
//! let mut conn = new_connection(&params)?;
//! let name = conn.escape("O'Brien")?;
//! let mut rs = conn.execute(
//!     [&b"SELECT id FROM customers WHERE name = '"[..], &name[..], &b"'"[..]].concat(),
//! )?;
//! for row in rs.rows() {
//!     println!("{:?}", row.get_i64(0));
//! }
//! ```
//!
//! Each connection drives its socket on its own single-threaded tokio
//! runtime, so no async runtime is needed by the caller.

pub mod auth;
pub mod charset;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod escape;
pub mod protocol;
pub mod result;
pub mod transport;

pub use charset::Charset;
pub use client::{Client, connect_url, new_connection};
pub use config::{ConnectionParams, ConnectionParamsBuilder, SslMode};
pub use connection::Connection;
pub use error::{ErrorKind, MySqlError, MySqlResult, TwoChannel};
pub use escape::{EscapeDialect, escape};
pub use result::{Field, ResultSet, Row, Rows};
pub use transport::{TcpTransport, Transport};

pub mod prelude {
    pub use crate::client::{Client, connect_url, new_connection};
    pub use crate::config::{ConnectionParams, SslMode};
    pub use crate::connection::Connection;
    pub use crate::error::*;
    pub use crate::result::{ResultSet, Row};
}
