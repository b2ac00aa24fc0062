//! An asynchronous client for beanstalkd-compatible work queues, with
//! optional pooling across several independent servers.

pub mod client;
pub mod connection;
pub mod errors;
pub mod line_reader;
pub mod parser;
pub mod pool;
pub mod types;
pub mod util;

pub use client::Client;
pub use connection::{
    Connection, PutOptions, Transport, DEFAULT_PRI, DEFAULT_TUBE,
};
pub use errors::{Error, Result};
pub use pool::Pool;
pub use types::job::{Job, DELAY_MAX};
