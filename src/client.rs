use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, DEFAULT_PRI, PutOptions};
use crate::errors::Result;
use crate::types::job::Job;

/// A cloneable handle to one server connection.
///
/// The connection sits behind a mutex so `Job`s can call back into the
/// connection that produced them. The protocol is strict request/response,
/// so the lock simply serialises callers; it never blocks mid-exchange.
#[derive(Clone)]
pub struct Client {
    addr: String,
    conn: Arc<Mutex<Connection>>,
}

impl Client {
    /// Opens a TCP connection to `addr` (a `host:port` string).
    pub async fn connect(addr: &str) -> Result<Self> {
        Ok(Self::from_connection(Connection::dial(addr).await?))
    }

    /// Wraps an existing connection, usually one over a test stream.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            addr: conn.addr().to_owned(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn is_open(&self) -> bool {
        self.conn.lock().await.is_open()
    }

    pub async fn close(&self) -> Result<()> {
        self.conn.lock().await.close().await
    }

    /// Enqueues a job into the currently-used tube, returning its ID.
    pub async fn put(
        &self,
        body: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<u64> {
        self.conn.lock().await.put(body, opts).await
    }

    /// Serialises `value` through the codec and puts the result.
    pub async fn put_encoded<S: Serialize>(
        &self,
        value: &S,
        opts: PutOptions,
    ) -> Result<u64> {
        self.conn.lock().await.put_encoded(value, opts).await
    }

    /// Blocks until a watched tube yields a job.
    pub async fn reserve(&self) -> Result<Job> {
        let (id, body) = self.conn.lock().await.reserve(None).await?;
        Ok(Job::new(self.clone(), id, DEFAULT_PRI, body))
    }

    /// As `reserve`, abandoning the wait when `cancel` fires. Abandonment
    /// closes the connection: the in-flight reply can't be matched to
    /// anything once its requestor has gone.
    pub async fn reserve_with(&self, cancel: &CancellationToken) -> Result<Job> {
        let (id, body) =
            self.conn.lock().await.reserve(Some(cancel)).await?;
        Ok(Job::new(self.clone(), id, DEFAULT_PRI, body))
    }

    /// Peeks the next ready job on the currently-used tube, or `None`.
    pub async fn peek(&self) -> Result<Option<Job>> {
        let found = self.conn.lock().await.peek().await?;
        Ok(found
            .map(|(id, body)| Job::new(self.clone(), id, DEFAULT_PRI, body)))
    }

    /// Peeks one job by ID, or `None` if this server doesn't know it.
    pub async fn peek_job(&self, id: u64) -> Result<Option<Job>> {
        let found = self.conn.lock().await.peek_job(id).await?;
        Ok(found
            .map(|(id, body)| Job::new(self.clone(), id, DEFAULT_PRI, body)))
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        self.conn.lock().await.delete(id).await
    }

    pub async fn release(&self, id: u64, pri: u32, delay: u32) -> Result<()> {
        self.conn.lock().await.release(id, pri, delay).await
    }

    pub async fn bury(&self, id: u64, pri: u32) -> Result<()> {
        self.conn.lock().await.bury(id, pri).await
    }

    pub async fn use_tube(&self, tube: &str) -> Result<String> {
        self.conn.lock().await.use_tube(tube).await
    }

    pub async fn watch(&self, tube: &str) -> Result<u32> {
        self.conn.lock().await.watch(tube).await
    }

    pub async fn ignore(&self, tube: &str) -> Result<u32> {
        self.conn.lock().await.ignore(tube).await
    }

    pub async fn stats(&self) -> Result<serde_yaml::Mapping> {
        self.conn.lock().await.stats().await
    }

    pub async fn job_stats(&self, id: u64) -> Result<serde_yaml::Mapping> {
        self.conn.lock().await.job_stats(id).await
    }

    pub async fn tube_stats(&self, tube: &str) -> Result<serde_yaml::Mapping> {
        self.conn.lock().await.tube_stats(tube).await
    }

    pub async fn list_tubes(&self) -> Result<Vec<String>> {
        self.conn.lock().await.list_tubes().await
    }

    pub async fn list_tube_used(&self) -> Result<String> {
        self.conn.lock().await.list_tube_used().await
    }

    pub async fn list_tubes_watched(&self, cached: bool) -> Result<Vec<String>> {
        self.conn.lock().await.list_tubes_watched(cached).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client").field("addr", &self.addr).finish()
    }
}
