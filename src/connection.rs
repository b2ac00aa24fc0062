use std::collections::BTreeSet;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::{classify_io, Error, Result};
use crate::line_reader::LineReader;
use crate::parser::is_valid_tube_name;
use crate::types::protocol::{Command, Reply};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

/// The tube every new connection uses and watches.
pub const DEFAULT_TUBE: &str = "default";

/// The server's mid-range priority; lower values are serviced first.
pub const DEFAULT_PRI: u32 = 65536;

/// Defaults applied to a put when the caller doesn't override them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PutOptions {
    /// Lower values are serviced first.
    pub pri: u32,
    /// Seconds the job spends delayed before becoming ready.
    pub delay: u32,
    /// Seconds a worker gets to run the job once reserved.
    pub ttr: u32,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            pri: DEFAULT_PRI,
            delay: 0,
            ttr: 120,
        }
    }
}

/// Byte streams a connection can run over: TCP in production, in-memory
/// duplex pairs in tests.
pub trait Transport:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin
{
}

impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Transport
    for T
{
}

/// One connection to one beanstalkd server, with its protocol session
/// state.
///
/// The protocol is strict request/response over a single stream, so every
/// operation here is one blocking round trip, and nothing may be sent while
/// a `reserve` is awaiting its reply. Any transport or framing fault is
/// fatal to the connection: it is marked closed and every later call fails
/// with `Error::NotConnected`.
pub struct Connection {
    addr: String,
    reader: LineReader<ReadHalf<Box<dyn Transport>>>,
    writer: WriteHalf<Box<dyn Transport>>,
    /// Tube new jobs are enqueued into. Cached so repeated `use` of the
    /// same tube skips the round trip.
    used_tube: String,
    /// Local mirror of the server-side watch list, kept in sync by `watch`
    /// and `ignore`.
    watching: BTreeSet<String>,
    /// Set strictly between sending a reserve and receiving its reply.
    reserve_pending: bool,
    open: bool,
}

impl Connection {
    /// Opens a TCP connection to `addr` (a `host:port` string).
    pub async fn dial(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        debug!(addr, "connected");

        Ok(Self::over(Box::new(stream), addr))
    }

    /// Wraps an already-open stream. `addr` is only used as an identity
    /// label.
    pub fn over(stream: Box<dyn Transport>, addr: &str) -> Self {
        let (r, w) = tokio::io::split(stream);

        Self {
            addr: addr.to_owned(),
            reader: r.into(),
            writer: w,
            used_tube: DEFAULT_TUBE.to_owned(),
            watching: BTreeSet::from([DEFAULT_TUBE.to_owned()]),
            reserve_pending: false,
            open: true,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The tube puts currently go to, per the local cache.
    pub fn used_tube(&self) -> &str {
        &self.used_tube
    }

    /// Shuts the stream down. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.writer.shutdown().await.map_err(classify_io)?;
        }

        Ok(())
    }

    /// Enqueues a job into the currently-used tube, returning its ID. A
    /// `BURIED <id>` answer still carries an ID and counts as success.
    pub async fn put(
        &mut self,
        body: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<u64> {
        let cmd = Command::Put {
            pri: opts.pri,
            delay: opts.delay,
            ttr: opts.ttr,
            body: body.into(),
        };

        match self.roundtrip(&cmd).await? {
            Reply::Inserted { id } | Reply::Buried { id: Some(id) } => Ok(id),
            other => Err(other.into_unexpected()),
        }
    }

    /// Serialises `value` through the codec and puts the result.
    pub async fn put_encoded<S: Serialize>(
        &mut self,
        value: &S,
        opts: PutOptions,
    ) -> Result<u64> {
        let body = serde_yaml::to_string(value)?;
        self.put(body.into_bytes(), opts).await
    }

    /// Blocks until a watched tube yields a job, returning its ID and body.
    ///
    /// If `cancel` is supplied and fires first, the pending reservation is
    /// abandoned: the guard clears, but the server's eventual reply can no
    /// longer be matched to anything, so the connection closes itself.
    pub async fn reserve(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(u64, Bytes)> {
        self.send(&Command::Reserve).await?;
        self.reserve_pending = true;

        let reply = match cancel {
            None => self.read_reply().await,
            Some(token) => {
                let mut cancelled = false;
                let r = tokio::select! {
                    r = self.read_reply() => r,
                    _ = token.cancelled() => {
                        cancelled = true;
                        Err(Error::ReserveCancelled)
                    },
                };

                if cancelled {
                    self.reserve_pending = false;
                    let _ = self.close().await;
                    return Err(Error::ReserveCancelled);
                }

                r
            },
        };

        self.reserve_pending = false;

        match reply? {
            Reply::Reserved { id, n_bytes } => {
                let body = self.read_payload(n_bytes).await?;
                Ok((id, body))
            },
            other => Err(other.into_unexpected()),
        }
    }

    /// Peeks the next ready job on the currently-used tube. `None` means
    /// the tube has no ready job - that's an answer, not an error.
    pub async fn peek(&mut self) -> Result<Option<(u64, Bytes)>> {
        self.peek_with(&Command::Peek).await
    }

    /// Peeks one job by ID. `None` means the server doesn't know it.
    pub async fn peek_job(&mut self, id: u64) -> Result<Option<(u64, Bytes)>> {
        self.peek_with(&Command::PeekJob { id }).await
    }

    async fn peek_with(
        &mut self,
        cmd: &Command,
    ) -> Result<Option<(u64, Bytes)>> {
        match self.roundtrip(cmd).await? {
            Reply::Found { id, n_bytes } => {
                let body = self.read_payload(n_bytes).await?;
                Ok(Some((id, body)))
            },
            Reply::NotFound => Ok(None),
            other => Err(other.into_unexpected()),
        }
    }

    pub async fn delete(&mut self, id: u64) -> Result<()> {
        match self.roundtrip(&Command::Delete { id }).await? {
            Reply::Deleted => Ok(()),
            other => Err(other.into_unexpected()),
        }
    }

    pub async fn release(
        &mut self,
        id: u64,
        pri: u32,
        delay: u32,
    ) -> Result<()> {
        match self.roundtrip(&Command::Release { id, pri, delay }).await? {
            Reply::Released => Ok(()),
            other => Err(other.into_unexpected()),
        }
    }

    pub async fn bury(&mut self, id: u64, pri: u32) -> Result<()> {
        match self.roundtrip(&Command::Bury { id, pri }).await? {
            Reply::Buried { id: None } => Ok(()),
            other => Err(other.into_unexpected()),
        }
    }

    /// Selects the tube subsequent puts go to. A no-op without wire
    /// traffic when `tube` is already in use.
    pub async fn use_tube(&mut self, tube: &str) -> Result<String> {
        if tube == self.used_tube {
            return Ok(self.used_tube.clone());
        }

        check_tube_name(tube)?;

        let cmd = Command::Use {
            tube: tube.to_owned(),
        };

        match self.roundtrip(&cmd).await? {
            Reply::Using { tube } => {
                self.used_tube = tube.clone();
                Ok(tube)
            },
            other => Err(other.into_unexpected()),
        }
    }

    /// Adds `tube` to the watch list, returning how many tubes are now
    /// watched. Already-watched tubes short-circuit without wire traffic.
    pub async fn watch(&mut self, tube: &str) -> Result<u32> {
        if self.watching.contains(tube) {
            return Ok(self.watching.len() as u32);
        }

        check_tube_name(tube)?;

        let cmd = Command::Watch {
            tube: tube.to_owned(),
        };

        match self.roundtrip(&cmd).await? {
            Reply::Watching { count } => {
                self.watching.insert(tube.to_owned());
                Ok(count)
            },
            other => Err(other.into_unexpected()),
        }
    }

    /// Reverses `watch`, with the same short-circuit for tubes not
    /// currently watched. Ignoring the last watched tube is sent to the
    /// server and refused there, not prevented locally.
    pub async fn ignore(&mut self, tube: &str) -> Result<u32> {
        if !self.watching.contains(tube) {
            return Ok(self.watching.len() as u32);
        }

        let cmd = Command::Ignore {
            tube: tube.to_owned(),
        };

        match self.roundtrip(&cmd).await? {
            Reply::Watching { count } => {
                self.watching.remove(tube);
                Ok(count)
            },
            other => Err(other.into_unexpected()),
        }
    }

    /// Server-wide statistics as a YAML mapping.
    pub async fn stats(&mut self) -> Result<serde_yaml::Mapping> {
        self.stats_doc(&Command::Stats).await
    }

    /// Statistics for one job.
    pub async fn job_stats(&mut self, id: u64) -> Result<serde_yaml::Mapping> {
        self.stats_doc(&Command::StatsJob { id }).await
    }

    /// Statistics for one tube.
    pub async fn tube_stats(
        &mut self,
        tube: &str,
    ) -> Result<serde_yaml::Mapping> {
        check_tube_name(tube)?;

        self.stats_doc(&Command::StatsTube {
            tube: tube.to_owned(),
        })
        .await
    }

    /// Every tube existing on the server.
    pub async fn list_tubes(&mut self) -> Result<Vec<String>> {
        self.tube_list(&Command::ListTubes).await
    }

    /// The tube puts currently go to, per the server.
    pub async fn list_tube_used(&mut self) -> Result<String> {
        match self.roundtrip(&Command::ListTubeUsed).await? {
            Reply::Using { tube } => Ok(tube),
            other => Err(other.into_unexpected()),
        }
    }

    /// The watch list. With `cached`, answers from the local mirror with no
    /// wire traffic; otherwise asks the server.
    pub async fn list_tubes_watched(
        &mut self,
        cached: bool,
    ) -> Result<Vec<String>> {
        if cached {
            return Ok(self.watching.iter().cloned().collect());
        }

        self.tube_list(&Command::ListTubesWatched).await
    }

    async fn stats_doc(&mut self, cmd: &Command) -> Result<serde_yaml::Mapping> {
        match self.roundtrip(cmd).await? {
            Reply::OkData { n_bytes } => {
                let doc = self.read_payload(n_bytes).await?;
                Ok(serde_yaml::from_slice(&doc)?)
            },
            other => Err(other.into_unexpected()),
        }
    }

    async fn tube_list(&mut self, cmd: &Command) -> Result<Vec<String>> {
        match self.roundtrip(cmd).await? {
            Reply::OkData { n_bytes } => {
                let doc = self.read_payload(n_bytes).await?;
                Ok(serde_yaml::from_slice(&doc)?)
            },
            other => Err(other.into_unexpected()),
        }
    }

    async fn roundtrip(&mut self, cmd: &Command) -> Result<Reply> {
        self.send(cmd).await?;
        self.read_reply().await
    }

    async fn send(&mut self, cmd: &Command) -> Result<()> {
        if !self.open {
            return Err(Error::NotConnected);
        }

        // A second command on the stream while a reservation is pending
        // would interleave two exchanges and corrupt framing.
        if self.reserve_pending {
            return Err(Error::ReservePending);
        }

        let wire = cmd.serialise_beanstalk();
        trace!(addr = %self.addr, line = bytes_to_human_str(&wire), "send");

        if let Err(e) = self.writer.write_all(&wire).await {
            self.open = false;
            return Err(classify_io(e));
        }

        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        match self.reader.read_line().await {
            Err(e) => {
                self.open = false;
                Err(classify_io(e))
            },
            Ok(None) => {
                self.open = false;
                Err(Error::Disconnected)
            },
            Ok(Some(line)) => match Reply::try_from(&line[..]) {
                Ok(reply) => Ok(reply),
                Err(_) => {
                    self.open = false;
                    Err(Error::BadReply(bytes_to_human_str(&line)))
                },
            },
        }
    }

    /// Reads a byte-counted payload block plus its CRLF trailer. Anything
    /// other than CRLF after the payload means the stream framing is lost.
    async fn read_payload(&mut self, n: usize) -> Result<Bytes> {
        let body = match self.reader.read_exact(n).await {
            Ok(b) => b,
            Err(e) => {
                self.open = false;
                return Err(classify_io(e));
            },
        };

        let trailer = match self.reader.read_exact(2).await {
            Ok(b) => b,
            Err(e) => {
                self.open = false;
                return Err(classify_io(e));
            },
        };

        if &trailer[..] != b"\r\n" {
            self.open = false;
            return Err(Error::BadTrailer);
        }

        Ok(body)
    }
}

fn check_tube_name(tube: &str) -> Result<()> {
    if is_valid_tube_name(tube) {
        Ok(())
    } else {
        Err(Error::BadTubeName(tube.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt};

    /// A connection whose peer asserts each expected request and answers
    /// with the scripted reply, in order. Any deviation desynchronises the
    /// script, which surfaces as a failed read in the test body.
    fn scripted(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Connection {
        let (local, mut remote) = duplex(4096);

        tokio::spawn(async move {
            for (expect, reply) in exchanges {
                let mut buf = vec![0u8; expect.len()];
                remote.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, expect);
                remote.write_all(&reply).await.unwrap();
            }
        });

        Connection::over(Box::new(local), "test:11300")
    }

    #[tokio::test]
    async fn test_put_inserted_and_buried() {
        let mut c = scripted(vec![
            (b"put 65536 0 120 4\r\ndata\r\n".to_vec(), b"INSERTED 5\r\n".to_vec()),
            (b"put 1 2 3 2\r\nhi\r\n".to_vec(), b"BURIED 6\r\n".to_vec()),
        ]);

        assert_eq!(
            c.put(&b"data"[..], PutOptions::default()).await.unwrap(),
            5
        );
        assert_eq!(
            c.put(
                &b"hi"[..],
                PutOptions {
                    pri: 1,
                    delay: 2,
                    ttr: 3
                }
            )
            .await
            .unwrap(),
            6
        );
    }

    #[tokio::test]
    async fn test_put_draining_classified() {
        let mut c = scripted(vec![(
            b"put 65536 0 120 1\r\nx\r\n".to_vec(),
            b"DRAINING\r\n".to_vec(),
        )]);

        let err = c.put(&b"x"[..], PutOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Draining));
        // A refusal is not a connection fault.
        assert!(c.is_open());
    }

    #[tokio::test]
    async fn test_use_caches_tube() {
        // The script expects exactly one `use`; a second one would
        // desynchronise it and fail the delete below.
        let mut c = scripted(vec![
            (b"use foo\r\n".to_vec(), b"USING foo\r\n".to_vec()),
            (b"delete 1\r\n".to_vec(), b"DELETED\r\n".to_vec()),
        ]);

        assert_eq!(c.use_tube("foo").await.unwrap(), "foo");
        assert_eq!(c.use_tube("foo").await.unwrap(), "foo");
        assert_eq!(c.used_tube(), "foo");

        c.delete(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_and_ignore_short_circuit() {
        let mut c = scripted(vec![
            (b"watch jobs\r\n".to_vec(), b"WATCHING 2\r\n".to_vec()),
            (b"ignore jobs\r\n".to_vec(), b"WATCHING 1\r\n".to_vec()),
            (b"delete 1\r\n".to_vec(), b"DELETED\r\n".to_vec()),
        ]);

        // "default" is watched from the start: no round trip.
        assert_eq!(c.watch("default").await.unwrap(), 1);
        // Not watched: no round trip either.
        assert_eq!(c.ignore("jobs").await.unwrap(), 1);

        assert_eq!(c.watch("jobs").await.unwrap(), 2);
        // Second watch of the same tube: cached.
        assert_eq!(c.watch("jobs").await.unwrap(), 2);

        assert_eq!(c.ignore("jobs").await.unwrap(), 1);

        assert_eq!(
            c.list_tubes_watched(true).await.unwrap(),
            vec!["default".to_string()]
        );

        c.delete(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_reads_body() {
        let mut c = scripted(vec![(
            b"reserve\r\n".to_vec(),
            b"RESERVED 12 5\r\nhello\r\n".to_vec(),
        )]);

        let (id, body) = c.reserve(None).await.unwrap();
        assert_eq!(id, 12);
        assert_eq!(body, "hello");
        assert!(!c.reserve_pending);
    }

    #[tokio::test]
    async fn test_reserve_guard_blocks_second_command() {
        let (local, mut remote) = duplex(4096);
        let mut c = Connection::over(Box::new(local), "t");

        // Simulate an in-flight reservation.
        c.reserve_pending = true;

        let err = c.delete(1).await.unwrap_err();
        assert!(matches!(err, Error::ReservePending));

        // Nothing must have reached the wire.
        drop(c);
        let mut seen = Vec::new();
        remote.read_to_end(&mut seen).await.unwrap();
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_cancelled_closes_connection() {
        let (local, mut remote) = duplex(4096);
        let mut c = Connection::over(Box::new(local), "t");

        let token = CancellationToken::new();
        token.cancel();

        let err = c.reserve(Some(&token)).await.unwrap_err();
        assert!(matches!(err, Error::ReserveCancelled));
        assert!(!c.is_open());
        assert!(!c.reserve_pending);

        // The reserve line was sent before the cancellation landed.
        let mut buf = vec![0u8; b"reserve\r\n".len()];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"reserve\r\n");

        // The connection refuses further use.
        let err = c.delete(1).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_bad_trailer_is_fatal() {
        let mut c = scripted(vec![(b"peek\r\n".to_vec(), b"FOUND 1 3\r\nabcXX".to_vec())]);

        let err = c.peek().await.unwrap_err();
        assert!(matches!(err, Error::BadTrailer));
        assert!(!c.is_open());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_disconnect() {
        let mut c = scripted(vec![(b"reserve\r\n".to_vec(), b"RESERVED 1 10\r\nabc".to_vec())]);

        let err = c.reserve(None).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
        assert!(err.is_transport_fault());
    }

    #[tokio::test]
    async fn test_peek_not_found_is_none() {
        let mut c = scripted(vec![
            (b"peek\r\n".to_vec(), b"NOT_FOUND\r\n".to_vec()),
            (b"peek 9\r\n".to_vec(), b"NOT_FOUND\r\n".to_vec()),
        ]);

        assert!(c.peek().await.unwrap().is_none());
        assert!(c.peek_job(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_document() {
        let doc = "current-jobs-ready: 3\nversion: \"1.13\"\n";
        let reply = format!("OK {}\r\n{doc}\r\n", doc.len());

        let mut c =
            scripted(vec![(b"stats\r\n".to_vec(), reply.into_bytes())]);

        let stats = c.stats().await.unwrap();
        let ready = stats
            .iter()
            .find(|(k, _)| k.as_str() == Some("current-jobs-ready"))
            .and_then(|(_, v)| v.as_u64());
        assert_eq!(ready, Some(3));
    }

    #[tokio::test]
    async fn test_list_tubes() {
        let doc = "- default\n- jobs\n";
        let reply = format!("OK {}\r\n{doc}\r\n", doc.len());

        let mut c = scripted(vec![(
            b"list-tubes\r\n".to_vec(),
            reply.into_bytes(),
        )]);

        assert_eq!(c.list_tubes().await.unwrap(), vec!["default", "jobs"]);
    }

    #[tokio::test]
    async fn test_unexpected_status_classified() {
        let mut c = scripted(vec![(b"delete 3\r\n".to_vec(), b"TOUCHED\r\n".to_vec())]);

        match c.delete(3).await.unwrap_err() {
            Error::UnexpectedResponse { word, .. } => {
                assert_eq!(word, "TOUCHED")
            },
            other => panic!("wrong error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_use_rejects_bad_tube_name() {
        let (local, _remote) = duplex(64);
        let mut c = Connection::over(Box::new(local), "t");

        assert!(matches!(
            c.use_tube("-bad").await.unwrap_err(),
            Error::BadTubeName(_)
        ));
    }
}
