use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::client::Client;
use crate::errors::Result;

/// Don't delay for more than 48 hours at a time.
pub const DELAY_MAX: u64 = 60 * 60 * 48;

/// A job handed out by `reserve` or a peek.
///
/// A job ID is only unique on the server that assigned it, so the handle
/// keeps hold of the client it came from and routes every lifecycle call
/// back through it. If that connection has since closed, lifecycle calls
/// fail with `Error::NotConnected`.
#[derive(Clone)]
pub struct Job {
    client: Client,
    id: u64,
    pri: u32,
    body: Bytes,
}

impl Job {
    pub(crate) fn new(client: Client, id: u64, pri: u32, body: Bytes) -> Self {
        Self {
            client,
            id,
            pri,
            body,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The priority this handle will reuse for `put_back` and `decay`.
    /// Replies to reserve and peek don't carry the job's priority, so this
    /// starts at the server default unless set at put time.
    pub fn pri(&self) -> u32 {
        self.pri
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The address of the server this job lives on.
    pub fn server(&self) -> &str {
        self.client.addr()
    }

    /// Decodes the body through the codec.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_yaml::from_slice(&self.body)?)
    }

    pub async fn delete(&self) -> Result<()> {
        self.client.delete(self.id).await
    }

    pub async fn release(&self, pri: u32, delay: u32) -> Result<()> {
        self.client.release(self.id, pri, delay).await
    }

    pub async fn bury(&self, pri: u32) -> Result<()> {
        self.client.bury(self.id, pri).await
    }

    /// Enqueues a fresh copy of this job's body at its own priority.
    pub async fn put_back(&self) -> Result<u64> {
        use crate::connection::PutOptions;

        let opts = PutOptions {
            pri: self.pri,
            ..PutOptions::default()
        };

        self.client.put(self.body.clone(), opts).await
    }

    pub async fn stats(&self) -> Result<serde_yaml::Mapping> {
        self.client.job_stats(self.id).await
    }

    pub async fn age(&self) -> Result<u64> {
        self.stat_u64("age").await
    }

    pub async fn time_left(&self) -> Result<u64> {
        self.stat_u64("time-left").await
    }

    pub async fn timeouts(&self) -> Result<u64> {
        self.stat_u64("timeouts").await
    }

    /// Seconds until the job becomes ready; 0 when it already is.
    pub async fn delay(&self) -> Result<u64> {
        self.stat_u64("delay").await
    }

    pub async fn state(&self) -> Result<String> {
        let stats = self.stats().await?;
        Ok(stat_field(&stats, "state")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_owned())
    }

    /// Releases the job with exponentially longer delays, and buries it
    /// once the delay reaches the 48-hour ceiling. Turns a poison job inert
    /// instead of letting it retry forever.
    pub async fn decay(&self) -> Result<()> {
        let delay = self.delay().await?;

        if delay >= DELAY_MAX {
            self.bury(self.pri).await
        } else {
            self.release(self.pri, next_delay(delay as u32)).await
        }
    }

    async fn stat_u64(&self, key: &str) -> Result<u64> {
        let stats = self.stats().await?;
        Ok(stat_field(&stats, key)
            .and_then(serde_yaml::Value::as_u64)
            .unwrap_or(0))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(job server={} id={} pri={} size={})",
            self.server(),
            self.id,
            self.pri,
            self.body.len()
        )
    }
}

fn stat_field<'a>(
    stats: &'a serde_yaml::Mapping,
    key: &str,
) -> Option<&'a serde_yaml::Value> {
    stats
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// One decay step: grow the current delay by 30%, rounding up.
fn next_delay(cur: u32) -> u32 {
    (f64::from(cur.max(1)) * 1.3).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use crate::connection::Connection;

    #[test]
    fn test_next_delay() {
        // A job that was never delayed starts from 1 second.
        assert_eq!(next_delay(0), 2);
        assert_eq!(next_delay(1), 2);
        assert_eq!(next_delay(100), 130);
        assert_eq!(next_delay(130), 169);
    }

    fn scripted_job(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Job {
        let (local, mut remote) = duplex(4096);

        tokio::spawn(async move {
            for (expect, reply) in exchanges {
                let mut buf = vec![0u8; expect.len()];
                remote.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, expect);
                remote.write_all(&reply).await.unwrap();
            }
        });

        let client = Client::from_connection(Connection::over(
            Box::new(local),
            "test:11300",
        ));

        Job::new(client, 7, 65536, Bytes::from_static(b"payload"))
    }

    fn stats_reply(doc: &str) -> Vec<u8> {
        format!("OK {}\r\n{doc}\r\n", doc.len()).into_bytes()
    }

    #[tokio::test]
    async fn test_decay_releases_below_ceiling() {
        let job = scripted_job(vec![
            (b"stats-job 7\r\n".to_vec(), stats_reply("delay: 100\n")),
            (b"release 7 65536 130\r\n".to_vec(), b"RELEASED\r\n".to_vec()),
        ]);

        job.decay().await.unwrap();
    }

    #[tokio::test]
    async fn test_decay_buries_at_ceiling() {
        let job = scripted_job(vec![
            (b"stats-job 7\r\n".to_vec(), stats_reply("delay: 172800\n")),
            (b"bury 7 65536\r\n".to_vec(), b"BURIED\r\n".to_vec()),
        ]);

        job.decay().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_readers() {
        let doc = "age: 12\ntime-left: 100\nstate: reserved\ntimeouts: 2\n";
        let job = scripted_job(vec![
            (b"stats-job 7\r\n".to_vec(), stats_reply(doc)),
            (b"stats-job 7\r\n".to_vec(), stats_reply(doc)),
            (b"stats-job 7\r\n".to_vec(), stats_reply(doc)),
        ]);

        assert_eq!(job.age().await.unwrap(), 12);
        assert_eq!(job.state().await.unwrap(), "reserved");
        // A document without a delay field reads as no delay.
        assert_eq!(job.delay().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_back_reuses_body_and_pri() {
        let job = scripted_job(vec![(
            b"put 65536 0 120 7\r\npayload\r\n".to_vec(),
            b"INSERTED 9\r\n".to_vec(),
        )]);

        assert_eq!(job.put_back().await.unwrap(), 9);
    }
}
