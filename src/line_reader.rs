use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads CRLF-terminated lines and byte-counted payload blocks from a
/// stream.
///
/// Reply lines and their trailing payloads share one buffer, so bytes that
/// arrive together in a single read are never re-read from the socket.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Bytes received but not yet handed out.
    buf: BytesMut,
    /// Index in buf from which an unseen CRLF pair may start (everything
    /// before it has already been scanned).
    maybe_crlf_from: usize,
    /// Data source.
    reader: T,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads one line, without its CRLF terminator. Returns `None` on a
    /// clean end-of-stream, discarding any partly-received line.
    ///
    /// This function is cancel-safe: its only await point is a `read_buf`
    /// against the inner reader, so either a complete read happens and is
    /// buffered, or nothing is consumed.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan from one byte before the newest data so a CRLF pair
            // split across two reads is still found.
            if let Some(eol) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|pair| pair == (&b'\r', &b'\n'))
            {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eol + 2).freeze();
                let line = line.slice(0..line.len() - 2);

                self.maybe_crlf_from = 0;

                return Ok(Some(line));
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            self.maybe_crlf_from =
                self.buf.len().checked_sub(n + 1).unwrap_or(0);

            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads exactly `n` bytes. A stream that ends short of `n` bytes is an
    /// `UnexpectedEof` error, indistinguishable on purpose from any other
    /// disconnection.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buf.len() < n {
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a byte-counted block",
                ));
            }
        }

        // Consuming payload bytes invalidates the line-scan position.
        self.maybe_crlf_from = 0;

        Ok(self.buf.split_to(n).freeze())
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn test_read_line_reassembly() {
        // When properly read, each nth line should read b"test:{n}".
        let writes: &[&[u8]] = &[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Two lines in one write
            b"test:4\r\ntest:5\r\n",
            // Split LF across writes
            b"test:6\r",
            b"\ntest:7\r\n",
        ];

        // Yielding between writes forces the reads to fragment.
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in writes {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        for n in 1..=7 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_exact_interleaved_with_lines() {
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            client.write_all(b"RESERVED 1 5\r\nhel").await.unwrap();
            yield_now().await;
            client.write_all(b"lo\r\nDELETED\r\n").await.unwrap();
        });

        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "RESERVED 1 5");
        assert_eq!(lr.read_exact(5).await.unwrap(), "hello");
        assert_eq!(lr.read_exact(2).await.unwrap(), "\r\n");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "DELETED");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_exact_truncated() {
        let (mut client, server) = io::duplex(4096);

        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut lr: LineReader<_> = server.into();

        let err = lr.read_exact(5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
