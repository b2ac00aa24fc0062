use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by connections and pools.
///
/// Status words the server may answer with where success was expected are
/// mapped onto a fixed set of variants (`Draining`, `NotFound`) with
/// `UnexpectedResponse` as the catch-all, so callers can match on the
/// condition rather than string-compare reply lines.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection has been closed, or a pool has no open members left.
    #[error("not connected")]
    NotConnected,

    /// The server closed the stream, or a byte-counted read ended early.
    #[error("server disconnected")]
    Disconnected,

    /// A reply line that doesn't fit the reply grammar. The stream position
    /// can no longer be trusted, so the connection is abandoned.
    #[error("unparseable reply line: {0:?}")]
    BadReply(String),

    /// The two bytes after a byte-counted payload were not CRLF.
    #[error("missing CRLF trailer after payload")]
    BadTrailer,

    /// The server is shedding load and refusing this operation.
    #[error("server is draining")]
    Draining,

    /// The job or tube named in the request is unknown to the server.
    #[error("not found")]
    NotFound,

    /// Any other status word outside the expected set for the command.
    #[error("unexpected response: {line:?}")]
    UnexpectedResponse { word: String, line: String },

    /// A tube name the server would reject as BAD_FORMAT.
    #[error("invalid tube name: {0:?}")]
    BadTubeName(String),

    /// A second reserve was issued while one was still awaiting its reply.
    /// Nothing is sent on the wire in this case.
    #[error("a reservation is already pending on this connection")]
    ReservePending,

    /// A pending reserve was abandoned by its caller. The reply can no
    /// longer be correlated with anything, so the connection is closed.
    #[error("reservation cancelled")]
    ReserveCancelled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_yaml::Error),
}

impl Error {
    /// True for faults that are fatal to the affected connection and that a
    /// pool answers by dropping the member and reconnecting.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Io(_))
    }
}

/// Maps low-level read/write failures onto the taxonomy: detectable
/// disconnections become `Disconnected`, everything else stays `Io`.
pub(crate) fn classify_io(e: io::Error) -> Error {
    use io::ErrorKind::*;

    match e.kind() {
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
            Error::Disconnected
        },
        _ => Error::Io(e),
    }
}
