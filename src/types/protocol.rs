use bytes::Bytes;

use super::serialisable::BeanstalkSerialisable;
use crate::errors::Error;

/// A command sent by this client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Command {
    /// Places a job onto the currently `use`d tube.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>` plus data.
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
    },
    /// Awaits a job from the watched tubes, blocking until one appears.
    ///
    /// On the wire: `reserve`
    Reserve,
    /// Asks for the next ready job on the currently-used tube without
    /// reserving it. Answered with `FOUND <id> <bytes>` plus data, or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `peek`
    Peek,
    /// As `Peek`, but for one job by its ID regardless of state.
    ///
    /// On the wire: `peek <id>`
    PeekJob { id: u64 },
    /// Removes a job from the server entirely. Answered with `DELETED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Returns a reserved job to the ready (or delayed) state. Answered
    /// with `RELEASED`, `BURIED` under server memory pressure, or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `release <id> <pri> <delay>`
    Release { id: u64, pri: u32, delay: u32 },
    /// Moves a reserved job to the inert buried state. Answered with
    /// `BURIED` or `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Selects the tube subsequent puts go to. Answered with
    /// `USING <tube>`.
    ///
    /// On the wire: `use <tube>`
    Use { tube: String },
    /// Adds a tube to the watch list reservations are taken from. Answered
    /// with `WATCHING <count>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: String },
    /// Reverses `watch`. The server refuses to empty the watch list with
    /// `NOT_IGNORED`.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: String },
    /// Server-wide statistics. As for the whole stats family, answered
    /// with `OK <bytes>` plus a YAML document.
    ///
    /// On the wire: `stats`
    Stats,
    /// Statistics for one job.
    ///
    /// On the wire: `stats-job <id>`
    StatsJob { id: u64 },
    /// Statistics for one tube.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: String },
    /// Every tube currently existing on the server, as a YAML list.
    ///
    /// On the wire: `list-tubes`
    ListTubes,
    /// The tube puts currently go to. Answered with `USING <tube>`.
    ///
    /// On the wire: `list-tube-used`
    ListTubeUsed,
    /// The server's view of this connection's watch list, as a YAML list.
    ///
    /// On the wire: `list-tubes-watched`
    ListTubesWatched,
}

impl BeanstalkSerialisable for Command {
    fn serialise_beanstalk(&self) -> Vec<u8> {
        use Command::*;

        match self {
            Put {
                pri,
                delay,
                ttr,
                body,
            } => [
                format!("put {pri} {delay} {ttr} {}\r\n", body.len())
                    .into_bytes(),
                body.to_vec(),
                b"\r\n".to_vec(),
            ]
            .concat(),
            Reserve => b"reserve\r\n".to_vec(),
            Peek => b"peek\r\n".to_vec(),
            PeekJob { id } => format!("peek {id}\r\n").into(),
            Delete { id } => format!("delete {id}\r\n").into(),
            Release { id, pri, delay } => {
                format!("release {id} {pri} {delay}\r\n").into()
            },
            Bury { id, pri } => format!("bury {id} {pri}\r\n").into(),
            Use { tube } => format!("use {tube}\r\n").into(),
            Watch { tube } => format!("watch {tube}\r\n").into(),
            Ignore { tube } => format!("ignore {tube}\r\n").into(),
            Stats => b"stats\r\n".to_vec(),
            StatsJob { id } => format!("stats-job {id}\r\n").into(),
            StatsTube { tube } => format!("stats-tube {tube}\r\n").into(),
            ListTubes => b"list-tubes\r\n".to_vec(),
            ListTubeUsed => b"list-tube-used\r\n".to_vec(),
            ListTubesWatched => b"list-tubes-watched\r\n".to_vec(),
        }
    }
}

/// A reply line from the server. Payload blocks announced by `Reserved`,
/// `Found`, and `OkData` follow on the stream and are read separately.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Reply {
    /// A put succeeded; the job got this ID.
    Inserted { id: u64 },
    /// With an ID: a put was accepted but buried immediately under memory
    /// pressure (still a success for the producer). Without: a bury
    /// succeeded.
    Buried { id: Option<u64> },
    /// A reserve succeeded; `n_bytes` of job body follow.
    Reserved { id: u64, n_bytes: usize },
    /// A peek succeeded; `n_bytes` of job body follow.
    Found { id: u64, n_bytes: usize },
    Deleted,
    Released,
    /// Answer to `use` and `list-tube-used`.
    Using { tube: String },
    /// Answer to `watch` and `ignore` with the watch-list size.
    Watching { count: u32 },
    /// Stats-family success; `n_bytes` of YAML follow.
    OkData { n_bytes: usize },
    NotFound,
    /// The server is refusing new work.
    Draining,
    /// Any other status word, kept whole for classification.
    Other { word: String, line: String },
}

impl Reply {
    /// The status word this reply arrived under.
    pub(crate) fn word(&self) -> &str {
        use Reply::*;

        match self {
            Inserted { .. } => "INSERTED",
            Buried { .. } => "BURIED",
            Reserved { .. } => "RESERVED",
            Found { .. } => "FOUND",
            Deleted => "DELETED",
            Released => "RELEASED",
            Using { .. } => "USING",
            Watching { .. } => "WATCHING",
            OkData { .. } => "OK",
            NotFound => "NOT_FOUND",
            Draining => "DRAINING",
            Other { word, .. } => word,
        }
    }

    /// Classifies a reply that fell outside the expected set for its
    /// command. The table is fixed: known refusal words get their own
    /// variant, everything else becomes `UnexpectedResponse`.
    pub(crate) fn into_unexpected(self) -> Error {
        match self {
            Reply::NotFound => Error::NotFound,
            Reply::Draining => Error::Draining,
            Reply::Other { word, line } => {
                Error::UnexpectedResponse { word, line }
            },
            other => {
                let word = other.word().to_owned();
                Error::UnexpectedResponse {
                    line: word.clone(),
                    word,
                }
            },
        }
    }
}
