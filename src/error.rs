//! Error type shared by the reader, the writer and the segment codec.

use std::io;

/// Errors raised by the striped data channel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O failure or unexpected close while encoding or decoding a segment.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// The input holds fewer bytes than a whole segment header.
    #[error("short segment: needed {needed} bytes, got {available}")]
    ShortSegment {
        /// Bytes a header occupies.
        needed: usize,
        /// Bytes that were supplied.
        available: usize,
    },

    /// The segment stream of a connection can no longer be trusted.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// A read worker failed; the whole transfer is aborted.
    #[error("stream {stream} failed: {source}")]
    Worker {
        /// Index of the connection whose worker failed.
        stream: usize,
        /// What the worker ran into.
        #[source]
        source: Box<Error>,
    },

    /// An earlier failure aborted the transfer.
    #[error("transfer aborted by an earlier failure")]
    Aborted,

    /// The read timeout or deadline passed before the next in-order segment arrived.
    #[error("timed out waiting for the next segment")]
    Timeout,

    /// The socket was closed or cancelled.
    #[error("socket closed")]
    Closed,

    /// Data was written after the end of the logical stream.
    #[error("stream already finished")]
    Finished,

    /// A socket was built from unusable settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A header could not be serialized.
    #[error("header encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The error a worker surfaces for `stream`.
    pub(crate) fn worker(stream: usize, source: Error) -> Error {
        Error::Worker {
            stream,
            source: Box::new(source),
        }
    }

    fn kind(&self) -> io::ErrorKind {
        match self {
            Error::Connection(e) => e.kind(),
            Error::Worker { source, .. } => source.kind(),
            Error::Aborted => io::ErrorKind::ConnectionAborted,
            Error::ShortSegment { .. } => io::ErrorKind::UnexpectedEof,
            Error::ProtocolDesync(_) => io::ErrorKind::InvalidData,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Closed => io::ErrorKind::NotConnected,
            Error::Finished => io::ErrorKind::BrokenPipe,
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::Encode(_) => io::ErrorKind::InvalidData,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Connection(e) => e,
            other => io::Error::new(other.kind(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_map_to_distinct_io_kinds() {
        let err: io::Error = Error::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let err: io::Error = Error::ProtocolDesync("bad header".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let inner = Error::Connection(io::Error::from(io::ErrorKind::ConnectionReset));
        let err: io::Error = Error::worker(2, inner).into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("stream 2"));
    }
}
