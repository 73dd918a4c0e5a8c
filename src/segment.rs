//! Extended block mode segments and their wire codec.
//!
//! Every segment travels as a fixed 17 byte header followed by exactly
//! `byte_count` payload bytes:
//!
//! ```text
//! +------------+----------------------+----------------------+-------------+
//! | descriptor | byte_count (u64, BE) | offset_count (u64,BE)| payload ... |
//! +------------+----------------------+----------------------+-------------+
//! ```
//!
//! The header layout is shared with GridFTP extended block mode peers, so it
//! must not change.

use std::io::{Read, Write};

use bincode::config::{self, BigEndian, Configuration, Fixint};

use crate::{Error, Result};

/// Descriptor bits of the segment header.
pub mod flag {
    /// Legacy, never set by this crate.
    pub const END_OF_RECORD: u8 = 128;
    /// `offset_count` carries the number of EOD segments the sender emits.
    pub const END_OF_DATA_COUNT: u8 = 64;
    /// Legacy, never set by this crate.
    pub const SUSPECT_ERRORS: u8 = 32;
    /// Legacy, never set by this crate.
    pub const RESTART_MARKER: u8 = 16;
    /// Last segment sent on a connection.
    pub const END_OF_DATA: u8 = 8;
    /// The sender closes the connection after this segment.
    pub const SENDER_CLOSES: u8 = 4;

    pub(crate) const KNOWN: u8 = END_OF_RECORD
        | END_OF_DATA_COUNT
        | SUSPECT_ERRORS
        | RESTART_MARKER
        | END_OF_DATA
        | SENDER_CLOSES;
}

/// Encoded size of a [`Header`].
pub const HEADER_LEN: usize = 17;

fn wire() -> Configuration<BigEndian, Fixint> {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Header preceding every segment on the wire. Field order is the wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Header {
    /// Bitwise OR of [`flag`] values.
    pub descriptor: u8,
    /// Payload length in bytes.
    pub byte_count: u64,
    /// Stream offset of the first payload byte, or the EOD count when
    /// [`flag::END_OF_DATA_COUNT`] is set.
    pub offset_count: u64,
}

impl Header {
    /// Builds a header with the given descriptor flags.
    pub fn new(byte_count: u64, offset_count: u64, flags: u8) -> Self {
        Self {
            descriptor: flags,
            byte_count,
            offset_count,
        }
    }

    /// Whether every bit of `flag` is set.
    pub fn contains(&self, flag: u8) -> bool {
        self.descriptor & flag == flag
    }

    /// Sets the bits of `flags` in the descriptor.
    pub fn add_flags(&mut self, flags: u8) {
        self.descriptor |= flags;
    }

    /// Number of EOD segments announced by the sender, if this header announces it.
    pub fn eod_count(&self) -> Option<u64> {
        self.contains(flag::END_OF_DATA_COUNT)
            .then_some(self.offset_count)
    }

    /// Encodes the header in its wire layout.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_LEN]> {
        let mut buf = [0u8; HEADER_LEN];
        let n = bincode::encode_into_slice(self, &mut buf, wire())?;
        debug_assert_eq!(n, HEADER_LEN);
        Ok(buf)
    }

    /// Decodes and validates a header. Payloads above `max_len` bytes are
    /// rejected as a corrupted header.
    pub fn from_bytes(bytes: &[u8], max_len: usize) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::ShortSegment {
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let (header, _): (Header, usize) =
            bincode::decode_from_slice(&bytes[..HEADER_LEN], wire())
                .map_err(|e| Error::ProtocolDesync(format!("undecodable header: {e}")))?;
        header.validate(max_len)?;
        Ok(header)
    }

    fn validate(&self, max_len: usize) -> Result<()> {
        if self.descriptor & !flag::KNOWN != 0 {
            return Err(Error::ProtocolDesync(format!(
                "unknown descriptor bits {:#04x}",
                self.descriptor
            )));
        }
        if self.byte_count > max_len as u64 {
            return Err(Error::ProtocolDesync(format!(
                "segment of {} bytes exceeds limit of {max_len}",
                self.byte_count
            )));
        }
        Ok(())
    }
}

/// An offset-tagged chunk of the logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Wire header; `byte_count` always equals `data.len()`.
    pub header: Header,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Segment {
    /// Wraps `data` starting at stream offset `offset`.
    pub fn new(data: Vec<u8>, offset: u64, flags: u8) -> Self {
        Self {
            header: Header::new(data.len() as u64, offset, flags),
            data,
        }
    }

    /// Empty segment closing the sub-stream of one connection.
    pub fn end_of_data(offset: u64) -> Self {
        Self::new(Vec::new(), offset, flag::END_OF_DATA)
    }

    /// Stream offset of the first payload byte.
    pub fn offset(&self) -> u64 {
        self.header.offset_count
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment carries no payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this is the last segment of its connection.
    pub fn is_end_of_data(&self) -> bool {
        self.header.contains(flag::END_OF_DATA)
    }

    /// Writes header and payload to `w`.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let header = self.header.to_bytes()?;
        w.write_all(&header)?;
        if !self.data.is_empty() {
            w.write_all(&self.data)?;
        }
        Ok(())
    }

    /// Reads the next segment from `r`, blocking until it is complete.
    ///
    /// A connection that closes inside a header or a payload yields
    /// [`Error::Connection`]. A header that fails validation yields
    /// [`Error::ProtocolDesync`]; the remaining bytes of `r` cannot be
    /// interpreted any more.
    pub fn read_from<R: Read + ?Sized>(r: &mut R, max_len: usize) -> Result<Segment> {
        let mut buf = [0u8; HEADER_LEN];
        r.read_exact(&mut buf)?;
        let header = Header::from_bytes(&buf, max_len)?;

        let mut data = vec![0u8; header.byte_count as usize];
        r.read_exact(&mut data)?;
        Ok(Segment { header, data })
    }
}
