//! # EBM Socket - Striped Extended Block Mode Data Channels
//!
//! EBM Socket carries one logical byte stream over several parallel
//! connections, the way GridFTP's extended block mode does. Data written to a
//! striped stream is cut into offset-tagged segments spread across the
//! connections; on the other end one worker per connection decodes segments
//! into a shared queue, and reads hand the bytes back in their original order
//! no matter which connection delivered them first.
//!
//! ## Key Features
//!
//! - **Striping**: a [`WriterSocket`] splits the stream into segments of at most
//!   `max_segment_len` bytes and distributes them round-robin, or to whichever
//!   connection is free first
//! - **Ordered Reassembly**: a [`ReaderSocket`] delivers bytes strictly by offset,
//!   holding back segments that arrive early
//! - **Explicit End of Stream**: every connection ends with its own EOD segment;
//!   the stream ends only once all of them were consumed
//! - **Failure Reporting**: a connection failing mid-transfer aborts the read
//!   with an error instead of stalling it, and reads can be bounded by a timeout,
//!   a deadline, or a [`CancelHandle`]
//! - **Familiar API**: the sockets implement `std::io::Read` and `std::io::Write`
//!
//! ## Wire Format
//!
//! Each connection carries `[header][payload]` records. The 17 byte header
//! holds a descriptor byte (flags), the payload length and the offset of the
//! first payload byte in the logical stream, both as big-endian `u64`. See the
//! [`segment`] module.
//!
//! ## Basic Usage
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use ebm_socket::{StripeConfig, StripedListener};
//! use std::io::Read;
//!
//! // Bond 3 connections per client
//! let config = StripeConfig::default().with_streams(3);
//! let mut listener = StripedListener::bind("127.0.0.1:8080", config)?;
//!
//! let (mut stream, addr) = listener.accept()?;
//! let mut received = Vec::new();
//! stream.read_to_end(&mut received)?;
//! println!("Received {} bytes from {addr}", received.len());
//! # Ok::<(), ebm_socket::Error>(())
//! ```
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use ebm_socket::StripeConfig;
//! use std::io::Write;
//!
//! let mut stream = ebm_socket::connect("127.0.0.1:8080", &StripeConfig::default())?;
//! stream.write_all(b"Hello from a striped connection!")?;
//! // Sends EOD on every connection, then closes them
//! stream.close()?;
//! # Ok::<(), ebm_socket::Error>(())
//! ```
//!
//! ### Any Connection Type
//!
//! The sockets work over anything implementing [`DataSocket`]:
//!
//! ```rust
//! use ebm_socket::{mem, ReaderSocket, StripeConfig, WriterSocket};
//! use std::io::{Read, Write};
//!
//! let config = StripeConfig::default().with_max_segment_len(4);
//! let (ours, theirs): (Vec<_>, Vec<_>) = (0..2).map(|_| mem::pipe()).unzip();
//! let mut writer = WriterSocket::new(ours, &config)?;
//! let mut reader = ReaderSocket::new(theirs, &config)?;
//!
//! writer.write_all(b"ABCDEFGHIJKL")?;
//! writer.close()?;
//!
//! let mut out = String::new();
//! reader.read_to_string(&mut out)?;
//! assert_eq!(out, "ABCDEFGHIJKL");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Configuration
//!
//! [`StripeConfig`] sets the number of bonded connections, the segment length,
//! the largest segment accepted from a peer, an optional read timeout and the
//! distribution policy. How many connections to open and where they terminate
//! is up to the session setup; [`StripedListener`] and [`connect`] provide a
//! simple TCP one.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod mem;
mod multi;
pub mod queue;
mod reader;
pub mod segment;
mod socket;
mod tcp;
mod writer;

pub use config::{Distribution, StripeConfig};
pub use error::{Error, Result};
pub use multi::MultiSocket;
pub use queue::SegmentQueue;
pub use reader::{CancelHandle, ReaderSocket};
pub use segment::{Header, Segment};
pub use socket::DataSocket;
pub use tcp::{connect, StripedListener};
pub use writer::WriterSocket;
