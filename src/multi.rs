use std::io::{Read, Result as IoResult, Write};
use std::time::Instant;

use crate::config::StripeConfig;
use crate::reader::{CancelHandle, ReaderSocket};
use crate::socket::DataSocket;
use crate::writer::WriterSocket;
use crate::{Error, Result};

/// A bidirectional striped stream over one set of connections.
///
/// Reads go through a [`ReaderSocket`] working on cloned handles, writes
/// through a [`WriterSocket`] owning the connections. Only the writer closes
/// them, so closing a `MultiSocket` first finishes the outgoing stream.
pub struct MultiSocket<S: DataSocket> {
    reader: ReaderSocket<S>,
    writer: WriterSocket<S>,
    /// Extra handles to apply deadlines while workers hold the connections.
    handles: Vec<S>,
    closed: bool,
}

impl<S: DataSocket> MultiSocket<S> {
    /// Builds both directions over `sockets`, which are owned by the writer.
    pub fn new(sockets: Vec<S>, config: &StripeConfig) -> Result<Self> {
        let clone_all = || {
            sockets
                .iter()
                .map(|s| s.try_clone())
                .collect::<IoResult<Vec<_>>>()
        };
        let clones = clone_all()?;
        let handles = clone_all()?;
        Ok(MultiSocket {
            reader: ReaderSocket::with_shared_connections(clones, config)?,
            writer: WriterSocket::new(sockets, config)?,
            handles,
            closed: false,
        })
    }

    /// Number of bonded connections.
    pub fn streams(&self) -> usize {
        self.writer.streams()
    }

    /// The receiving half.
    pub fn reader(&mut self) -> &mut ReaderSocket<S> {
        &mut self.reader
    }

    /// The sending half.
    pub fn writer(&mut self) -> &mut WriterSocket<S> {
        &mut self.writer
    }

    /// Handle to abort a blocked read from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.reader.cancel_handle()
    }

    /// Bounds reads of the striped stream and every blocking call on the
    /// connections.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.reader.set_deadline(deadline);
        for handle in &self.handles {
            handle.set_deadline(deadline)?;
        }
        Ok(())
    }

    /// Ends the outgoing stream without closing the connections.
    pub fn finish(&mut self) -> Result<()> {
        self.writer.finish()
    }

    /// Stops reading, then finishes the outgoing stream and closes the
    /// connections.
    ///
    /// Finishing sends EOD segments, which fails once the peer has closed the
    /// connections. The side that reads until the peer's end of stream should
    /// therefore [`finish`](MultiSocket::finish) its own direction before the
    /// peer closes; `close` then only releases the connections. Dropping a
    /// `MultiSocket` closes it.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let read = self.reader.close();
        let written = self.writer.close();
        written.and(read)
    }
}

impl<S: DataSocket> Drop for MultiSocket<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Error closing striped stream on drop: {e}");
        }
    }
}

impl<S: DataSocket> Read for MultiSocket<S> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if self.closed {
            return Err(Error::Closed.into());
        }
        self.reader.read(buf)
    }
}

impl<S: DataSocket> Write for MultiSocket<S> {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> IoResult<()> {
        Write::flush(&mut self.writer)
    }
}
