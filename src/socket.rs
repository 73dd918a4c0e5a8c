use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

/// A single connection of a striped channel.
///
/// Reads and writes block. Whoever owns the connection calls
/// [`close`](DataSocket::close) exactly once; clones obtained through
/// [`try_clone`](DataSocket::try_clone) share the connection, so closing any
/// handle must also wake readers blocked on the others.
pub trait DataSocket: Read + Write + Send + 'static {
    /// Shuts the connection down for every handle sharing it.
    fn close(&mut self) -> io::Result<()>;

    /// Bounds every following blocking call. `None` removes the bound.
    fn set_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    /// Returns another handle to the same connection.
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;
}

impl DataSocket for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        // A zero timeout is rejected by the OS, so an expired deadline becomes
        // the shortest one it accepts.
        let timeout = deadline.map(|d| {
            d.saturating_duration_since(Instant::now())
                .max(Duration::from_micros(1))
        });
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }

    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }
}
