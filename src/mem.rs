//! In-memory connections, used to run striped channels without sockets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::socket::DataSocket;

#[derive(Default)]
struct Buffer {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One direction of a pipe.
#[derive(Default)]
struct Direction {
    buffer: Mutex<Buffer>,
    readable: Condvar,
}

impl Direction {
    fn close(&self) {
        self.buffer.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of a full-duplex in-memory pipe created by [`pipe`].
///
/// Writes never block. Closing either end closes both directions: pending
/// bytes can still be read, after which reads return `Ok(0)`.
pub struct MemorySocket {
    rx: Arc<Direction>,
    tx: Arc<Direction>,
    deadline: Arc<Mutex<Option<Instant>>>,
}

/// Creates a connected pair of in-memory sockets.
pub fn pipe() -> (MemorySocket, MemorySocket) {
    let a = Arc::new(Direction::default());
    let b = Arc::new(Direction::default());
    (
        MemorySocket {
            rx: a.clone(),
            tx: b.clone(),
            deadline: Arc::default(),
        },
        MemorySocket {
            rx: b,
            tx: a,
            deadline: Arc::default(),
        },
    )
}

impl Read for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = *self.deadline.lock();
        let mut buffer = self.rx.buffer.lock();
        while buffer.bytes.is_empty() && !buffer.closed {
            match deadline {
                Some(deadline) => {
                    if self.rx.readable.wait_until(&mut buffer, deadline).timed_out()
                        && buffer.bytes.is_empty()
                        && !buffer.closed
                    {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                }
                None => self.rx.readable.wait(&mut buffer),
            }
        }
        let n = buf.len().min(buffer.bytes.len());
        for (dst, src) in buf.iter_mut().zip(buffer.bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemorySocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.tx.buffer.lock();
        if buffer.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        buffer.bytes.extend(buf);
        drop(buffer);
        self.tx.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DataSocket for MemorySocket {
    fn close(&mut self) -> io::Result<()> {
        self.rx.close();
        self.tx.close();
        Ok(())
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.deadline.lock() = deadline;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(MemorySocket {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
            deadline: self.deadline.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bytes_flow_both_ways() {
        let (mut a, mut b) = pipe();
        a.write_all(b"ping").unwrap();
        b.write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn close_drains_then_reports_eof() {
        let (mut a, mut b) = pipe();
        a.write_all(b"tail").unwrap();
        a.close().unwrap();

        let mut out = Vec::new();
        b.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tail");
        assert!(b.write_all(b"x").is_err());
    }

    #[test]
    fn close_wakes_blocked_clone() {
        let (_a, b) = pipe();
        let mut reader = b.try_clone().unwrap();
        let handle = std::thread::spawn(move || reader.read(&mut [0u8; 8]));
        std::thread::sleep(Duration::from_millis(20));
        let mut closer = b;
        closer.close().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn deadline_times_out_reads() {
        let (_a, mut b) = pipe();
        b.set_deadline(Some(Instant::now() + Duration::from_millis(10)))
            .unwrap();
        let err = b.read(&mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
