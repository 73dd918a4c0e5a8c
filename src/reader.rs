//! Receiving side of a striped channel.
//!
//! Every connection gets a [`ReadWorker`] thread decoding segments into a
//! queue shared with the [`ReaderSocket`]. The socket hands bytes to its caller
//! strictly by offset, whatever order the connections deliver them in.

use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::StripeConfig;
use crate::queue::SegmentQueue;
use crate::segment::Segment;
use crate::socket::DataSocket;
use crate::{Error, Result};

/// State shared by the workers and the consumer, all under one lock.
struct Inbox {
    queue: SegmentQueue,
    /// Bytes popped for delivery, i.e. the next expected offset.
    written: u64,
    /// EOD segments popped.
    done: usize,
    /// Workers that returned.
    exited: usize,
    failure: Option<(usize, Error)>,
    cancelled: bool,
}

struct Shared {
    inbox: Mutex<Inbox>,
    ready: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(Inbox {
                queue: SegmentQueue::new(),
                written: 0,
                done: 0,
                exited: 0,
                failure: None,
                cancelled: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Returns false once the reader is gone.
    fn push(&self, segment: Segment) -> bool {
        let mut inbox = self.inbox.lock();
        if inbox.cancelled {
            return false;
        }
        inbox.queue.push(segment);
        self.ready.notify_all();
        true
    }

    fn fail(&self, stream: usize, err: Error) {
        let mut inbox = self.inbox.lock();
        if inbox.cancelled {
            log::debug!("Stream {stream} stopped after close: {err}");
            return;
        }
        log::error!("Failed to receive segment on stream {stream}: {err}");
        if inbox.failure.is_none() {
            inbox.failure = Some((stream, err));
        }
        self.ready.notify_all();
    }

    fn exit(&self) {
        self.inbox.lock().exited += 1;
        self.ready.notify_all();
    }

    fn cancel(&self) {
        let mut inbox = self.inbox.lock();
        inbox.cancelled = true;
        inbox.queue.clear();
        self.ready.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.inbox.lock().cancelled
    }
}

/// Decodes the segments of one connection until its EOD segment.
struct ReadWorker<S> {
    stream: usize,
    socket: S,
    max_len: usize,
    shared: Arc<Shared>,
}

impl<S: Read> ReadWorker<S> {
    fn run(mut self) {
        loop {
            match Segment::read_from(&mut self.socket, self.max_len) {
                Ok(segment) => {
                    let eod = segment.is_end_of_data();
                    if !self.shared.push(segment) {
                        break;
                    }
                    if eod {
                        log::debug!("Stream {} reached end of data", self.stream);
                        break;
                    }
                }
                Err(err) => {
                    self.shared.fail(self.stream, err);
                    break;
                }
            }
        }
        self.shared.exit();
    }
}

/// Wakes a reader blocked in [`ReaderSocket::read_ordered`] from another thread.
#[derive(Clone)]
pub struct CancelHandle(Arc<Shared>);

impl CancelHandle {
    /// Makes pending and future reads fail with [`Error::Closed`].
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Dispatched,
    Drained,
    Failed,
    Closed,
}

/// Partially consumed segment payload.
struct Pending {
    data: Vec<u8>,
    pos: usize,
}

/// Reassembles one ordered byte stream from segments received on several
/// connections.
pub struct ReaderSocket<S: DataSocket> {
    /// Connections not yet handed to a worker.
    sockets: Vec<S>,
    /// Handles kept to close connections under the workers.
    controls: Vec<S>,
    owns_connections: bool,
    streams: usize,
    max_len: usize,
    read_timeout: Option<Duration>,
    deadline: Option<Instant>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    phase: Phase,
    pending: Option<Pending>,
}

impl<S: DataSocket> ReaderSocket<S> {
    /// Builds a reader owning `sockets`: closing it closes them.
    pub fn new(sockets: Vec<S>, config: &StripeConfig) -> Result<Self> {
        Self::build(sockets, config, true)
    }

    /// Builds a reader over connections somebody else closes.
    pub fn with_shared_connections(sockets: Vec<S>, config: &StripeConfig) -> Result<Self> {
        Self::build(sockets, config, false)
    }

    fn build(sockets: Vec<S>, config: &StripeConfig, owns_connections: bool) -> Result<Self> {
        if sockets.is_empty() {
            return Err(Error::InvalidConfig("a reader needs at least one connection".into()));
        }
        Ok(Self {
            streams: sockets.len(),
            sockets,
            controls: Vec::new(),
            owns_connections,
            max_len: config.max_accepted_len,
            read_timeout: config.read_timeout,
            deadline: None,
            shared: Arc::new(Shared::new()),
            workers: Vec::new(),
            phase: Phase::Idle,
            pending: None,
        })
    }

    /// Number of connections the stream is striped over.
    pub fn streams(&self) -> usize {
        self.streams
    }

    /// Bytes taken off the queue so far.
    pub fn written(&self) -> u64 {
        self.shared.inbox.lock().written
    }

    /// Whether every connection delivered its EOD segment and everything was read.
    pub fn is_drained(&self) -> bool {
        self.phase == Phase::Drained
    }

    /// Bounds every following read; `None` removes the bound.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Handle to abort a blocked read from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.shared.clone())
    }

    /// Reads the next bytes of the logical stream.
    ///
    /// Blocks until the segment starting at the next expected offset has
    /// arrived. Returns `Ok(0)` once every connection delivered its EOD segment
    /// and nothing is left; a failed connection surfaces as an error instead.
    /// A segment larger than `buf` is handed out over several calls.
    pub fn read_ordered(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.phase {
            Phase::Closed => return Err(Error::Closed),
            Phase::Failed => return Err(Error::Aborted),
            Phase::Drained => return Ok(0),
            Phase::Idle | Phase::Dispatched => {}
        }
        if self.shared.is_cancelled() {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(n) = self.take_pending(buf) {
            return Ok(n);
        }
        if self.phase == Phase::Idle {
            self.dispatch()?;
        }

        let deadline = self.effective_deadline();
        loop {
            let segment = match self.next_segment(deadline) {
                Ok(Some(segment)) => segment,
                Ok(None) => {
                    log::debug!("All {} streams drained", self.streams);
                    self.phase = Phase::Drained;
                    self.reap();
                    return Ok(0);
                }
                Err(err) => {
                    match err {
                        Error::Timeout | Error::Closed => {}
                        _ => self.phase = Phase::Failed,
                    }
                    return Err(err);
                }
            };
            if segment.is_empty() {
                continue;
            }
            let n = buf.len().min(segment.len());
            buf[..n].copy_from_slice(&segment.data[..n]);
            if n < segment.len() {
                self.pending = Some(Pending {
                    data: segment.data,
                    pos: n,
                });
            }
            return Ok(n);
        }
    }

    /// Stops the workers and drops everything queued. The connections are
    /// closed only when this reader owns them.
    pub fn close(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        self.phase = Phase::Closed;
        self.pending = None;
        self.shared.cancel();

        if !self.owns_connections {
            // Workers return once the owner closes the connections.
            self.workers.clear();
            self.sockets.clear();
            return Ok(());
        }

        let mut result = Ok(());
        for socket in self.controls.iter_mut().chain(self.sockets.iter_mut()) {
            if let Err(e) = socket.close() {
                log::warn!("Failed to close connection: {e}");
                if result.is_ok() {
                    result = Err(Error::Connection(e));
                }
            }
        }
        self.reap();
        result
    }

    fn dispatch(&mut self) -> Result<()> {
        // Connections stay with the reader until every control handle exists,
        // so a failed clone can be retried by the next read.
        if self.owns_connections && self.controls.is_empty() {
            self.controls = self
                .sockets
                .iter()
                .map(|s| s.try_clone())
                .collect::<std::io::Result<Vec<_>>>()?;
        }
        let sockets = std::mem::take(&mut self.sockets);
        self.phase = Phase::Dispatched;
        log::debug!("Dispatching {} read workers", sockets.len());

        for (stream, socket) in sockets.into_iter().enumerate() {
            let worker = ReadWorker {
                stream,
                socket,
                max_len: self.max_len,
                shared: self.shared.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("ebm-read-{stream}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    // The connections not yet handed out are gone with the
                    // iterator; the stream cannot be completed anymore.
                    log::error!("Failed to spawn read worker {stream}: {e}");
                    self.phase = Phase::Failed;
                    return Err(Error::Connection(e));
                }
            }
        }
        Ok(())
    }

    fn effective_deadline(&self) -> Option<Instant> {
        let timeout = self.read_timeout.map(|t| Instant::now() + t);
        match (self.deadline, timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Waits for the segment at the next expected offset. `None` means the
    /// stream is drained.
    fn next_segment(&self, deadline: Option<Instant>) -> Result<Option<Segment>> {
        let mut inbox = self.shared.inbox.lock();
        loop {
            if inbox.cancelled {
                return Err(Error::Closed);
            }
            if let Some((stream, err)) = inbox.failure.take() {
                return Err(Error::worker(stream, err));
            }
            if inbox.done == self.streams && inbox.queue.is_empty() {
                return Ok(None);
            }

            let head = inbox.queue.peek().map(|s| (s.offset(), s.is_empty()));
            match head {
                Some((offset, empty)) if empty || offset == inbox.written => {
                    if let Some(segment) = inbox.queue.pop() {
                        self.account(&mut inbox, &segment)?;
                        return Ok(Some(segment));
                    }
                }
                Some((offset, _)) if offset < inbox.written => {
                    return Err(Error::ProtocolDesync(format!(
                        "segment at offset {offset} overlaps data up to {}",
                        inbox.written
                    )));
                }
                _ => {}
            }

            if inbox.exited == self.streams {
                return Err(Error::ProtocolDesync(format!(
                    "all streams ended but offset {} never arrived",
                    inbox.written
                )));
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    let _ = self.shared.ready.wait_until(&mut inbox, deadline);
                }
                None => self.shared.ready.wait(&mut inbox),
            }
        }
    }

    fn account(&self, inbox: &mut Inbox, segment: &Segment) -> Result<()> {
        if let Some(count) = segment.header.eod_count() {
            if count != self.streams as u64 {
                return Err(Error::ProtocolDesync(format!(
                    "peer announced {count} EOD segments, expected {}",
                    self.streams
                )));
            }
        }
        inbox.written += segment.header.byte_count;
        if segment.is_end_of_data() {
            inbox.done += 1;
            log::debug!("Consumed EOD {}/{}", inbox.done, self.streams);
        }
        Ok(())
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> Option<usize> {
        let pending = self.pending.as_mut()?;
        let rest = &pending.data[pending.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        pending.pos += n;
        if pending.pos == pending.data.len() {
            self.pending = None;
        }
        Some(n)
    }

    fn reap(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("A read worker panicked");
            }
        }
    }
}

impl<S: DataSocket> Read for ReaderSocket<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_ordered(buf)?)
    }
}

impl<S: DataSocket> Drop for ReaderSocket<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::debug!("Error closing reader on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{pipe, MemorySocket};
    use crate::segment::HEADER_LEN;
    use std::io::Write;
    use std::sync::mpsc;

    fn send(peer: &mut MemorySocket, segment: Segment) {
        segment.write_to(peer).unwrap();
    }

    fn channel(n: usize, config: &StripeConfig) -> (ReaderSocket<MemorySocket>, Vec<MemorySocket>) {
        let (ours, theirs): (Vec<_>, Vec<_>) = (0..n).map(|_| pipe()).unzip();
        (ReaderSocket::new(ours, config).unwrap(), theirs)
    }

    fn read_all(reader: &mut ReaderSocket<MemorySocket>, chunk: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read_ordered(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn reorders_segments_from_independent_streams() {
        let (mut reader, mut peers) = channel(2, &StripeConfig::default());

        // Stream 1 finishes before stream 0 sends anything.
        send(&mut peers[1], Segment::new(b"EFGH".to_vec(), 4, 0));
        send(&mut peers[1], Segment::end_of_data(12));

        let (tx, rx) = mpsc::channel();
        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 64];
            loop {
                let n = reader.read_ordered(&mut buf).unwrap();
                tx.send(buf[..n].to_vec()).unwrap();
                if n == 0 {
                    return;
                }
            }
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        send(&mut peers[0], Segment::new(b"IJKL".to_vec(), 8, 0));
        send(&mut peers[0], Segment::end_of_data(12));

        let mut out = Vec::new();
        loop {
            let chunk = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        assert_eq!(out, b"ABCDEFGHIJKL");
        consumer.join().unwrap();
    }

    #[test]
    fn small_buffers_keep_the_rest_of_a_segment() {
        let (mut reader, mut peers) = channel(1, &StripeConfig::default());
        send(&mut peers[0], Segment::new(b"ABCDEFG".to_vec(), 0, 0));
        send(&mut peers[0], Segment::end_of_data(7));

        let mut buf = [0u8; 3];
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"ABC");
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"DEF");
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'G');
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 0);
        assert!(reader.is_drained());
    }

    #[test]
    fn end_of_stream_waits_for_every_eod() {
        let config = StripeConfig::default().with_read_timeout(Some(Duration::from_millis(50)));
        let (mut reader, mut peers) = channel(2, &config);
        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        send(&mut peers[0], Segment::end_of_data(4));

        let mut buf = [0u8; 8];
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 4);
        assert!(matches!(reader.read_ordered(&mut buf), Err(Error::Timeout)));

        send(&mut peers[1], Segment::end_of_data(4));
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 0);
        assert_eq!(reader.written(), 4);
    }

    #[test]
    fn zero_offset_eod_from_reference_peers_is_accepted() {
        let (mut reader, mut peers) = channel(2, &StripeConfig::default());
        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        send(&mut peers[0], Segment::end_of_data(0));
        send(&mut peers[1], Segment::new(b"EFGH".to_vec(), 4, 0));
        send(&mut peers[1], Segment::end_of_data(0));

        assert_eq!(read_all(&mut reader, 16).unwrap(), b"ABCDEFGH");
    }

    #[test]
    fn connection_loss_is_an_error_not_eof() {
        let config = StripeConfig::default().with_read_timeout(Some(Duration::from_secs(5)));
        let (mut reader, mut peers) = channel(2, &config);
        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        send(&mut peers[0], Segment::end_of_data(8));
        // Half a header, then the peer goes away.
        peers[1].write_all(&[0u8; HEADER_LEN / 2]).unwrap();
        peers[1].close().unwrap();

        let started = Instant::now();
        let err = read_all(&mut reader, 16).unwrap_err();
        assert!(matches!(err, Error::Worker { stream: 1, .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(reader.read_ordered(&mut [0u8; 4]), Err(Error::Aborted)));
    }

    #[test]
    fn gap_after_all_streams_end_is_reported() {
        let (mut reader, mut peers) = channel(1, &StripeConfig::default());
        send(&mut peers[0], Segment::new(b"EFGH".to_vec(), 4, 0));
        send(&mut peers[0], Segment::end_of_data(8));

        let err = read_all(&mut reader, 16).unwrap_err();
        assert!(matches!(err, Error::ProtocolDesync(_)));
    }

    #[test]
    fn overlapping_segments_desync_then_abort() {
        let (mut reader, mut peers) = channel(2, &StripeConfig::default());
        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        send(&mut peers[1], Segment::new(b"CDEF".to_vec(), 2, 0));

        let err = read_all(&mut reader, 16).unwrap_err();
        assert!(matches!(err, Error::ProtocolDesync(_)), "{err}");
        assert!(matches!(reader.read_ordered(&mut [0u8; 4]), Err(Error::Aborted)));
    }

    /// A connection that cannot be duplicated.
    struct Unclonable(MemorySocket);

    impl Read for Unclonable {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Unclonable {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }

    impl DataSocket for Unclonable {
        fn close(&mut self) -> std::io::Result<()> {
            self.0.close()
        }

        fn try_clone(&self) -> std::io::Result<Self> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
    }

    #[test]
    fn failed_dispatch_keeps_the_connections() {
        let config = StripeConfig::default().with_read_timeout(Some(Duration::from_millis(200)));
        let (ours, mut theirs): (Vec<_>, Vec<_>) = (0..2).map(|_| pipe()).unzip();
        let sockets = ours.into_iter().map(Unclonable).collect();
        let mut reader = ReaderSocket::new(sockets, &config).unwrap();

        for _ in 0..2 {
            let err = reader.read_ordered(&mut [0u8; 4]).unwrap_err();
            assert!(matches!(err, Error::Connection(_)), "{err}");
        }
        assert!(!reader.is_drained());

        reader.close().unwrap();
        assert!(theirs[0].write_all(b"late").is_err());
        assert!(theirs[1].write_all(b"late").is_err());
    }

    #[test]
    fn mismatched_eod_count_desyncs() {
        let (mut reader, mut peers) = channel(1, &StripeConfig::default());
        let mut eod = Segment::end_of_data(3);
        eod.header.add_flags(crate::segment::flag::END_OF_DATA_COUNT);
        send(&mut peers[0], eod);

        assert!(matches!(
            reader.read_ordered(&mut [0u8; 4]),
            Err(Error::ProtocolDesync(_))
        ));
    }

    #[test]
    fn cancel_unblocks_a_waiting_read() {
        let (mut reader, _peers) = channel(2, &StripeConfig::default());
        let handle = reader.cancel_handle();
        let consumer = thread::spawn(move || {
            let result = reader.read_ordered(&mut [0u8; 4]);
            (reader, result)
        });
        thread::sleep(Duration::from_millis(20));
        handle.cancel();

        let (mut reader, result) = consumer.join().unwrap();
        assert!(matches!(result, Err(Error::Closed)));
        reader.close().unwrap();
        assert!(matches!(reader.read_ordered(&mut [0u8; 4]), Err(Error::Closed)));
    }

    #[test]
    fn close_stops_workers_and_connections() {
        let (mut reader, mut peers) = channel(2, &StripeConfig::default());
        send(&mut peers[0], Segment::new(b"ABCD".to_vec(), 0, 0));
        let mut buf = [0u8; 2];
        assert_eq!(reader.read_ordered(&mut buf).unwrap(), 2);

        reader.close().unwrap();
        assert!(peers[1].write_all(b"late").is_err());
    }
}
