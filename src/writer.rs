//! Sending side of a striped channel.

use std::io::Write;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::config::{Distribution, StripeConfig};
use crate::segment::Segment;
use crate::socket::DataSocket;
use crate::{Error, Result};

enum Job {
    Data(Segment),
    /// Send EOD at this offset and stop.
    Finish(u64),
}

/// Writer threads of the first-available distribution. Each thread owns one
/// connection and hands it back when joined.
struct WriterPool<S> {
    jobs: Option<Sender<Job>>,
    errors: Receiver<(usize, Error)>,
    workers: Vec<JoinHandle<S>>,
}

impl<S: DataSocket> WriterPool<S> {
    fn spawn(sockets: Vec<S>) -> Result<Self> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded(sockets.len() * 4);
        let (errors_tx, errors_rx) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(sockets.len());
        for (stream, socket) in sockets.into_iter().enumerate() {
            let jobs = jobs_rx.clone();
            let errors = errors_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ebm-write-{stream}"))
                .spawn(move || write_worker(stream, socket, jobs, errors))?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(jobs_tx),
            errors: errors_rx,
            workers,
        })
    }

    fn check(&self) -> Result<()> {
        match self.errors.try_recv() {
            Ok((stream, err)) => Err(Error::worker(stream, err)),
            Err(_) => Ok(()),
        }
    }

    fn send(&self, job: Job) -> Result<()> {
        self.check()?;
        let jobs = self.jobs.as_ref().ok_or(Error::Finished)?;
        if jobs.send(job).is_err() {
            // Every worker is gone, so one of them left an error behind.
            self.check()?;
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Stops the workers and returns their connections in stream order.
    fn join(mut self) -> (Vec<S>, Result<()>) {
        self.jobs = None;
        let mut sockets = Vec::with_capacity(self.workers.len());
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(socket) => sockets.push(socket),
                Err(_) => log::warn!("A write worker panicked"),
            }
        }
        let result = self.check();
        (sockets, result)
    }
}

fn write_worker<S: DataSocket>(
    stream: usize,
    mut socket: S,
    jobs: Receiver<Job>,
    errors: Sender<(usize, Error)>,
) -> S {
    for job in jobs.iter() {
        let (segment, last) = match job {
            Job::Data(segment) => (segment, false),
            Job::Finish(offset) => (Segment::end_of_data(offset), true),
        };
        let result = segment
            .write_to(&mut socket)
            .and_then(|_| Ok(socket.flush()?));
        if let Err(err) = result {
            log::error!("Failed to write segment on stream {stream}: {err}");
            let _ = errors.send((stream, err));
            break;
        }
        if last {
            log::debug!("Stream {stream} sent end of data");
            break;
        }
    }
    socket
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Failed,
    Closed,
}

/// Splits one logical byte stream into segments spread over several
/// connections.
///
/// Written bytes are collected until a full segment of `max_segment_len`
/// bytes is available; [`flush`](WriterSocket::flush) sends a shorter one.
/// [`finish`](WriterSocket::finish) ends the logical stream by sending an EOD
/// segment on every connection.
pub struct WriterSocket<S: DataSocket> {
    sockets: Vec<S>,
    streams: usize,
    max_len: usize,
    distribution: Distribution,
    next_offset: u64,
    cursor: usize,
    buffer: Vec<u8>,
    pool: Option<WriterPool<S>>,
    state: State,
}

impl<S: DataSocket> WriterSocket<S> {
    /// Builds a writer owning `sockets`.
    pub fn new(sockets: Vec<S>, config: &StripeConfig) -> Result<Self> {
        config.validate()?;
        if sockets.is_empty() {
            return Err(Error::InvalidConfig("a writer needs at least one connection".into()));
        }
        Ok(Self {
            streams: sockets.len(),
            sockets,
            max_len: config.max_segment_len,
            distribution: config.distribution,
            next_offset: 0,
            cursor: 0,
            buffer: Vec::with_capacity(config.max_segment_len),
            pool: None,
            state: State::Open,
        })
    }

    /// Number of connections.
    pub fn streams(&self) -> usize {
        self.streams
    }

    /// Offset the next segment will carry, i.e. bytes handed to connections so far.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Bytes held back waiting for a full segment.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `bytes` to the logical stream, sending every segment that fills up.
    pub fn write_striped(&mut self, bytes: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut rest = bytes;
        while !rest.is_empty() {
            let take = (self.max_len - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.max_len {
                self.emit()?;
            }
        }
        Ok(bytes.len())
    }

    /// Sends the buffered partial segment, if any.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            self.emit()?;
        }
        if self.pool.is_none() {
            for socket in &mut self.sockets {
                socket.flush()?;
            }
        }
        Ok(())
    }

    /// Ends the logical stream: flushes and sends EOD on every connection.
    pub fn finish(&mut self) -> Result<()> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.flush()?;
        let offset = self.next_offset;
        let result = match self.distribution {
            Distribution::RoundRobin => self
                .sockets
                .iter_mut()
                .try_for_each(|socket| -> Result<()> {
                    Segment::end_of_data(offset).write_to(&mut *socket)?;
                    Ok(socket.flush()?)
                }),
            Distribution::FirstAvailable => self.finish_pool(offset),
        };
        self.state = match result {
            Ok(()) => State::Finished,
            Err(_) => State::Failed,
        };
        log::debug!("Finished stream of {offset} bytes over {} connections", self.streams);
        result
    }

    /// Finishes the stream unless that already happened or failed, then
    /// closes every connection. Reports the first error met.
    pub fn close(&mut self) -> Result<()> {
        let mut result = match self.state {
            State::Closed => return Ok(()),
            State::Open => self.finish(),
            State::Finished | State::Failed => Ok(()),
        };
        if let Some(pool) = self.pool.take() {
            let (sockets, _) = pool.join();
            self.sockets = sockets;
        }
        for socket in &mut self.sockets {
            if let Err(e) = socket.close() {
                log::warn!("Failed to close connection: {e}");
                if result.is_ok() {
                    result = Err(Error::Connection(e));
                }
            }
        }
        self.state = State::Closed;
        result
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            State::Open => Ok(()),
            State::Finished => Err(Error::Finished),
            State::Failed => Err(Error::Aborted),
            State::Closed => Err(Error::Closed),
        }
    }

    fn emit(&mut self) -> Result<()> {
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_len));
        let segment = Segment::new(data, self.next_offset, 0);
        self.next_offset += segment.len() as u64;
        let result = self.send(segment);
        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    fn send(&mut self, segment: Segment) -> Result<()> {
        match self.distribution {
            Distribution::RoundRobin => {
                let stream = self.cursor;
                self.cursor = (self.cursor + 1) % self.streams;
                log::trace!(
                    "Segment at offset {} ({} bytes) on stream {stream}",
                    segment.offset(),
                    segment.len()
                );
                segment.write_to(&mut self.sockets[stream])
            }
            Distribution::FirstAvailable => self.pool()?.send(Job::Data(segment)),
        }
    }

    fn pool(&mut self) -> Result<&WriterPool<S>> {
        if self.pool.is_none() {
            log::debug!("Dispatching {} write workers", self.sockets.len());
            let sockets = std::mem::take(&mut self.sockets);
            self.pool = Some(WriterPool::spawn(sockets)?);
        }
        self.pool.as_ref().ok_or(Error::Closed)
    }

    fn finish_pool(&mut self, offset: u64) -> Result<()> {
        let streams = self.streams;
        let pool = self.pool()?;
        let mut result = Ok(());
        for _ in 0..streams {
            if let Err(e) = pool.send(Job::Finish(offset)) {
                result = Err(e);
                break;
            }
        }
        if let Some(pool) = self.pool.take() {
            let (sockets, joined) = pool.join();
            self.sockets = sockets;
            result = result.and(joined);
        }
        result
    }
}

impl<S: DataSocket> Write for WriterSocket<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.write_striped(buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(WriterSocket::flush(self)?)
    }
}
