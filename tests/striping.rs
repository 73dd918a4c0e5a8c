use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use ebm_socket::mem::{pipe, MemorySocket};
use ebm_socket::{DataSocket, Distribution, Error, ReaderSocket, Segment, StripeConfig, WriterSocket};
use proptest::prelude::*;
use proptest::sample::select;

fn pipes(n: usize) -> (Vec<MemorySocket>, Vec<MemorySocket>) {
    (0..n).map(|_| pipe()).unzip()
}

/// Splits `payload` into segments dealt round-robin over `streams` connections,
/// each connection closed by an EOD segment.
fn partition(payload: &[u8], streams: usize, max_len: usize) -> Vec<Vec<Segment>> {
    let mut per_stream = vec![Vec::new(); streams];
    for (k, chunk) in payload.chunks(max_len).enumerate() {
        let offset = (k * max_len) as u64;
        per_stream[k % streams].push(Segment::new(chunk.to_vec(), offset, 0));
    }
    for segments in &mut per_stream {
        segments.push(Segment::end_of_data(payload.len() as u64));
    }
    per_stream
}

/// Sends the segments, picking the next connection from `order`.
fn deliver(mut peers: Vec<MemorySocket>, per_stream: Vec<Vec<Segment>>, order: Vec<usize>) {
    let streams = peers.len();
    let mut queues: Vec<_> = per_stream.into_iter().map(|s| s.into_iter()).collect();
    let mut picks = order.into_iter().chain((0..).map(|i| i % streams.max(1)));
    let mut remaining: usize = queues.iter().map(|q| q.len()).sum();
    while remaining > 0 {
        let Some(pick) = picks.next() else { break };
        let start = pick % streams;
        let next = (0..streams)
            .map(|i| (start + i) % streams)
            .find_map(|i| queues[i].next().map(|s| (i, s)));
        if let Some((i, segment)) = next {
            segment.write_to(&mut peers[i]).unwrap();
            remaining -= 1;
            thread::yield_now();
        }
    }
}

fn read_all<R: Read>(reader: &mut R, chunk: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn any_delivery_order_reproduces_the_payload(
        payload in prop::collection::vec(any::<u8>(), 1..2048),
        streams in select(vec![1usize, 2, 4, 8]),
        max_len in 1usize..64,
        order in prop::collection::vec(0usize..8, 0..256),
        chunk in 1usize..100,
    ) {
        let (ours, theirs) = pipes(streams);
        let mut reader = ReaderSocket::new(ours, &StripeConfig::default()).unwrap();
        let segments = partition(&payload, streams, max_len);
        let sender = thread::spawn(move || deliver(theirs, segments, order));

        let out = read_all(&mut reader, chunk).unwrap();
        sender.join().unwrap();
        prop_assert_eq!(out, payload);
        prop_assert!(reader.is_drained());
    }

    #[test]
    fn writer_and_reader_round_trip(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        streams in select(vec![1usize, 2, 4, 8]),
        max_len in 1usize..300,
        first_available in any::<bool>(),
    ) {
        let distribution = if first_available {
            Distribution::FirstAvailable
        } else {
            Distribution::RoundRobin
        };
        let config = StripeConfig::default()
            .with_max_segment_len(max_len)
            .with_distribution(distribution);
        let (ours, theirs) = pipes(streams);
        let mut writer = WriterSocket::new(ours, &config).unwrap();
        let mut reader = ReaderSocket::new(theirs, &config).unwrap();

        let sent = payload.clone();
        let sender = thread::spawn(move || {
            for part in sent.chunks(97) {
                writer.write_all(part).unwrap();
            }
            writer.close().unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        sender.join().unwrap();
        prop_assert_eq!(out, payload);
    }
}

#[test]
fn abcdefghijkl_arrives_in_order() {
    let config = StripeConfig::default().with_max_segment_len(4);
    let (ours, mut theirs) = pipes(2);
    let mut reader = ReaderSocket::new(ours, &config).unwrap();

    let mut segments = partition(b"ABCDEFGHIJKL", 2, 4);
    assert_eq!(segments[0].len(), 3);
    assert_eq!(segments[1].len(), 2);

    // Connection 1 delivers everything before connection 0 starts.
    for segment in segments.remove(1) {
        segment.write_to(&mut theirs[1]).unwrap();
    }
    let late = theirs.remove(0);
    let first = segments.remove(0);
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        let mut late = late;
        for segment in first {
            segment.write_to(&mut late).unwrap();
        }
    });

    let out = read_all(&mut reader, 64).unwrap();
    sender.join().unwrap();
    assert_eq!(out, b"ABCDEFGHIJKL");
    assert_eq!(reader.written(), 12);
}

/// Fails reads with a connection reset after `budget` bytes.
struct FaultySocket {
    inner: MemorySocket,
    budget: usize,
}

impl Read for FaultySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let len = buf.len().min(self.budget);
        let n = self.inner.read(&mut buf[..len])?;
        self.budget -= n;
        Ok(n)
    }
}

impl Write for FaultySocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl DataSocket for FaultySocket {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(FaultySocket {
            inner: self.inner.try_clone()?,
            budget: self.budget,
        })
    }
}

#[test]
fn failing_connection_aborts_the_transfer() {
    let (ours, mut theirs) = pipes(2);
    let sockets: Vec<FaultySocket> = ours
        .into_iter()
        .enumerate()
        .map(|(i, inner)| FaultySocket {
            inner,
            // Stream 1 dies in the middle of its second payload.
            budget: if i == 1 { 17 + 64 + 17 + 10 } else { usize::MAX },
        })
        .collect();
    let config = StripeConfig::default()
        .with_max_segment_len(64)
        .with_read_timeout(Some(Duration::from_secs(10)));
    let mut reader = ReaderSocket::new(sockets, &config).unwrap();

    let payload: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    let mut writer = WriterSocket::new(theirs.drain(..).collect(), &config).unwrap();
    writer.write_all(&payload).unwrap();
    writer.finish().unwrap();

    let started = Instant::now();
    let err = read_all(&mut reader, 128).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    let source = err.into_inner().unwrap();
    let err = source.downcast::<Error>().unwrap();
    assert!(matches!(*err, Error::Worker { stream: 1, .. }));
}

#[test]
fn reference_peer_eod_layout_is_understood() {
    // Peers that send EOD headers with a zero offset, as classic GridFTP
    // servers do, are read correctly too.
    let (ours, mut theirs) = pipes(2);
    let mut reader = ReaderSocket::new(ours, &StripeConfig::default()).unwrap();
    Segment::new(b"hello ".to_vec(), 0, 0).write_to(&mut theirs[0]).unwrap();
    Segment::new(b"world".to_vec(), 6, 0).write_to(&mut theirs[1]).unwrap();
    for peer in &mut theirs {
        Segment::end_of_data(0).write_to(peer).unwrap();
    }

    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    assert_eq!(out, "hello world");
}
