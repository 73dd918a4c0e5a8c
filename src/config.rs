//! Settings of a striped channel.

use std::time::Duration;

use crate::{Error, Result};

/// Default payload length of an outgoing segment.
pub const FRAGMENT_SIZE: usize = 8192;

/// Largest segment payload a reader accepts before declaring the stream corrupted.
pub const MAX_ACCEPTED_SEGMENT: usize = 16 * 1024 * 1024;

/// How a [`WriterSocket`](crate::WriterSocket) spreads segments over its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Segment `k` goes to connection `k % n`, written from the caller's thread.
    #[default]
    RoundRobin,
    /// One writer thread per connection pulls from a shared queue, so faster
    /// connections carry more segments.
    FirstAvailable,
}

/// Settings of a striped data channel, supplied when the sockets are built.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Number of parallel connections negotiated by the bonding handshake.
    pub streams: u8,
    /// Maximum payload length of the segments this side sends.
    pub max_segment_len: usize,
    /// Maximum payload length accepted from the peer.
    pub max_accepted_len: usize,
    /// Upper bound on a single `read` waiting for the next in-order segment.
    pub read_timeout: Option<Duration>,
    /// How outgoing segments are assigned to connections.
    pub distribution: Distribution,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            streams: 4,
            max_segment_len: FRAGMENT_SIZE,
            max_accepted_len: MAX_ACCEPTED_SEGMENT,
            read_timeout: None,
            distribution: Distribution::RoundRobin,
        }
    }
}

impl StripeConfig {
    /// Same as [`StripeConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of connections a listener asks its clients for.
    pub fn with_streams(mut self, streams: u8) -> Self {
        self.streams = streams;
        self
    }

    /// Sets the payload length of outgoing segments.
    pub fn with_max_segment_len(mut self, len: usize) -> Self {
        self.max_segment_len = len;
        self
    }

    /// Sets the largest payload accepted from the peer.
    pub fn with_max_accepted_len(mut self, len: usize) -> Self {
        self.max_accepted_len = len;
        self
    }

    /// Bounds every read; `None` lets reads wait indefinitely.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Selects the segment distribution policy.
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.streams == 0 {
            return Err(Error::InvalidConfig("at least one stream is required".into()));
        }
        if self.max_segment_len == 0 {
            return Err(Error::InvalidConfig("max_segment_len must be positive".into()));
        }
        if self.max_segment_len > self.max_accepted_len {
            return Err(Error::InvalidConfig(format!(
                "max_segment_len {} exceeds max_accepted_len {}",
                self.max_segment_len, self.max_accepted_len
            )));
        }
        Ok(())
    }
}
