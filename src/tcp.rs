use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use uuid::Uuid;

use crate::config::StripeConfig;
use crate::multi::MultiSocket;
use crate::{Error, Result};

/// A TCP listener that bonds several connections from one client into a
/// striped [`MultiSocket`].
///
/// The first connection of a client announces itself with a nil id. The
/// listener answers with the number of connections to open and a fresh
/// session id; the client then opens the remaining connections, each
/// presenting that id. Once `config.streams` connections share an id they
/// are returned together.
///
/// ```rust,no_run
/// use ebm_socket::{StripeConfig, StripedListener};
/// use std::io::Read;
///
/// let config = StripeConfig::default().with_streams(3);
/// let mut listener = StripedListener::bind("127.0.0.1:8080", config)?;
/// let (mut stream, addr) = listener.accept()?;
/// let mut received = Vec::new();
/// stream.read_to_end(&mut received)?;
/// println!("{} bytes from {addr}", received.len());
/// # Ok::<(), ebm_socket::Error>(())
/// ```
pub struct StripedListener {
    listener: TcpListener,
    config: StripeConfig,
    accepted_connections: HashMap<Uuid, Vec<TcpStream>>,
}

impl StripedListener {
    /// Binds the listener to `addr`; clients are asked for `config.streams` connections.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: StripeConfig) -> Result<StripedListener> {
        config.validate()?;
        let listener = TcpListener::bind(addr)?;
        Ok(StripedListener {
            listener,
            config,
            accepted_connections: HashMap::new(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until one client completed its set of connections.
    pub fn accept(&mut self) -> Result<(MultiSocket<TcpStream>, SocketAddr)> {
        loop {
            let (stream, addr) = self.listener.accept()?;
            log::debug!("Accepted connection from: {addr}");
            match self.admit(stream, addr) {
                Ok(Some(streams)) => {
                    log::debug!("Bonded {} connections from {addr}", streams.len());
                    return Ok((MultiSocket::new(streams, &self.config)?, addr));
                }
                Ok(None) => {}
                Err(e) => log::warn!("Dropping connection from {addr}: {e}"),
            }
        }
    }

    /// Files `stream` under its session, returning the session once complete.
    fn admit(&mut self, mut stream: TcpStream, addr: SocketAddr) -> Result<Option<Vec<TcpStream>>> {
        stream.set_nodelay(true)?;
        let mut cid_buf = [0u8; 16];
        stream.read_exact(&mut cid_buf)?;
        let cid = Uuid::from_bytes_le(cid_buf);

        if cid.is_nil() {
            let cid = Uuid::new_v4();
            log::debug!("First connection with {addr} associating it with cid: {cid}");
            stream.write_all(&[self.config.streams])?;
            stream.write_all(&cid.to_bytes_le())?;
            stream.flush()?;
            if self.config.streams == 1 {
                return Ok(Some(vec![stream]));
            }
            self.accepted_connections.insert(cid, vec![stream]);
            return Ok(None);
        }

        let Some(streams) = self.accepted_connections.get_mut(&cid) else {
            return Err(Error::ProtocolDesync(format!("unknown session {cid}")));
        };
        streams.push(stream);
        log::debug!("{} connections with {cid}", streams.len());
        if streams.len() < self.config.streams as usize {
            return Ok(None);
        }
        Ok(self.accepted_connections.remove(&cid))
    }
}

/// Opens a striped stream to a [`StripedListener`].
///
/// The listener decides how many connections are opened; the rest of
/// `config` shapes the local reader and writer.
pub fn connect<A: ToSocketAddrs>(addr: A, config: &StripeConfig) -> Result<MultiSocket<TcpStream>> {
    let addresses: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut stream = TcpStream::connect(addresses.as_slice())?;
    stream.set_nodelay(true)?;

    log::debug!("Established first connection, requesting a session");
    stream.write_all(&Uuid::nil().to_bytes_le())?;
    stream.flush()?;
    let mut ns = [0u8; 1];
    stream.read_exact(&mut ns)?;
    let mut cid_buf = [0u8; 16];
    stream.read_exact(&mut cid_buf)?;
    let ns = ns[0];
    if ns == 0 {
        return Err(Error::ProtocolDesync("listener asked for zero streams".into()));
    }
    log::debug!("Session {} will open {ns} streams", Uuid::from_bytes_le(cid_buf));

    let mut streams = vec![stream];
    for _ in 1..ns {
        log::debug!("Establishing another connection");
        let mut s = TcpStream::connect(addresses.as_slice())?;
        s.set_nodelay(true)?;
        s.write_all(&cid_buf)?;
        s.flush()?;
        streams.push(s);
    }
    MultiSocket::new(streams, config)
}
