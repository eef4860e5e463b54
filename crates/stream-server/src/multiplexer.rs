//! Connection Multiplexer
//!
//! Owns the listening socket and a fixed-size client slot table. A single
//! `poll_once` call accepts at most one connection into a pending position
//! (or closes it straight away when every slot is taken) and reports which
//! client sockets have data to read.

use crate::error::{MuxError, ServerError};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: u32 = 1024;

/// Where a server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    /// Filesystem unix socket; a stale file at the path is removed on bind
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Index into the client slot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Accepted client socket
#[derive(Debug)]
pub enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    /// Non-blocking read
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.try_read(buf),
        }
    }

    /// Non-blocking write; may write fewer bytes than given
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.try_write(buf),
        }
    }

    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self {
            ClientStream::Tcp(s) => s.poll_read_ready(cx),
            #[cfg(unix)]
            ClientStream::Unix(s) => s.poll_read_ready(cx),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(ClientStream, String)>> {
        match self {
            Listener::Tcp(l) => l
                .poll_accept(cx)
                .map_ok(|(s, addr)| (ClientStream::Tcp(s), addr.to_string())),
            #[cfg(unix)]
            Listener::Unix(l, path) => l
                .poll_accept(cx)
                .map_ok(|(s, _)| (ClientStream::Unix(s), path.display().to_string())),
        }
    }
}

struct ClientSlot {
    stream: Arc<ClientStream>,
    peer: String,
    authenticated: bool,
    connected_at: Instant,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Option<ClientSlot>>,
    pending: Option<(ClientStream, String)>,
}

impl Registry {
    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Result of one poll iteration
#[derive(Debug, Default)]
pub struct PollEvents {
    /// A connection is waiting for `create_client`
    pub new_connection: bool,
    /// Clients with data (or EOF) to read
    pub readable: Vec<SlotId>,
    /// Accept failed (e.g. file descriptors exhausted)
    pub accept_error: Option<io::Error>,
}

impl PollEvents {
    pub fn is_empty(&self) -> bool {
        !self.new_connection && self.readable.is_empty() && self.accept_error.is_none()
    }
}

/// Listening socket plus client slot table
pub struct ConnectionMultiplexer {
    listener: Listener,
    endpoint: Endpoint,
    max_clients: usize,
    registry: Mutex<Registry>,
}

impl ConnectionMultiplexer {
    /// Bind and listen on `endpoint` with room for `max_clients` clients
    pub async fn bind(endpoint: &Endpoint, max_clients: usize) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let (listener, endpoint) = match endpoint {
            Endpoint::Tcp(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(bind_err)?;
                socket.set_reuseaddr(true).map_err(bind_err)?;
                socket.bind(*addr).map_err(bind_err)?;
                let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                (Listener::Tcp(listener), Endpoint::Tcp(local))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path).map_err(bind_err)?;
                }
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                (
                    Listener::Unix(listener, path.clone()),
                    Endpoint::Unix(path.clone()),
                )
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )))
            }
        };

        info!("Listening on {} ({} client slots)", endpoint, max_clients);

        let mut registry = Registry::default();
        registry.slots.resize_with(max_clients, || None);

        Ok(Self {
            listener,
            endpoint,
            max_clients,
            registry: Mutex::new(registry),
        })
    }

    /// Bound endpoint (with the actual port for TCP)
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.endpoint {
            Endpoint::Tcp(addr) => Some(addr),
            Endpoint::Unix(_) => None,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for a connection or readable client
    ///
    /// A zero timeout checks readiness once without waiting.
    pub async fn poll_once(&self, timeout: Duration) -> PollEvents {
        tokio::time::timeout(timeout, poll_fn(|cx| self.poll_ready(cx)))
            .await
            .unwrap_or_default()
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<PollEvents> {
        let mut registry = self.registry();
        let mut events = PollEvents::default();

        loop {
            if registry.pending.is_some() {
                events.new_connection = true;
                break;
            }
            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, peer))) => {
                    if registry.free_slot().is_none() {
                        warn!(
                            "All {} client slots in use, rejecting {}",
                            self.max_clients, peer
                        );
                        metrics::counter!("irrv_connections_rejected_total").increment(1);
                        drop(stream);
                        continue;
                    }
                    debug!("Accepted connection from {}", peer);
                    registry.pending = Some((stream, peer));
                }
                Poll::Ready(Err(e)) => {
                    if e.raw_os_error() == Some(libc::EMFILE) {
                        error!("Accept failed on {}: file descriptors exhausted", self.endpoint);
                    } else {
                        error!("Accept failed on {}: {}", self.endpoint, e);
                    }
                    events.accept_error = Some(e);
                    break;
                }
                Poll::Pending => break,
            }
        }

        for (index, slot) in registry.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.stream.poll_read_ready(cx).is_ready() {
                    events.readable.push(SlotId(index));
                }
            }
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }

    /// Move the pending connection into a free slot
    ///
    /// Returns `Ok(None)` when no connection is pending.
    pub fn create_client(&self) -> Result<Option<SlotId>, MuxError> {
        let mut registry = self.registry();
        let Some((stream, peer)) = registry.pending.take() else {
            return Ok(None);
        };

        let Some(index) = registry.free_slot() else {
            warn!("No free slot for {}, closing", peer);
            return Err(MuxError::SlotsExhausted(self.max_clients));
        };

        info!("Client {} connected from {}", SlotId(index), peer);
        registry.slots[index] = Some(ClientSlot {
            stream: Arc::new(stream),
            peer,
            authenticated: false,
            connected_at: Instant::now(),
        });
        Ok(Some(SlotId(index)))
    }

    /// Close a client and free its slot; closing a free slot is a no-op
    pub fn close_client(&self, slot: SlotId) -> bool {
        let closed = self
            .registry()
            .slots
            .get_mut(slot.0)
            .and_then(Option::take);

        match closed {
            Some(client) => {
                info!(
                    "Client {} ({}) closed after {:?}",
                    slot,
                    client.peer,
                    client.connected_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Socket of an occupied slot
    pub fn stream(&self, slot: SlotId) -> Option<Arc<ClientStream>> {
        self.registry()
            .slots
            .get(slot.0)
            .and_then(|s| s.as_ref())
            .map(|s| Arc::clone(&s.stream))
    }

    /// Non-blocking read from a client
    pub fn try_read(&self, slot: SlotId, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream(slot) {
            Some(stream) => stream.try_read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "slot is free")),
        }
    }

    pub fn mark_authenticated(&self, slot: SlotId) {
        if let Some(Some(client)) = self.registry().slots.get_mut(slot.0) {
            client.authenticated = true;
        }
    }

    pub fn is_authenticated(&self, slot: SlotId) -> bool {
        matches!(self.registry().slots.get(slot.0), Some(Some(c)) if c.authenticated)
    }

    /// Occupied slots
    pub fn clients(&self) -> Vec<SlotId> {
        self.registry()
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| SlotId(i))
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.registry().count()
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Listener::Unix(_, path) = &self.listener {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!("Could not remove socket {}: {}", path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    fn loopback() -> Endpoint {
        Endpoint::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    async fn accept_one(mux: &ConnectionMultiplexer) -> SlotId {
        for _ in 0..100 {
            let events = mux.poll_once(Duration::from_millis(20)).await;
            if events.new_connection {
                if let Some(slot) = mux.create_client().unwrap() {
                    return slot;
                }
            }
        }
        panic!("connection never became pending");
    }

    #[tokio::test]
    async fn test_create_client_without_pending() {
        let mux = ConnectionMultiplexer::bind(&loopback(), 2).await.unwrap();
        assert_eq!(mux.create_client(), Ok(None));
        assert!(mux.poll_once(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn test_slot_exhaustion_closes_extra_connection() {
        let mux = ConnectionMultiplexer::bind(&loopback(), 2).await.unwrap();
        let addr = mux.local_addr().unwrap();

        let _a = TcpStream::connect(addr).await.unwrap();
        accept_one(&mux).await;
        let _b = TcpStream::connect(addr).await.unwrap();
        accept_one(&mux).await;
        assert_eq!(mux.client_count(), 2);

        let mut extra = TcpStream::connect(addr).await.unwrap();
        for _ in 0..10 {
            let events = mux.poll_once(Duration::from_millis(20)).await;
            assert!(!events.new_connection);
        }
        assert_eq!(mux.client_count(), 2);

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(2), extra.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_readable_and_close_twice() {
        let mux = ConnectionMultiplexer::bind(&loopback(), 1).await.unwrap();
        let mut client = TcpStream::connect(mux.local_addr().unwrap()).await.unwrap();
        let slot = accept_one(&mux).await;

        client.write_all(&[1, 2, 3]).await.unwrap();
        let mut readable = false;
        for _ in 0..100 {
            if mux.poll_once(Duration::from_millis(20)).await.readable.contains(&slot) {
                readable = true;
                break;
            }
        }
        assert!(readable);

        let mut buf = [0u8; 8];
        assert_eq!(mux.try_read(slot, &mut buf).unwrap(), 3);

        assert!(!mux.is_authenticated(slot));
        mux.mark_authenticated(slot);
        assert!(mux.is_authenticated(slot));

        assert!(mux.close_client(slot));
        assert!(!mux.close_client(slot));
        assert_eq!(mux.client_count(), 0);
        assert!(mux.stream(slot).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_endpoint_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("irrv-sock0");
        std::fs::write(&path, b"stale").unwrap();

        let mux = ConnectionMultiplexer::bind(&Endpoint::Unix(path.clone()), 1)
            .await
            .unwrap();
        let _client = UnixStream::connect(&path).await.unwrap();
        accept_one(&mux).await;
        assert_eq!(mux.client_count(), 1);

        drop(mux);
        assert!(!path.exists());
    }
}
