//! IRRV Stream Server
//!
//! Ties the multiplexer, per-client sessions and writeback together. A
//! primary server streams frames and accepts controls; an auxiliary server
//! accepts controls only. Both share one [`ClientTracker`].

use crate::auth::CredentialSource;
use crate::config::ServerConfig;
use crate::encoder::EncoderControl;
use crate::error::ServerError;
use crate::multiplexer::{ConnectionMultiplexer, Endpoint, SlotId};
use crate::session::{ClientSession, SessionAction};
use crate::writeback::{Delivery, FrameWriteback};
use irrv_protocol::{
    CodecType, Event, EventBody, MessagePayload, MessageType, VFramePayload, FALLBACK_HEIGHT,
    FALLBACK_WIDTH,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;
/// Upper bound on bytes taken from one client per poll
const MAX_READ_PER_POLL: usize = 64 * 1024;

/// Which listener a server is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    /// Streams frames and accepts controls
    Primary,
    /// Accepts controls only
    Auxiliary,
}

/// One encoded packet ready for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
    pub codec: CodecType,
}

#[derive(Debug, Default)]
struct TrackerInner {
    count: AtomicUsize,
    streamed: AtomicBool,
}

/// Connected-client count shared across servers
#[derive(Debug, Clone, Default)]
pub struct ClientTracker {
    inner: Arc<TrackerInner>,
}

impl ClientTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    fn connected(&self) -> usize {
        self.inner.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn disconnected(&self) -> usize {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn mark_streamed(&self) {
        self.inner.streamed.store(true, Ordering::Release);
    }

    /// Whether a frame was streamed since the last call
    fn take_streamed(&self) -> bool {
        self.inner.streamed.swap(false, Ordering::AcqRel)
    }
}

/// Per-server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_clients: usize,
    pub auth_required: bool,
    pub send_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_clients: 8,
            auth_required: false,
            send_timeout: Duration::from_millis(1000),
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_clients: config.max_clients,
            auth_required: config.auth_required,
            send_timeout: config.send_timeout,
        }
    }
}

/// One listening IRRV server
pub struct StreamServer {
    role: ServerRole,
    mux: ConnectionMultiplexer,
    sessions: HashMap<SlotId, ClientSession>,
    encoder: Arc<dyn EncoderControl>,
    credentials: Arc<dyn CredentialSource>,
    auth_required: bool,
    tracker: ClientTracker,
    writeback: FrameWriteback,
}

impl StreamServer {
    pub async fn bind(
        role: ServerRole,
        endpoint: &Endpoint,
        options: ServerOptions,
        encoder: Arc<dyn EncoderControl>,
        credentials: Arc<dyn CredentialSource>,
        tracker: ClientTracker,
    ) -> Result<Self, ServerError> {
        let mux = ConnectionMultiplexer::bind(endpoint, options.max_clients).await?;
        info!("{:?} server ready on {}", role, mux.endpoint());

        Ok(Self {
            role,
            mux,
            sessions: HashMap::new(),
            encoder,
            credentials,
            auth_required: options.auth_required,
            tracker,
            writeback: FrameWriteback::new(options.send_timeout),
        })
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.mux.endpoint()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.mux.local_addr()
    }

    pub fn tracker(&self) -> &ClientTracker {
        &self.tracker
    }

    /// Clients connected to this server
    pub fn client_count(&self) -> usize {
        self.mux.client_count()
    }

    /// Run one poll iteration: accept, read and dispatch
    pub async fn poll(&mut self, timeout: Duration) {
        let events = self.mux.poll_once(timeout).await;

        if let Some(e) = events.accept_error {
            warn!("{:?} server accept error: {}", self.role, e);
            // Avoid spinning while the error condition persists
            tokio::time::sleep(timeout).await;
        }

        if events.new_connection {
            self.accept_client().await;
        }

        for slot in events.readable {
            self.service_client(slot).await;
        }
    }

    async fn accept_client(&mut self) {
        let slot = match self.mux.create_client() {
            Ok(Some(slot)) => slot,
            Ok(None) => return,
            Err(e) => {
                warn!("{:?} server: {}", self.role, e);
                return;
            }
        };

        let mut session = ClientSession::new(
            slot,
            Arc::clone(&self.encoder),
            Arc::clone(&self.credentials),
            self.auth_required,
        );
        let head = session.handshake(self.encoder.stream_info());

        let Some(stream) = self.mux.stream(slot) else {
            return;
        };
        if let Err(e) = self.writeback.send_event(&stream, &head).await {
            warn!("Client {}: failed to send VHEAD: {}", slot, e);
            self.mux.close_client(slot);
            return;
        }

        if session.is_authenticated() {
            self.mux.mark_authenticated(slot);
        }
        self.sessions.insert(slot, session);

        let count = self.tracker.connected();
        metrics::gauge!("irrv_connected_clients").set(count as f64);
        self.encoder.notify_client_count(count);
    }

    async fn service_client(&mut self, slot: SlotId) {
        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut peer_closed = false;

        while data.len() < MAX_READ_PER_POLL {
            match self.mux.try_read(slot, &mut chunk) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Client {}: read failed: {}", slot, e);
                    peer_closed = true;
                    break;
                }
            }
        }

        let Some(session) = self.sessions.get_mut(&slot) else {
            self.mux.close_client(slot);
            return;
        };

        let mut actions = Vec::new();
        if !data.is_empty() {
            match session.feed(&data) {
                Ok(produced) => actions = produced,
                Err(e) => {
                    warn!("Client {}: framing error: {}", slot, e);
                    self.drop_client(slot);
                    return;
                }
            }
            if session.is_authenticated() {
                self.mux.mark_authenticated(slot);
            }
        }

        if peer_closed {
            if let Err(e) = session.on_peer_closed() {
                warn!("Client {}: {}", slot, e);
            }
        }

        for action in actions {
            match action {
                SessionAction::Send(event) => {
                    if !self.send_to(slot, &event).await {
                        return;
                    }
                }
                SessionAction::Close => {
                    self.drop_client(slot);
                    return;
                }
            }
        }

        if peer_closed {
            info!("Client {} disconnected", slot);
            self.drop_client(slot);
        }
    }

    /// Send an event to one client; drops the client on failure
    async fn send_to(&mut self, slot: SlotId, event: &Event) -> bool {
        let Some(stream) = self.mux.stream(slot) else {
            return false;
        };
        match self.writeback.send_event(&stream, event).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Client {}: send failed: {}", slot, e);
                self.drop_client(slot);
                false
            }
        }
    }

    fn drop_client(&mut self, slot: SlotId) {
        if let Some(mut session) = self.sessions.remove(&slot) {
            session.disconnect();
        }
        if !self.mux.close_client(slot) {
            return;
        }

        let remaining = self.tracker.disconnected();
        metrics::gauge!("irrv_connected_clients").set(remaining as f64);
        self.encoder.notify_client_count(remaining);

        if remaining == 0 && self.tracker.take_streamed() {
            info!("Last client disconnected, stopping encoder");
            self.encoder.stop();
        }
    }

    /// Send a frame to every streaming-capable client
    ///
    /// Returns the number of clients that received the whole frame. Slow
    /// clients miss the frame; failing clients are disconnected. All clients
    /// share one send timeout, so clients still waiting when it runs out
    /// miss the frame.
    pub async fn broadcast_frame(&mut self, frame: &EncodedFrame) -> usize {
        if self.role == ServerRole::Auxiliary {
            return 0;
        }

        let header = Event::new(EventBody::VFrame(VFramePayload {
            flags: frame.codec.as_raw(),
            data_size: frame.data.len() as u32,
            video_size: frame.data.len() as u32,
            alpha_size: 0,
            width: if frame.width > 0 { frame.width } else { FALLBACK_WIDTH },
            height: if frame.height > 0 { frame.height } else { FALLBACK_HEIGHT },
            reserved: [0; 2],
        }));

        let mut targets: Vec<SlotId> = self
            .sessions
            .values()
            .filter(|s| s.can_stream())
            .map(|s| s.slot())
            .collect();
        targets.sort();

        let deadline = Instant::now() + self.writeback.timeout();
        let mut delivered = 0;
        let mut failed = Vec::new();
        for slot in targets {
            let Some(stream) = self.mux.stream(slot) else {
                continue;
            };
            let sent = self
                .writeback
                .send_frame_before(&stream, &header, &frame.data, deadline)
                .await;
            match sent {
                Ok(Delivery::Sent(_)) => {
                    if let Some(session) = self.sessions.get_mut(&slot) {
                        session.mark_streaming();
                    }
                    self.tracker.mark_streamed();
                    delivered += 1;
                }
                Ok(Delivery::Skipped) => {}
                Err(e) => {
                    warn!("Client {}: frame send failed: {}", slot, e);
                    failed.push(slot);
                }
            }
        }

        for slot in failed {
            self.drop_client(slot);
        }
        delivered
    }

    /// Send a MESSAGE event to every client past the handshake
    pub async fn send_message(&mut self, msg_type: MessageType, value: u32) -> usize {
        let event = Event::new(EventBody::Message(MessagePayload::new(msg_type, value)));
        let mut targets: Vec<SlotId> = self
            .sessions
            .values()
            .filter(|s| s.accepts_messages())
            .map(|s| s.slot())
            .collect();
        targets.sort();

        let mut delivered = 0;
        for slot in targets {
            if self.send_to(slot, &event).await {
                delivered += 1;
            }
        }
        debug!("{:?} message {:?} sent to {} clients", self.role, msg_type, delivered);
        delivered
    }

    /// Close every client
    pub fn shutdown(&mut self) {
        let slots: Vec<SlotId> = self.mux.clients();
        for slot in slots {
            self.drop_client(slot);
        }
        info!("{:?} server on {} shut down", self.role, self.mux.endpoint());
    }
}
