//! Client Session State Machine
//!
//! `Connected` → (VHEAD sent) → `AwaitingAuth` or `Authenticated` →
//! `Streaming` (first VFRAME sent) → `Disconnected`.

use crate::auth::CredentialSource;
use crate::dispatcher::ControlDispatcher;
use crate::encoder::{EncoderControl, StreamInfo};
use crate::multiplexer::SlotId;
use irrv_protocol::{
    AuthResult, Event, EventBody, EventDecoder, FramingError, VAuthPayload, VHeadPayload,
    FALLBACK_HEIGHT, FALLBACK_WIDTH,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, VHEAD not yet sent
    Connected,
    /// VHEAD sent, waiting for VAUTH
    AwaitingAuth,
    /// Allowed to send controls and receive frames
    Authenticated,
    /// At least one VFRAME sent
    Streaming,
    /// Terminal
    Disconnected,
}

/// What the server must do after feeding bytes to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Send(Event),
    Close,
}

/// Protocol state of one connected client
pub struct ClientSession {
    slot: SlotId,
    state: SessionState,
    auth_required: bool,
    credentials: Arc<dyn CredentialSource>,
    dispatcher: ControlDispatcher,
    decoder: EventDecoder,
}

impl ClientSession {
    pub fn new(
        slot: SlotId,
        encoder: Arc<dyn EncoderControl>,
        credentials: Arc<dyn CredentialSource>,
        auth_required: bool,
    ) -> Self {
        Self {
            slot,
            state: SessionState::Connected,
            auth_required,
            credentials,
            dispatcher: ControlDispatcher::new(encoder),
            decoder: EventDecoder::new(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Build the VHEAD event and advance past `Connected`
    pub fn handshake(&mut self, info: StreamInfo) -> Event {
        let width = if info.width > 0 { info.width } else { FALLBACK_WIDTH };
        let height = if info.height > 0 { info.height } else { FALLBACK_HEIGHT };

        self.state = if self.auth_required {
            SessionState::AwaitingAuth
        } else {
            SessionState::Authenticated
        };

        info!(
            "Client {}: VHEAD {}x{} {:?}, auth {}",
            self.slot,
            width,
            height,
            info.codec,
            if self.auth_required { "required" } else { "off" }
        );

        Event::new(EventBody::VHead(VHeadPayload::new(
            width,
            height,
            info.codec.stream_format(),
            self.auth_required,
        )))
    }

    /// Whether VFRAME events may be sent to this client
    pub fn can_stream(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Streaming
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.can_stream()
    }

    /// Whether asynchronous MESSAGE events may be sent to this client
    pub fn accepts_messages(&self) -> bool {
        !matches!(
            self.state,
            SessionState::Connected | SessionState::Disconnected
        )
    }

    pub fn mark_streaming(&mut self) {
        if self.state == SessionState::Authenticated {
            debug!("Client {} streaming", self.slot);
            self.state = SessionState::Streaming;
        }
    }

    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }

    /// Consume bytes read from the client
    ///
    /// A returned error is fatal for this connection only.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SessionAction>, FramingError> {
        let mut actions = Vec::new();
        if self.state == SessionState::Disconnected {
            return Ok(actions);
        }

        self.decoder.push(bytes);
        loop {
            let event = match self.decoder.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    self.state = SessionState::Disconnected;
                    return Err(e);
                }
            };
            if let Err(e) = self.handle(event, &mut actions) {
                self.state = SessionState::Disconnected;
                return Err(e);
            }
            if self.state == SessionState::Disconnected {
                break;
            }
        }
        Ok(actions)
    }

    fn handle(
        &mut self,
        event: Event,
        actions: &mut Vec<SessionAction>,
    ) -> Result<(), FramingError> {
        if self.dispatcher.is_chaining() {
            return match event.body {
                EventBody::VCtrl(ctrl) => self.dispatcher.dispatch(&ctrl),
                _ => Err(FramingError::UnexpectedEvent {
                    found: event.event_type(),
                }),
            };
        }

        match event.body {
            EventBody::VAuth(request) => self.authenticate(&request, actions),
            EventBody::VCtrl(ctrl) => {
                if self.can_stream() {
                    self.dispatcher.dispatch(&ctrl)?;
                } else {
                    warn!(
                        "Client {}: ignoring control {} before authentication",
                        self.slot, ctrl.ctrl_type
                    );
                }
            }
            other => debug!("Client {}: ignoring {:?}", self.slot, other.event_type()),
        }
        Ok(())
    }

    fn authenticate(&mut self, request: &VAuthPayload, actions: &mut Vec<SessionAction>) {
        if self.state != SessionState::AwaitingAuth {
            warn!("Client {}: unexpected VAUTH in state {:?}", self.slot, self.state);
            return;
        }

        if self.credentials.verify(&request.id, &request.key) {
            info!("Client {}: authentication passed", self.slot);
            self.state = SessionState::Authenticated;
            actions.push(SessionAction::Send(Event::new(EventBody::VAuthAck(
                VAuthPayload::ack(AuthResult::Passed),
            ))));
        } else {
            warn!("Client {}: authentication failed", self.slot);
            self.state = SessionState::Disconnected;
            actions.push(SessionAction::Send(Event::new(EventBody::VAuthAck(
                VAuthPayload::ack(AuthResult::Failed),
            ))));
            actions.push(SessionAction::Close);
        }
    }

    /// Peer closed the connection; reports an unfinished ROI chain
    pub fn on_peer_closed(&mut self) -> Result<(), FramingError> {
        self.state = SessionState::Disconnected;
        self.dispatcher.finish()
    }
}
