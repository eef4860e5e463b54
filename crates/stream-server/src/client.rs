//! IRRV Protocol Client
//!
//! Client side of the handshake: read VHEAD, optionally authenticate, then
//! receive frames and messages and send controls. Used by the integration
//! tests and usable as a control tool.

use crate::auth::Credentials;
use crate::error::ServerError;
use irrv_protocol::{
    encode, AuthResult, Event, EventBody, EventHeader, FramingError, MessagePayload, RoiRegion,
    VAuthPayload, VCtrlPayload, VFramePayload, VHeadPayload, HEADER_SIZE, MAX_ROI_REGIONS,
};
#[cfg(unix)]
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

/// Something the server pushed to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// VFRAME header and its data
    Frame(VFramePayload, Vec<u8>),
    Message(MessagePayload),
    Other(Event),
}

pub struct IrrvClient<S> {
    stream: S,
}

impl IrrvClient<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ServerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[cfg(unix)]
impl IrrvClient<UnixStream> {
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> IrrvClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Read one complete event
    pub async fn recv_event(&mut self) -> Result<Event, ServerError> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).await?;

        let parsed = EventHeader::decode(&header)?;
        parsed.validate_size()?;

        let mut bytes = vec![0u8; parsed.event_type.event_size()];
        bytes[..HEADER_SIZE].copy_from_slice(&header);
        self.stream.read_exact(&mut bytes[HEADER_SIZE..]).await?;
        Ok(irrv_protocol::decode(&bytes)?)
    }

    /// Read the next event, pulling frame data after a VFRAME header
    pub async fn recv(&mut self) -> Result<ServerEvent, ServerError> {
        let event = self.recv_event().await?;
        match event.body {
            EventBody::VFrame(frame) => {
                let mut data = vec![0u8; frame.data_size as usize];
                self.stream.read_exact(&mut data).await?;
                Ok(ServerEvent::Frame(frame, data))
            }
            EventBody::Message(message) => Ok(ServerEvent::Message(message)),
            _ => Ok(ServerEvent::Other(event)),
        }
    }

    /// Read the handshake VHEAD
    pub async fn read_head(&mut self) -> Result<VHeadPayload, ServerError> {
        let event = self.recv_event().await?;
        match event.body {
            EventBody::VHead(head) => Ok(head),
            other => Err(ServerError::Protocol(format!(
                "expected VHEAD, got {:?}",
                other.event_type()
            ))),
        }
    }

    /// Send VAUTH and wait for its ack; frames racing the ack are skipped
    pub async fn authenticate(
        &mut self,
        credentials: &Credentials,
    ) -> Result<AuthResult, ServerError> {
        let request = Event::new(EventBody::VAuth(VAuthPayload::request(
            credentials.id,
            credentials.key,
        )));
        self.send_event(&request).await?;

        loop {
            match self.recv().await? {
                ServerEvent::Other(Event {
                    body: EventBody::VAuthAck(ack),
                    ..
                }) => return Ok(ack.auth_result()),
                skipped => debug!("Skipping {:?} while waiting for VAUTH_ACK", skipped),
            }
        }
    }

    /// Next frame; messages in between are skipped
    pub async fn recv_frame(&mut self) -> Result<(VFramePayload, Vec<u8>), ServerError> {
        loop {
            match self.recv().await? {
                ServerEvent::Frame(header, data) => return Ok((header, data)),
                skipped => debug!("Skipping {:?} while waiting for VFRAME", skipped),
            }
        }
    }

    pub async fn send_event(&mut self, event: &Event) -> Result<(), ServerError> {
        self.stream.write_all(&encode(event)).await?;
        Ok(())
    }

    pub async fn send_ctrl(&mut self, ctrl: VCtrlPayload) -> Result<(), ServerError> {
        self.send_event(&Event::new(EventBody::VCtrl(ctrl))).await
    }

    /// Send an ROI chain in a single write
    pub async fn send_roi(&mut self, regions: &[RoiRegion]) -> Result<(), ServerError> {
        if regions.is_empty() || regions.len() > MAX_ROI_REGIONS {
            return Err(FramingError::InvalidRoiCount {
                count: regions.len() as u32,
                max: MAX_ROI_REGIONS,
            }
            .into());
        }

        let mut bytes = Vec::new();
        for (i, region) in regions.iter().enumerate() {
            let count = if i == 0 { regions.len() as u32 } else { 0 };
            bytes.extend(encode(&Event::new(EventBody::VCtrl(region.to_record(count)))));
        }
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irrv_protocol::{ControlType, StreamFormat};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frame_data_follows_header() {
        let (client_end, mut server_end) = duplex(4096);
        let mut client = IrrvClient::new(client_end);

        let head = Event::new(EventBody::VHead(VHeadPayload::new(
            64,
            32,
            StreamFormat::H264Raw,
            false,
        )));
        let frame = Event::new(EventBody::VFrame(VFramePayload {
            data_size: 5,
            ..Default::default()
        }));
        server_end.write_all(&encode(&head)).await.unwrap();
        server_end.write_all(&encode(&frame)).await.unwrap();
        server_end.write_all(&[1, 2, 3, 4, 5]).await.unwrap();

        let parsed = client.read_head().await.unwrap();
        assert_eq!((parsed.width, parsed.height), (64, 32));
        let (header, data) = client.recv_frame().await.unwrap();
        assert_eq!(header.data_size, 5);
        assert_eq!(data, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_send_roi_chain() {
        let (client_end, mut server_end) = duplex(4096);
        let mut client = IrrvClient::new(client_end);
        let regions = [RoiRegion::default(), RoiRegion::default()];
        client.send_roi(&regions).await.unwrap();

        let mut bytes = vec![0u8; 96];
        server_end.read_exact(&mut bytes).await.unwrap();
        let first = irrv_protocol::decode(&bytes[..48]).unwrap();
        let EventBody::VCtrl(ctrl) = first.body else {
            panic!("expected VCTRL");
        };
        assert_eq!(ctrl.control_type(), Some(ControlType::RegionOfInterest));
        assert_eq!(ctrl.value, 2);

        assert!(client.send_roi(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_magic_from_server() {
        let (client_end, mut server_end) = duplex(4096);
        let mut client = IrrvClient::new(client_end);
        server_end.write_all(&[0u8; 48]).await.unwrap();

        assert!(matches!(
            client.recv_event().await,
            Err(ServerError::Framing(FramingError::BadMagic { .. }))
        ));
    }
}
