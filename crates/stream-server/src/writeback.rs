//! Frame Writeback
//!
//! Bounded non-blocking writes to client sockets. Short writes advance and
//! retry; `WouldBlock`/`Interrupted` back off briefly and retry until the
//! send timeout. Any other error is returned and the caller drops the
//! client. A frame that finds the socket full before its first byte is
//! skipped instead of stalling the event loop. Broadcasts share one
//! deadline across all clients via [`FrameWriteback::send_frame_before`].

use crate::error::WritebackError;
use crate::multiplexer::ClientStream;
use irrv_protocol::{encode, Event};
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Sleep between retries when the socket is not writable
pub const DEFAULT_BACKOFF: Duration = Duration::from_micros(100);

/// Outcome of a frame send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// All bytes written
    Sent(usize),
    /// Socket was full; nothing written, frame dropped for this client
    Skipped,
}

#[derive(Debug, Clone)]
pub struct FrameWriteback {
    timeout: Duration,
    backoff: Duration,
}

impl FrameWriteback {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a control-plane event; never skipped
    pub async fn send_event(
        &self,
        stream: &ClientStream,
        event: &Event,
    ) -> Result<usize, WritebackError> {
        let bytes = encode(event);
        let deadline = Instant::now() + self.timeout;
        match self
            .write_parts(stream, &[bytes.as_slice()], false, deadline)
            .await?
        {
            Delivery::Sent(n) => Ok(n),
            Delivery::Skipped => Ok(0),
        }
    }

    /// Send a VFRAME event followed by its data
    pub async fn send_frame(
        &self,
        stream: &ClientStream,
        header: &Event,
        data: &[u8],
    ) -> Result<Delivery, WritebackError> {
        let deadline = Instant::now() + self.timeout;
        self.send_frame_before(stream, header, data, deadline).await
    }

    /// Send a VFRAME event and data, giving up at `deadline`
    ///
    /// A deadline already in the past skips the frame without writing.
    pub async fn send_frame_before(
        &self,
        stream: &ClientStream,
        header: &Event,
        data: &[u8],
        deadline: Instant,
    ) -> Result<Delivery, WritebackError> {
        let delivery = if Instant::now() >= deadline {
            Delivery::Skipped
        } else {
            let head = encode(header);
            self.write_parts(stream, &[head.as_slice(), data], true, deadline)
                .await?
        };
        match delivery {
            Delivery::Sent(n) => {
                metrics::counter!("irrv_frames_sent_total").increment(1);
                metrics::counter!("irrv_bytes_sent_total").increment(n as u64);
            }
            Delivery::Skipped => {
                metrics::counter!("irrv_frames_dropped_total", "reason" => "slow_client")
                    .increment(1);
            }
        }
        Ok(delivery)
    }

    async fn write_parts(
        &self,
        stream: &ClientStream,
        parts: &[&[u8]],
        droppable: bool,
        deadline: Instant,
    ) -> Result<Delivery, WritebackError> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut sent = 0usize;

        for part in parts {
            let mut buf: &[u8] = part;
            while !buf.is_empty() {
                match stream.try_write(buf) {
                    Ok(0) => return Err(WritebackError::Closed),
                    Ok(n) => {
                        sent += n;
                        buf = &buf[n..];
                        if !buf.is_empty() {
                            trace!("Short write: {} of {} bytes", sent, total);
                        }
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        if droppable && sent == 0 {
                            debug!("Client socket full, skipping {} byte frame", total);
                            return Ok(Delivery::Skipped);
                        }
                        if Instant::now() >= deadline {
                            return Err(WritebackError::Timeout { sent, total });
                        }
                        tokio::time::sleep(self.backoff).await;
                    }
                    Err(e) => return Err(WritebackError::Io(e)),
                }
            }
        }

        Ok(Delivery::Sent(sent))
    }
}
