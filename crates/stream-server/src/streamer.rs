//! Streamer Event Loop
//!
//! Single task driving the primary server, the optional auxiliary server,
//! queued frames from the encode pipeline and queued MESSAGE events. Frame
//! producers never touch sockets; they go through a [`StreamHandle`].

use crate::server::{ClientTracker, EncodedFrame, StreamServer};
use irrv_protocol::MessageType;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Producer side of the event loop queues
#[derive(Debug, Clone)]
pub struct StreamHandle {
    frames: mpsc::Sender<EncodedFrame>,
    messages: mpsc::UnboundedSender<(MessageType, u32)>,
    tracker: ClientTracker,
}

/// Consumer side of the event loop queues
#[derive(Debug)]
pub struct StreamQueues {
    pub(crate) frames: mpsc::Receiver<EncodedFrame>,
    pub(crate) messages: mpsc::UnboundedReceiver<(MessageType, u32)>,
}

/// Create the queues linking a frame producer to a [`Streamer`]
pub fn stream_channel(
    frame_depth: usize,
    tracker: ClientTracker,
) -> (StreamHandle, StreamQueues) {
    let (frame_tx, frame_rx) = mpsc::channel(frame_depth.max(1));
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    (
        StreamHandle {
            frames: frame_tx,
            messages: msg_tx,
            tracker,
        },
        StreamQueues {
            frames: frame_rx,
            messages: msg_rx,
        },
    )
}

impl StreamHandle {
    /// Queue a frame for broadcast; a full queue drops it
    pub fn submit_frame(&self, frame: EncodedFrame) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("irrv_frames_dropped_total", "reason" => "queue_full")
                    .increment(1);
                debug!("Frame queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a MESSAGE event for every handshaken client
    pub fn send_message(&self, msg_type: MessageType, value: u32) {
        if self.messages.send((msg_type, value)).is_err() {
            debug!("Event loop gone, dropping {:?} message", msg_type);
        }
    }

    /// Clients connected across all servers
    pub fn client_count(&self) -> usize {
        self.tracker.count()
    }
}

pub struct Streamer {
    primary: StreamServer,
    auxiliary: Option<StreamServer>,
    queues: StreamQueues,
    poll_interval: Duration,
}

impl Streamer {
    pub fn new(
        primary: StreamServer,
        auxiliary: Option<StreamServer>,
        queues: StreamQueues,
        poll_interval: Duration,
    ) -> Self {
        Self {
            primary,
            auxiliary,
            queues,
            poll_interval,
        }
    }

    /// Run until `shutdown` flips or its sender is dropped
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        info!(
            "Streamer running (auxiliary server {})",
            if self.auxiliary.is_some() { "on" } else { "off" }
        );

        loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            while let Ok(frame) = self.queues.frames.try_recv() {
                self.primary.broadcast_frame(&frame).await;
            }

            while let Ok((msg_type, value)) = self.queues.messages.try_recv() {
                self.primary.send_message(msg_type, value).await;
                if let Some(aux) = self.auxiliary.as_mut() {
                    aux.send_message(msg_type, value).await;
                }
            }

            // Not raced against the queues; a poll may be mid-write
            poll_servers(&mut self.primary, self.auxiliary.as_mut(), self.poll_interval).await;
        }

        self.primary.shutdown();
        if let Some(aux) = self.auxiliary.as_mut() {
            aux.shutdown();
        }
        info!("Streamer stopped");
    }
}

async fn poll_servers(
    primary: &mut StreamServer,
    auxiliary: Option<&mut StreamServer>,
    timeout: Duration,
) {
    match auxiliary {
        Some(aux) => {
            tokio::join!(primary.poll(timeout), aux.poll(timeout));
        }
        None => primary.poll(timeout).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irrv_protocol::CodecType;

    fn frame() -> EncodedFrame {
        EncodedFrame {
            data: vec![0; 16],
            key_frame: true,
            width: 64,
            height: 32,
            codec: CodecType::H264,
        }
    }

    #[tokio::test]
    async fn test_full_frame_queue_drops() {
        let (handle, mut queues) = stream_channel(2, ClientTracker::new());
        assert!(handle.submit_frame(frame()));
        assert!(handle.submit_frame(frame()));
        assert!(!handle.submit_frame(frame()));

        assert!(queues.frames.recv().await.is_some());
        assert!(handle.submit_frame(frame()));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let (handle, queues) = stream_channel(2, ClientTracker::new());
        drop(queues);
        assert!(!handle.submit_frame(frame()));
        handle.send_message(MessageType::VideoFormatChange, 1);
        assert_eq!(handle.client_count(), 0);
    }
}
