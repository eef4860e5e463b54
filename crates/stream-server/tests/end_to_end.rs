//! Loopback end-to-end tests: real sockets, the full event loop and the
//! crate's own protocol client.

use dump_writer::RuntimeDumpWriter;
use irrv_protocol::{AuthResult, CodecType, ControlType, MessageType, RoiRegion, VCtrlPayload};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use stream_server::{
    stream_channel, ClientTracker, ControlCall, Credentials, EncodedFrame, Endpoint, IrrvClient,
    EncoderSettings, RecordingEncoder, ServerEvent, ServerOptions, ServerRole, StaticCredentials,
    StreamHandle, StreamServer, Streamer, SyntheticPipeline,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Harness {
    encoder: Arc<RecordingEncoder>,
    handle: StreamHandle,
    primary: SocketAddr,
    auxiliary: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(options: ServerOptions, with_auxiliary: bool) -> Self {
        let encoder = Arc::new(RecordingEncoder::default());
        let credentials = Arc::new(StaticCredentials::default());
        let tracker = ClientTracker::new();
        let loopback = Endpoint::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));

        let primary = StreamServer::bind(
            ServerRole::Primary,
            &loopback,
            options.clone(),
            encoder.clone(),
            credentials.clone(),
            tracker.clone(),
        )
        .await
        .unwrap();
        let primary_addr = primary.local_addr().unwrap();

        let auxiliary = if with_auxiliary {
            Some(
                StreamServer::bind(
                    ServerRole::Auxiliary,
                    &loopback,
                    options,
                    encoder.clone(),
                    credentials,
                    tracker.clone(),
                )
                .await
                .unwrap(),
            )
        } else {
            None
        };
        let auxiliary_addr = auxiliary.as_ref().and_then(|s| s.local_addr());

        let (handle, queues) = stream_channel(8, tracker);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let streamer = Streamer::new(primary, auxiliary, queues, Duration::from_millis(5));
        let task = tokio::spawn(streamer.run(shutdown_rx));

        Self {
            encoder,
            handle,
            primary: primary_addr,
            auxiliary: auxiliary_addr,
            shutdown,
            task,
        }
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        self.task.await.unwrap();
    }
}

fn options(auth_required: bool) -> ServerOptions {
    ServerOptions {
        max_clients: 4,
        auth_required,
        send_timeout: Duration::from_secs(1),
    }
}

fn frame(len: usize) -> EncodedFrame {
    EncodedFrame {
        data: (0..len).map(|i| i as u8).collect(),
        key_frame: true,
        width: 576,
        height: 960,
        codec: CodecType::H264,
    }
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn test_authenticated_client_streams_and_controls() {
    let harness = Harness::start(options(true), false).await;
    let mut client = IrrvClient::connect(harness.primary).await.unwrap();

    let head = within(client.read_head()).await.unwrap();
    assert_eq!((head.width, head.height), (576, 960));
    assert!(head.auth_required);

    let result = within(client.authenticate(&Credentials::default())).await.unwrap();
    assert_eq!(result, AuthResult::Passed);
    assert_eq!(harness.handle.client_count(), 1);

    let sizes = [10usize, 2_000, 20_000];
    for len in sizes {
        assert!(harness.handle.submit_frame(frame(len)));
    }
    for len in sizes {
        let (header, data) = within(client.recv_frame()).await.unwrap();
        assert_eq!(header.data_size as usize, len);
        assert_eq!(header.flags, CodecType::H264.as_raw());
        assert_eq!(data, frame(len).data);
    }

    client
        .send_ctrl(VCtrlPayload::new(ControlType::Bitrate, 4_000_000))
        .await
        .unwrap();
    let encoder = harness.encoder.clone();
    wait_until(|| encoder.count(|c| *c == ControlCall::Bitrate(4_000_000)) == 1).await;

    let regions = [
        RoiRegion {
            x: 0,
            y: 0,
            width: 64,
            height: 64,
            qp_offset: -4,
        },
        RoiRegion {
            x: 128,
            y: 64,
            width: 32,
            height: 32,
            qp_offset: 2,
        },
    ];
    client.send_roi(&regions).await.unwrap();
    wait_until(|| {
        encoder.count(|c| *c == ControlCall::RegionOfInterest(regions.to_vec())) == 1
    })
    .await;

    drop(client);
    let handle = harness.handle.clone();
    wait_until(|| handle.client_count() == 0).await;
    wait_until(|| encoder.count(|c| *c == ControlCall::Stop) == 1).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_wrong_credentials_rejected() {
    let harness = Harness::start(options(true), false).await;
    let mut client = IrrvClient::connect(harness.primary).await.unwrap();
    within(client.read_head()).await.unwrap();

    let wrong = Credentials::parse("irrv_id", "not_the_key").unwrap();
    let result = within(client.authenticate(&wrong)).await.unwrap();
    assert_eq!(result, AuthResult::Failed);

    assert!(within(client.recv_event()).await.is_err());
    let handle = harness.handle.clone();
    wait_until(|| handle.client_count() == 0).await;
    let encoder = harness.encoder.clone();
    wait_until(|| encoder.count(|c| *c == ControlCall::ClientCount(0)) == 1).await;
    assert_eq!(harness.encoder.count(|c| *c == ControlCall::Stop), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_frames_withheld_until_authenticated() {
    let harness = Harness::start(options(true), false).await;
    let mut client = IrrvClient::connect(harness.primary).await.unwrap();
    within(client.read_head()).await.unwrap();
    let handle = harness.handle.clone();
    wait_until(|| handle.client_count() == 1).await;

    assert!(harness.handle.submit_frame(frame(64)));
    let early = tokio::time::timeout(Duration::from_millis(200), client.recv()).await;
    assert!(early.is_err(), "unauthenticated client received {:?}", early);

    let result = within(client.authenticate(&Credentials::default())).await.unwrap();
    assert_eq!(result, AuthResult::Passed);

    assert!(harness.handle.submit_frame(frame(32)));
    let (header, data) = within(client.recv_frame()).await.unwrap();
    assert_eq!(header.data_size, 32);
    assert_eq!(data, frame(32).data);

    harness.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_disconnect_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = ClientTracker::new();
    let (handle, queues) = stream_channel(8, tracker.clone());
    let settings = EncoderSettings::default();
    let dump = Arc::new(RuntimeDumpWriter::new(dir.path(), settings.codec));
    let pipeline = Arc::new(SyntheticPipeline::new(settings, dump, handle.clone()));

    let primary = StreamServer::bind(
        ServerRole::Primary,
        &Endpoint::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)),
        options(true),
        pipeline.clone(),
        Arc::new(StaticCredentials::default()),
        tracker,
    )
    .await
    .unwrap();
    let addr = primary.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(
        Streamer::new(primary, None, queues, Duration::from_millis(5)).run(shutdown_rx),
    );

    let mut client = IrrvClient::connect(addr).await.unwrap();
    within(client.read_head()).await.unwrap();
    wait_until(|| handle.client_count() == 1).await;
    assert!(pipeline.is_encoding());

    drop(client);
    wait_until(|| handle.client_count() == 0).await;
    wait_until(|| !pipeline.is_encoding()).await;

    shutdown.send_replace(true);
    task.await.unwrap();
}

#[tokio::test]
async fn test_auxiliary_server_never_streams() {
    let harness = Harness::start(options(false), true).await;
    let mut primary = IrrvClient::connect(harness.primary).await.unwrap();
    let mut aux = IrrvClient::connect(harness.auxiliary.unwrap()).await.unwrap();
    within(primary.read_head()).await.unwrap();
    within(aux.read_head()).await.unwrap();

    let handle = harness.handle.clone();
    wait_until(|| handle.client_count() == 2).await;

    assert!(harness.handle.submit_frame(frame(100)));
    let (header, _) = within(primary.recv_frame()).await.unwrap();
    assert_eq!(header.data_size, 100);

    aux.send_ctrl(VCtrlPayload::new(ControlType::Keyframe, 0))
        .await
        .unwrap();
    let encoder = harness.encoder.clone();
    wait_until(|| encoder.count(|c| *c == ControlCall::ForceKeyframe) == 1).await;

    // The first thing after VHEAD on the auxiliary link is the message
    harness.handle.send_message(MessageType::VideoFormatChange, 3);
    match within(aux.recv()).await.unwrap() {
        ServerEvent::Message(message) => {
            assert_eq!(message.message_type(), Some(MessageType::VideoFormatChange));
            assert_eq!(message.value, 3);
        }
        other => panic!("expected MESSAGE, got {:?}", other),
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_connection_beyond_capacity_closed() {
    let harness = Harness::start(
        ServerOptions {
            max_clients: 1,
            ..options(false)
        },
        false,
    )
    .await;

    let mut first = IrrvClient::connect(harness.primary).await.unwrap();
    within(first.read_head()).await.unwrap();

    let mut second = IrrvClient::connect(harness.primary).await.unwrap();
    assert!(within(second.read_head()).await.is_err());
    assert_eq!(harness.handle.client_count(), 1);

    harness.stop().await;
}
