//! In-memory signaling, transport and capture doubles for session tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sfu_client::frame_crypto::{FrameDecryptor, FrameEncryptor};
use sfu_client::transport::{
    ConnectionStats, EncodingParameters, TrackSettings, TransceiverDirection, TransceiverStats,
    VideoConstraints,
};
use sfu_client::{
    FrameKey, KeyWrapper, LocalMediaSource, MediaTrack, MediaTransport, MediaType, SessionHandle,
    SessionObserver, SessionParams, SfuClientError, SfuResult, SignalingChannel,
    SignalingConnector, SignalingEvent, Transceiver, TransportEvent, TransportFactory,
};
use sfu_config::ClientConfig;
use sfu_types::TermCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a test waits for the session to produce something
pub const WAIT: Duration = Duration::from_secs(5);

/// The server side of one signaling connection
pub struct ServerEnd {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<SignalingEvent>,
}

impl ServerEnd {
    pub async fn next_message(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("no message from the client")
            .expect("signaling channel closed");
        serde_json::from_str(&text).unwrap()
    }

    /// Next message with action `action`; other actions are skipped
    pub async fn expect(&mut self, action: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message["a"] == action {
                return message;
            }
        }
    }

    /// Fail if the client sends an `action` message within `window`
    pub async fn assert_no(&mut self, action: &str, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(text)) = tokio::time::timeout_at(deadline, self.sent.recv()).await {
            let message: Value = serde_json::from_str(&text).unwrap();
            assert_ne!(message["a"], action, "unexpected message: {}", message);
        }
    }

    pub fn push(&self, message: Value) {
        self.inbound
            .send(SignalingEvent::Message(message.to_string()))
            .unwrap();
    }

    pub fn close(&self) {
        let _ = self.inbound.send(SignalingEvent::Closed(Some("server gone".to_string())));
    }

    /// Answer a `JOIN` with our cid and the given participants
    pub fn answer(&self, join: &Value, cid: u32, peers: Value) {
        self.push(serde_json::json!({
            "a": "ANSWER",
            "cid": cid,
            "sdp": join["sdp"].clone(),
            "t": 1500,
            "peers": peers,
        }));
    }
}

/// Hands every new connection's server end to the test
pub struct MockConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    refuse: Mutex<bool>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { servers, refuse: Mutex::new(false) }), rx)
    }

    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }
}

#[async_trait]
impl SignalingConnector for MockConnector {
    async fn connect(&self, url: &str) -> SfuResult<SignalingChannel> {
        if *self.refuse.lock().unwrap() {
            return Err(SfuClientError::Signaling(format!("connection to {} refused", url)));
        }
        let (outgoing, sent) = mpsc::unbounded_channel();
        let (inbound, incoming) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd { sent, inbound });
        Ok(SignalingChannel { outgoing, incoming })
    }
}

pub struct MockTrack {
    id: String,
    kind: MediaType,
}

#[async_trait]
impl MediaTrack for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }
    fn kind(&self) -> MediaType {
        self.kind
    }
    fn label(&self) -> String {
        self.id.clone()
    }
    fn settings(&self) -> TrackSettings {
        TrackSettings { width: Some(640), height: Some(360), frame_rate: Some(30.0) }
    }
    async fn apply_constraints(&self, _constraints: VideoConstraints) -> SfuResult<()> {
        Ok(())
    }
    fn stop(&self) {}
}

pub struct MockSource;

#[async_trait]
impl LocalMediaSource for MockSource {
    async fn open_microphone(&self) -> SfuResult<Arc<dyn MediaTrack>> {
        Ok(Arc::new(MockTrack { id: "mic".to_string(), kind: MediaType::Audio }))
    }
    async fn open_camera(&self, _constraints: VideoConstraints) -> SfuResult<Arc<dyn MediaTrack>> {
        Ok(Arc::new(MockTrack { id: "camera".to_string(), kind: MediaType::Video }))
    }
    async fn open_screen(&self, _max_height: u32) -> SfuResult<Arc<dyn MediaTrack>> {
        Ok(Arc::new(MockTrack { id: "screen:0:0".to_string(), kind: MediaType::Video }))
    }
}

pub struct MockTransceiver {
    mid: u32,
    kind: MediaType,
    direction: TransceiverDirection,
    encryptor: Mutex<Option<Arc<FrameEncryptor>>>,
}

#[async_trait]
impl Transceiver for MockTransceiver {
    fn mid(&self) -> Option<u32> {
        Some(self.mid)
    }
    fn kind(&self) -> MediaType {
        self.kind
    }
    fn direction(&self) -> TransceiverDirection {
        self.direction
    }
    async fn replace_track(&self, _track: Option<Arc<dyn MediaTrack>>) -> SfuResult<()> {
        Ok(())
    }
    async fn set_encoding_parameters(&self, _params: EncodingParameters) -> SfuResult<()> {
        Ok(())
    }
    fn install_frame_transforms(
        &self,
        encryptor: Option<Arc<FrameEncryptor>>,
        _decryptor: Arc<FrameDecryptor>,
    ) -> SfuResult<()> {
        *self.encryptor.lock().unwrap() = encryptor;
        Ok(())
    }
    async fn stats(&self) -> SfuResult<TransceiverStats> {
        Ok(TransceiverStats::default())
    }
    fn sender_audio_level(&self) -> Option<f64> {
        None
    }
    fn receiver_audio_level(&self) -> Option<f64> {
        None
    }
}

const VIDEO_SECTION: &[&str] = &[
    "m=video 9 UDP/TLS/RTP/SAVPF 96 97",
    "c=IN IP4 0.0.0.0",
    "a=rtcp:9 IN IP4 0.0.0.0",
    "a=ice-ufrag:abcd",
    "a=ice-pwd:0123456789abcdefghijkl",
    "a=setup:actpass",
    "a=rtcp-mux",
    "a=rtpmap:96 VP8/90000",
    "a=rtpmap:97 rtx/90000",
    "a=fmtp:97 apt=96",
];

const AUDIO_SECTION: &[&str] = &[
    "m=audio 9 UDP/TLS/RTP/SAVPF 111",
    "c=IN IP4 0.0.0.0",
    "a=rtcp:9 IN IP4 0.0.0.0",
    "a=ice-ufrag:abcd",
    "a=ice-pwd:0123456789abcdefghijkl",
    "a=setup:actpass",
    "a=rtcp-mux",
    "a=rtpmap:111 opus/48000/2",
];

/// Offer with the two outbound video tracks and the outbound audio track
pub fn offer() -> String {
    let mut lines: Vec<String> = [
        "v=0",
        "o=- 4611731400430051336 2 IN IP4 127.0.0.1",
        "s=-",
        "t=0 0",
        "a=group:BUNDLE 0 1 2",
        "a=msid-semantic: WMS stream1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for (mid, track_id, ssrc) in [(0, "vthumb", 1001), (1, "hires", 1101)] {
        lines.extend(VIDEO_SECTION.iter().map(|s| s.to_string()));
        lines.push(format!("a=mid:{}", mid));
        lines.push("a=sendrecv".to_string());
        lines.push(format!("a=msid:stream1 {}", track_id));
        for ssrc in [ssrc, ssrc + 1] {
            lines.push(format!("a=ssrc:{} cname:stream1", ssrc));
            lines.push(format!("a=ssrc:{} msid:stream1 {}", ssrc, track_id));
        }
        lines.push(format!("a=ssrc-group:FID {} {}", ssrc, ssrc + 1));
    }
    lines.extend(AUDIO_SECTION.iter().map(|s| s.to_string()));
    lines.push("a=mid:2".to_string());
    lines.push("a=sendrecv".to_string());
    lines.push("a=msid:stream1 mic".to_string());
    lines.push("a=ssrc:2001 cname:stream1".to_string());
    lines.push("a=ssrc:2001 msid:stream1 mic".to_string());
    lines.join("\r\n") + "\r\n"
}

pub struct MockTransport {
    next_mid: AtomicU32,
    events: mpsc::UnboundedSender<TransportEvent>,
    reject_remote: bool,
    transceivers: Mutex<Vec<Arc<MockTransceiver>>>,
    pub closed: Mutex<bool>,
    pub remote: Mutex<Option<String>>,
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn add_transceiver(
        &self,
        kind: MediaType,
        direction: TransceiverDirection,
    ) -> SfuResult<Arc<dyn Transceiver>> {
        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let transceiver = Arc::new(MockTransceiver {
            mid,
            kind,
            direction,
            encryptor: Mutex::new(None),
        });
        self.transceivers.lock().unwrap().push(transceiver.clone());
        Ok(transceiver)
    }
    async fn create_offer(&self) -> SfuResult<String> {
        Ok(offer())
    }
    async fn set_local_description(&self, _sdp: &str) -> SfuResult<()> {
        Ok(())
    }
    async fn set_remote_description(&self, sdp: &str) -> SfuResult<()> {
        if self.reject_remote {
            return Err(SfuClientError::Transport("answer rejected".to_string()));
        }
        *self.remote.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }
    async fn stats(&self) -> SfuResult<ConnectionStats> {
        Err(SfuClientError::Transport("no candidate pair".to_string()))
    }
    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

impl MockTransport {
    pub fn fail(&self) {
        let _ = self.events.send(TransportEvent::Failed);
    }

    /// Key id of a frame sent on the thumbnail track, `None` while no
    /// send key is active
    pub fn sent_key_id(&self) -> Option<u8> {
        let transceivers = self.transceivers.lock().unwrap();
        let encryptor = transceivers[0].encryptor.lock().unwrap().clone()?;
        let packet = encryptor.encrypt(b"frame").unwrap()?;
        Some(packet[0])
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    reject_remote: AtomicBool,
}

impl MockTransportFactory {
    /// Make transports created from now on reject the remote description
    pub fn reject_remote(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SfuResult<Arc<dyn MediaTransport>> {
        let transport = Arc::new(MockTransport {
            next_mid: AtomicU32::new(0),
            events,
            reject_remote: self.reject_remote.load(Ordering::SeqCst),
            transceivers: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            remote: Mutex::new(None),
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

/// Wraps a key as `<user id>:<hex key>`
pub struct PlainKeyWrapper;

#[async_trait]
impl KeyWrapper for PlainKeyWrapper {
    async fn wrap_key(&self, key: &FrameKey, peer_user_id: &str) -> anyhow::Result<String> {
        Ok(format!("{}:{}", peer_user_id, hex::encode(key)))
    }

    async fn unwrap_key(&self, wrapped: &str, peer_user_id: &str) -> anyhow::Result<FrameKey> {
        let (user_id, key) = wrapped
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("malformed wrapped key"))?;
        anyhow::ensure!(user_id == peer_user_id, "key wrapped for {}", user_id);
        let bytes = hex::decode(key)?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("wrong key length"))
    }
}

/// Records observer callbacks as short strings
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn on_connecting(&self) {
        self.record("connecting".to_string());
    }
    fn on_connected(&self) {
        self.record("connected".to_string());
    }
    fn on_joined(&self) {
        self.record("joined".to_string());
    }
    fn on_disconnect(&self, code: TermCode, will_retry: bool) {
        self.record(format!("disconnect:{}:{}", code.code(), will_retry));
    }
    fn on_peer_joined(&self, peer: &sfu_client::PeerView) {
        self.record(format!("peer_joined:{}", peer.cid));
    }
    fn on_peer_left(&self, peer: &sfu_client::PeerView, reason: TermCode) {
        self.record(format!("peer_left:{}:{}", peer.cid, reason.code()));
    }
    fn on_server_warning(&self, warning: &str) {
        self.record(format!("warning:{}", warning));
    }
    fn on_moderator(&self, moderator: bool) {
        self.record(format!("moderator:{}", moderator));
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        sfu_url: Some("wss://sfu.test/ws".to_string()),
        max_active_speakers: 1,
        max_input_video_tracks: 2,
        ..ClientConfig::default()
    }
}

pub struct Harness {
    pub handle: SessionHandle,
    pub observer: Arc<RecordingObserver>,
    pub connector: Arc<MockConnector>,
    pub transports: Arc<MockTransportFactory>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    pub fn start(config: ClientConfig) -> Self {
        sfu_logging::try_init_test_logging("debug");
        let observer = Arc::new(RecordingObserver::default());
        let (connector, servers) = MockConnector::new();
        let transports = Arc::new(MockTransportFactory::default());
        let handle = SessionHandle::spawn(SessionParams {
            url: None,
            call_id: "call-1".to_string(),
            user_id: "me".to_string(),
            call_key: None,
            is_group: false,
            moderator: false,
            speak: false,
            initial_vthumbs: None,
            config,
            observer: observer.clone(),
            key_wrapper: Arc::new(PlainKeyWrapper),
            transport: transports.clone(),
            media_source: Arc::new(MockSource),
            connector: connector.clone(),
            telemetry: None,
        })
        .unwrap();
        Self { handle, observer, connector, transports, servers }
    }

    /// Wait for the session to open its next signaling connection
    pub async fn next_server(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("client did not connect")
            .unwrap()
    }

    pub async fn no_connection_within(&mut self, window: Duration) {
        assert!(tokio::time::timeout(window, self.servers.recv()).await.is_err());
    }

    /// Connect and complete the join with `cid` and `peers`
    pub async fn join(&mut self, cid: u32, peers: Value) -> (ServerEnd, Value) {
        self.handle.connect().await.unwrap();
        let mut server = self.next_server().await;
        let join = server.expect("JOIN").await;
        server.answer(&join, cid, peers);
        (server, join)
    }

    pub async fn wait_for_state(&self, state: sfu_client::SessionState) {
        let mut rx = self.handle.subscribe_state();
        tokio::time::timeout(WAIT, rx.wait_for(|current| *current == state))
            .await
            .expect("state not reached")
            .unwrap();
    }
}

/// Recipients of a `KEY` message with their unwrapped keys
pub fn key_recipients(message: &Value) -> Vec<(u64, String)> {
    let mut recipients: Vec<(u64, String)> = message["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| {
            let cid = entry[0].as_u64().unwrap();
            let wrapped = entry[1].as_str().unwrap();
            let user = wrapped.split(':').next().unwrap().to_string();
            (cid, user)
        })
        .collect();
    recipients.sort();
    recipients
}

pub fn peer(cid: u32, user_id: &str) -> Value {
    serde_json::json!({ "cid": cid, "userId": user_id, "av": 0 })
}
