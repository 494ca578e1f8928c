//! Group media session
//!
//! A session runs as one task owning all control state: the signaling
//! channel, the slot registry, the participants, the send keys and the
//! quality driver. [`SessionHandle`] talks to it over a request channel.
//! Local media requests (mute, screen sharing, hold) go straight to the
//! shared [`LocalMedia`], which serializes them itself.
//!
//! ```text
//! Disconnected -> Connecting -> Joining -> Joined
//!       ^                                    |
//!       +------ RetryingDisconnected <-------+
//! ```
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


mod handlers;
mod lifecycle;
mod routing;

use crate::backoff::ReconnectBackoff;
use crate::error::{SfuClientError, SfuResult};
use crate::frame_crypto::CryptoContext;
use crate::key_rotation::{PeerChurnTracker, SendKeyManager};
use crate::local_media::{LocalMedia, LocalMediaEvent, LocalMediaStatus, OutboundTransceivers};
use crate::mic_monitor::MicMuteMonitor;
use crate::observer::{KeyWrapper, ObserverHub, SessionObserver};
use crate::peer::{PeerTable, PeerView};
use crate::quality::QualityDriver;
use crate::signaling::{SignalingConnector, SignalingEvent};
use crate::slots::SlotRegistry;
use crate::speaker_detector::SpeakerDetector;
use crate::stats::StatsCollector;
use crate::stats_recorder::{HttpTelemetrySink, StatsRecorder, TelemetrySink};
use crate::transport::{LocalMediaSource, MediaTransport, Transceiver, TransportEvent, TransportFactory};
use sfu_config::ClientConfig;
use sfu_types::{ClientCommand, InboundMessage, TermCode};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Media id of the outbound thumbnail video
pub const THUMB_MID: u32 = 0;
/// Media id of the outbound high-resolution video
pub const HIRES_MID: u32 = 1;
/// Media id of the outbound audio
pub const AUDIO_MID: u32 = 2;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Waiting to reconnect after a retriable failure
    RetryingDisconnected,
    Connecting,
    Joining,
    Joined,
}

impl SessionState {
    /// A connection exists or is being set up
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Joining | SessionState::Joined
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::RetryingDisconnected => "RetryingDisconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Joining => "Joining",
            SessionState::Joined => "Joined",
        };
        f.write_str(name)
    }
}

/// Everything a session needs to run
pub struct SessionParams {
    /// Signaling URL; falls back to `config.sfu_url`
    pub url: Option<String>,
    pub call_id: String,
    pub user_id: String,
    /// Hex encoded call-wide secret mixed into every send key
    pub call_key: Option<String>,
    pub is_group: bool,
    /// Join as a moderator
    pub moderator: bool,
    /// Moderator joining as a speaker
    pub speak: bool,
    /// Number of thumbnails the server may send right after joining
    pub initial_vthumbs: Option<u32>,
    pub config: ClientConfig,
    pub observer: Arc<dyn SessionObserver>,
    pub key_wrapper: Arc<dyn KeyWrapper>,
    pub transport: Arc<dyn TransportFactory>,
    pub media_source: Arc<dyn LocalMediaSource>,
    pub connector: Arc<dyn SignalingConnector>,
    /// Destination of call statistics; an HTTP sink is created from
    /// `config.stats_url` when absent
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub cid: Option<u32>,
    pub moderator: bool,
    pub peers: Vec<PeerView>,
}

type Reply<T> = oneshot::Sender<SfuResult<T>>;

/// Video requests for one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoRequest {
    RequestThumbnail { cid: u32 },
    StopThumbnail { cid: u32 },
    RequestHiRes { cid: u32, divider: u8 },
    StopHiRes { cid: u32 },
    SetHiResDivider { cid: u32, divider: u8 },
}

enum Request {
    Connect(Reply<()>),
    Disconnect(TermCode, Reply<()>),
    /// Send a command while joined
    Send(ClientCommand, Reply<()>),
    Video(VideoRequest, Reply<()>),
    SpeakerDetection(bool),
    InitialVthumbs(Option<u32>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Deferred work delivered back to the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    /// Make a distributed key the active one
    ActivateKey { generation: u64, seq: u64 },
    Reconnect,
    /// Apply the sent screen quality after the high-resolution track started
    ApplyTxQuality { generation: u64 },
}

/// Resources of one connection attempt
struct Connection {
    generation: u64,
    token: CancellationToken,
    transport: Arc<dyn MediaTransport>,
    outbound: Option<OutboundTransceivers>,
    /// Receive-only transceivers, registered once media ids are known
    inbound: Vec<Arc<dyn Transceiver>>,
    signaling: Option<mpsc::UnboundedSender<String>>,
    started_at: std::time::Instant,
    cid: Option<u32>,
    join_offset_ms: u64,
}

struct SessionActor {
    url: String,
    call_id: String,
    user_id: String,
    is_group: bool,
    moderator: bool,
    speak: bool,
    initial_vthumbs: Option<u32>,
    config: ClientConfig,

    hub: ObserverHub,
    key_wrapper: Arc<dyn KeyWrapper>,
    transport_factory: Arc<dyn TransportFactory>,
    connector: Arc<dyn SignalingConnector>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    local_media: Arc<LocalMedia>,
    state_tx: watch::Sender<SessionState>,

    ctx: Arc<CryptoContext>,
    keys: SendKeyManager,
    churn: PeerChurnTracker,
    slots: SlotRegistry,
    peers: PeerTable,
    quality: QualityDriver,
    stats: StatsCollector,
    recorder: StatsRecorder,
    mic: MicMuteMonitor,
    detector: SpeakerDetector,
    backoff: ReconnectBackoff,

    conn: Option<Connection>,
    /// Bumped on every connect and teardown; timers of older generations
    /// are ignored
    generation: u64,
    reconnect_token: Option<CancellationToken>,
    /// Inbound messages held back until the join answer is processed
    pending: Option<Vec<InboundMessage>>,
    /// Connection id to resume on reconnect
    prev_cid: Option<u32>,

    requests: mpsc::UnboundedReceiver<Request>,
    timers_tx: mpsc::UnboundedSender<Timer>,
    timers_rx: mpsc::UnboundedReceiver<Timer>,
    media_rx: mpsc::UnboundedReceiver<LocalMediaEvent>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    signaling_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    stats_interval: Option<Interval>,
    speaker_interval: Option<Interval>,
}

/// Clock used for all session timing; follows tokio's clock so paused
/// test time applies
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    local_media: Arc<LocalMedia>,
}

impl SessionHandle {
    /// Start the session task. The session stays disconnected until
    /// [`connect`](Self::connect) is called.
    pub fn spawn(params: SessionParams) -> SfuResult<Self> {
        params.config.validate()?;
        let url = params
            .url
            .clone()
            .or_else(|| params.config.sfu_url.clone())
            .ok_or_else(|| SfuClientError::Config("no signaling URL configured".to_string()))?;
        let telemetry = match (params.telemetry, &params.config.stats_url) {
            (Some(sink), _) => Some(sink),
            (None, Some(stats_url)) => {
                let sink = HttpTelemetrySink::new(stats_url)
                    .map_err(|e| SfuClientError::Config(e.to_string()))?;
                Some(Arc::new(sink) as Arc<dyn TelemetrySink>)
            }
            (None, None) => None,
        };
        let mut keys = SendKeyManager::new();
        if let Some(call_key) = &params.call_key {
            keys.set_call_secret(call_key)?;
        }

        let config = params.config;
        let hub = ObserverHub::new(params.observer);
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let local_media = Arc::new(LocalMedia::new(params.media_source, hub.clone(), media_tx));
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let ctx = Arc::new(CryptoContext::new());

        let actor = SessionActor {
            url,
            call_id: params.call_id,
            user_id: params.user_id,
            is_group: params.is_group,
            moderator: params.moderator,
            speak: params.speak,
            initial_vthumbs: params.initial_vthumbs,
            hub: hub.clone(),
            key_wrapper: params.key_wrapper,
            transport_factory: params.transport,
            connector: params.connector,
            telemetry,
            local_media: local_media.clone(),
            state_tx,
            ctx: ctx.clone(),
            keys,
            churn: PeerChurnTracker::new(config.peer_reconnect_no_rotation()),
            slots: SlotRegistry::new(ctx),
            peers: PeerTable::new(hub),
            quality: QualityDriver::new(),
            stats: StatsCollector::new(),
            recorder: StatsRecorder::new(),
            mic: MicMuteMonitor::new(config.mic_silence_warning()),
            detector: SpeakerDetector::new(config.speaker_min_change_interval()),
            backoff: ReconnectBackoff::from_config(&config),
            config,
            conn: None,
            generation: 0,
            reconnect_token: None,
            pending: None,
            prev_cid: None,
            requests,
            timers_tx,
            timers_rx,
            media_rx,
            transport_rx: None,
            signaling_rx: None,
            stats_interval: None,
            speaker_interval: None,
        };
        info!(call_id = %actor.call_id, user_id = %actor.user_id, "Session created");
        tokio::spawn(actor.run());

        Ok(Self {
            requests: requests_tx,
            state: state_rx,
            local_media,
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> SfuResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| SfuClientError::SessionClosed)?;
        rx.await.map_err(|_| SfuClientError::SessionClosed)?
    }

    fn notify(&self, request: Request) -> SfuResult<()> {
        self.requests
            .send(request)
            .map_err(|_| SfuClientError::SessionClosed)
    }

    fn require_joined(&self) -> SfuResult<()> {
        match self.state() {
            SessionState::Joined => Ok(()),
            state => Err(SfuClientError::InvalidState { state: state.to_string() }),
        }
    }

    /// Start connecting; progress is reported through the observer
    pub async fn connect(&self) -> SfuResult<()> {
        self.call(Request::Connect).await
    }

    /// Leave the call, or stop a pending reconnect
    pub async fn disconnect(&self, reason: TermCode) -> SfuResult<()> {
        self.call(|reply| Request::Disconnect(reason, reply)).await
    }

    pub async fn snapshot(&self) -> SfuResult<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.notify(Request::Snapshot(tx))?;
        rx.await.map_err(|_| SfuClientError::SessionClosed)
    }

    pub fn local_media_status(&self) -> Arc<LocalMediaStatus> {
        self.local_media.status()
    }

    pub async fn mute_camera(&self, mute: bool) {
        self.local_media.mute_camera(mute).await;
    }

    pub async fn mute_audio(&self, mute: bool) {
        self.local_media.mute_audio(mute).await;
    }

    pub async fn enable_screenshare(&self, enable: bool) {
        self.local_media.enable_screenshare(enable).await;
    }

    /// The screen capture was ended outside the application
    pub async fn screen_share_ended(&self) {
        self.local_media.screen_share_ended().await;
    }

    pub async fn put_on_hold(&self) {
        self.local_media.put_on_hold().await;
    }

    pub async fn release_hold(&self) {
        self.local_media.release_hold().await;
    }

    /// Ask to become a speaker. Opens the microphone first so the request
    /// carries what we are able to send.
    pub async fn request_speaking(&self) -> SfuResult<()> {
        self.require_joined()?;
        match self.local_media.request_speaking().await {
            Some(av) => {
                self.call(|reply| Request::Send(ClientCommand::SpeakRequest { cid: None, av: Some(av) }, reply))
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn cancel_speak_request(&self) -> SfuResult<()> {
        self.call(|reply| Request::Send(ClientCommand::SpeakRequestDel { cid: None }, reply))
            .await
    }

    pub async fn stop_speaking(&self) -> SfuResult<()> {
        self.call(|reply| Request::Send(ClientCommand::SpeakerDel { cid: None }, reply))
            .await
    }

    /// Moderator: let a participant speak
    pub async fn approve_speak_request(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Send(ClientCommand::SpeakRequest { cid: Some(cid), av: None }, reply))
            .await
    }

    /// Moderator: drop a participant's speak request
    pub async fn reject_speak_request(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Send(ClientCommand::SpeakRequestDel { cid: Some(cid) }, reply))
            .await
    }

    /// Moderator: take the speaker role away from a participant
    pub async fn remove_speaker(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Send(ClientCommand::SpeakerDel { cid: Some(cid) }, reply))
            .await
    }

    /// Moderator: end the call for everyone
    pub async fn end_call_for_all(&self, anonymous: bool) -> SfuResult<()> {
        let command = ClientCommand::ModEndCall { anon: anonymous.then_some(1) };
        self.call(|reply| Request::Send(command, reply)).await
    }

    pub async fn request_thumbnail(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Video(VideoRequest::RequestThumbnail { cid }, reply))
            .await
    }

    pub async fn stop_thumbnail(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Video(VideoRequest::StopThumbnail { cid }, reply))
            .await
    }

    /// Request high-resolution video, reduced by `divider` spatial layers
    pub async fn request_hires(&self, cid: u32, divider: u8) -> SfuResult<()> {
        self.call(|reply| Request::Video(VideoRequest::RequestHiRes { cid, divider }, reply))
            .await
    }

    pub async fn stop_hires(&self, cid: u32) -> SfuResult<()> {
        self.call(|reply| Request::Video(VideoRequest::StopHiRes { cid }, reply))
            .await
    }

    pub async fn set_hires_divider(&self, cid: u32, divider: u8) -> SfuResult<()> {
        self.call(|reply| Request::Video(VideoRequest::SetHiResDivider { cid, divider }, reply))
            .await
    }

    pub fn enable_speaker_detector(&self, enable: bool) -> SfuResult<()> {
        self.notify(Request::SpeakerDetection(enable))
    }

    /// Thumbnail count announced on the next join
    pub fn set_initial_vthumbs(&self, count: Option<u32>) -> SfuResult<()> {
        self.notify(Request::InitialVthumbs(count))
    }
}
