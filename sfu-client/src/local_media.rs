//! Local media control
//!
//! Owns the capture tracks and decides what each outbound transceiver
//! carries: media id 0 the thumbnail video, 1 the high-resolution video and
//! 2 the speaker audio. Every change goes through one [`RequestBarrier`], so
//! overlapping mute/share/speak/hold requests are applied one at a time in
//! arrival order.
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


use crate::error::SfuResult;
use crate::observer::ObserverHub;
use crate::request_barrier::RequestBarrier;
use crate::stats::TxVideoSource;
use crate::transport::{LocalMediaSource, MediaTrack, Transceiver, VideoConstraints};
use arc_swap::{ArcSwap, ArcSwapOption};
use sfu_types::Av;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const CAMERA_CAPTURE_WIDTH: u32 = 960;
pub const CAMERA_CAPTURE_HEIGHT: u32 = 540;
pub const SCREEN_CAPTURE_MAX_HEIGHT: u32 = 1440;

/// Our speaking role in a moderated call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SpeakerState {
    #[default]
    NoSpeaker,
    /// Requested, waiting for approval
    Pending,
    Active,
}

/// What kind of surface is being shared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenShareType {
    WholeScreen,
    Window,
    BrowserTab,
    Invalid,
}

impl ScreenShareType {
    /// Derived from the capture track label
    pub fn from_label(label: &str) -> Self {
        if label.starts_with("screen:") {
            ScreenShareType::WholeScreen
        } else if label.starts_with("window:") {
            ScreenShareType::Window
        } else if label.starts_with("web-contents-media-stream") {
            ScreenShareType::BrowserTab
        } else {
            warn!(label = label, "Could not determine screen sharing type");
            ScreenShareType::Invalid
        }
    }
}

/// The three outbound transceivers of a connection
#[derive(Clone)]
pub struct OutboundTransceivers {
    pub thumb: Arc<dyn Transceiver>,
    pub hires: Arc<dyn Transceiver>,
    pub audio: Arc<dyn Transceiver>,
}

/// Notifications for the session loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalMediaEvent {
    /// Announce these flags with `AV`
    AvailableChanged(Av),
    /// The high-resolution transceiver started sending
    HiResStarted,
    /// Audio started (`true`) or stopped being sent
    AudioSending(bool),
}

/// Lock-free view of the local media state
#[derive(Clone, Default)]
pub struct LocalMediaStatus {
    pub avail_av: Av,
    pub sent_av: Av,
    pub speaker: SpeakerState,
    pub on_hold: bool,
    pub camera_muted: bool,
    pub audio_muted: bool,
    pub sharing_screen: bool,
    /// Which outbound video the statistics should follow
    pub tx_video: Option<TxVideoSource>,
    pub screen_track: Option<Arc<dyn MediaTrack>>,
    /// Capture height of the thumbnail source
    pub thumb_source_height: u32,
}

#[derive(Debug, Clone, Copy)]
struct HoldSnapshot {
    mute_camera: bool,
    mute_audio: bool,
    sharing_screen: bool,
    send_hires: bool,
    send_vthumb: bool,
}

#[derive(Default)]
struct LocalMediaState {
    mute_camera: bool,
    mute_audio: bool,
    sharing_screen: bool,
    send_hires: bool,
    send_vthumb: bool,
    speaker: SpeakerState,
    hold: Option<HoldSnapshot>,
    camera: Option<Arc<dyn MediaTrack>>,
    screen: Option<Arc<dyn MediaTrack>>,
    audio: Option<Arc<dyn MediaTrack>>,
    sent_thumb: Option<Arc<dyn MediaTrack>>,
    sent_hires: Option<Arc<dyn MediaTrack>>,
    sent_audio: Option<Arc<dyn MediaTrack>>,
    avail_av: Av,
    sent_av: Av,
}

fn same_track(a: &Option<Arc<dyn MediaTrack>>, b: &Arc<dyn MediaTrack>) -> bool {
    a.as_ref().is_some_and(|a| a.id() == b.id())
}

fn stop_track(slot: &mut Option<Arc<dyn MediaTrack>>) {
    if let Some(track) = slot.take() {
        debug!(track = %track.id(), "Stopping local track");
        track.stop();
    }
}

impl LocalMediaState {
    fn obtained_av(&self) -> Av {
        let mut av = Av::empty();
        if self.audio.is_some() {
            av |= Av::AUDIO;
        }
        if self.camera.is_some() {
            av |= Av::CAMERA;
        }
        if self.screen.is_some() {
            av |= Av::SCREEN;
        }
        av
    }

    fn update_avail_and_sent(&mut self) {
        if self.hold.is_some() {
            return;
        }
        let mut avail = if self.sent_audio.is_some() { Av::AUDIO } else { Av::empty() };
        let mut sent = avail;
        match (&self.screen, &self.camera) {
            (Some(_), Some(_)) => avail |= Av::SCREEN_HI_RES | Av::CAMERA_LOW_RES,
            (Some(_), None) => avail |= Av::SCREEN_HI_RES | Av::SCREEN_LOW_RES,
            (None, Some(_)) => avail |= Av::CAMERA,
            (None, None) => {}
        }
        if let Some(track) = &self.sent_thumb {
            sent |= if same_track(&self.camera, track) {
                Av::CAMERA_LOW_RES
            } else {
                Av::SCREEN_LOW_RES
            };
        }
        if let Some(track) = &self.sent_hires {
            sent |= if same_track(&self.camera, track) {
                Av::CAMERA_HI_RES
            } else {
                Av::SCREEN_HI_RES
            };
        }
        self.avail_av = avail;
        self.sent_av = sent;
    }

    fn status(&self) -> LocalMediaStatus {
        let tx_video = match (&self.sent_hires, &self.sent_thumb) {
            (Some(track), _) if same_track(&self.screen, track) => Some(TxVideoSource::HiResScreen),
            (Some(_), _) => Some(TxVideoSource::HiResCamera),
            (None, Some(_)) => Some(TxVideoSource::Thumbnail),
            (None, None) => None,
        };
        let thumb_source_height = if self.sharing_screen {
            SCREEN_CAPTURE_MAX_HEIGHT
        } else {
            self.camera
                .as_ref()
                .and_then(|track| track.settings().height)
                .unwrap_or(CAMERA_CAPTURE_HEIGHT)
        };
        LocalMediaStatus {
            avail_av: self.avail_av,
            sent_av: self.sent_av,
            speaker: self.speaker,
            on_hold: self.hold.is_some(),
            camera_muted: self.hold.map_or(self.mute_camera, |hold| hold.mute_camera),
            audio_muted: self.hold.map_or(self.mute_audio, |hold| hold.mute_audio),
            sharing_screen: self.hold.map_or(self.sharing_screen, |hold| hold.sharing_screen),
            tx_video,
            screen_track: self.screen.clone(),
            thumb_source_height,
        }
    }
}

/// Local capture and outbound track routing
pub struct LocalMedia {
    source: Arc<dyn LocalMediaSource>,
    hub: ObserverHub,
    events: mpsc::UnboundedSender<LocalMediaEvent>,
    outbound: ArcSwapOption<OutboundTransceivers>,
    connected: AtomicBool,
    status: ArcSwap<LocalMediaStatus>,
    barrier: RequestBarrier<LocalMediaState>,
}

impl LocalMedia {
    pub fn new(
        source: Arc<dyn LocalMediaSource>,
        hub: ObserverHub,
        events: mpsc::UnboundedSender<LocalMediaEvent>,
    ) -> Self {
        Self {
            source,
            hub,
            events,
            outbound: ArcSwapOption::empty(),
            connected: AtomicBool::new(false),
            status: ArcSwap::from_pointee(LocalMediaStatus::default()),
            barrier: RequestBarrier::new(LocalMediaState::default()),
        }
    }

    pub fn status(&self) -> Arc<LocalMediaStatus> {
        self.status.load_full()
    }

    /// Use the outbound transceivers of a new connection
    pub async fn attach(&self, outbound: OutboundTransceivers) {
        let mut state = self.barrier.enter().await;
        state.sent_thumb = None;
        state.sent_hires = None;
        state.sent_audio = None;
        self.outbound.store(Some(Arc::new(outbound)));
        self.connected.store(true, Ordering::Release);
        self.publish(&state);
    }

    /// The connection went away
    pub async fn detach(&self) {
        let mut state = self.barrier.enter().await;
        self.outbound.store(None);
        self.connected.store(false, Ordering::Release);
        state.sent_thumb = None;
        state.sent_hires = None;
        state.sent_audio = None;
        self.publish(&state);
    }

    pub async fn update_sent_tracks(&self) {
        let mut state = self.barrier.enter().await;
        self.do_update_sent_tracks(&mut state).await;
    }

    pub async fn mute_camera(&self, mute: bool) {
        let mut state = self.barrier.enter().await;
        if let Some(hold) = state.hold.as_mut() {
            hold.mute_camera = mute;
            return;
        }
        if !self.connected.load(Ordering::Acquire) {
            state.mute_camera = mute;
            self.publish(&state);
            return;
        }
        if state.mute_camera == mute {
            debug!(mute = mute, "mute_camera: no change");
            return;
        }
        state.mute_camera = mute;
        self.do_update_sent_tracks(&mut state).await;
    }

    pub async fn mute_audio(&self, mute: bool) {
        let mut state = self.barrier.enter().await;
        if let Some(hold) = state.hold.as_mut() {
            hold.mute_audio = mute;
            return;
        }
        if !self.connected.load(Ordering::Acquire) {
            state.mute_audio = mute;
            self.publish(&state);
            return;
        }
        if state.mute_audio == mute {
            debug!(mute = mute, "mute_audio: no change");
            return;
        }
        state.mute_audio = mute;
        self.do_update_sent_tracks(&mut state).await;
    }

    pub async fn enable_screenshare(&self, enable: bool) {
        let mut state = self.barrier.enter().await;
        if let Some(hold) = state.hold.as_mut() {
            hold.sharing_screen = enable;
            return;
        }
        if state.sharing_screen == enable {
            debug!(enable = enable, "enable_screenshare: no change");
            return;
        }
        state.sharing_screen = enable;
        self.do_update_sent_tracks(&mut state).await;
        if state.sharing_screen != enable {
            // capture failed
            return;
        }
        if enable {
            let kind = state
                .screen
                .as_ref()
                .map_or(ScreenShareType::Invalid, |track| ScreenShareType::from_label(&track.label()));
            self.hub.fire("on_screenshare", |o| o.on_screenshare(true, Some(kind)));
        } else {
            self.hub.fire("on_screenshare", |o| o.on_screenshare(false, None));
        }
    }

    /// The user ended the capture from outside the application
    pub async fn screen_share_ended(&self) {
        let mut state = self.barrier.enter().await;
        warn!("Screen sharing stopped by user");
        if let Some(hold) = state.hold.as_mut() {
            hold.sharing_screen = false;
        }
        state.sharing_screen = false;
        self.do_update_sent_tracks(&mut state).await;
        self.hub.fire("on_screenshare", |o| o.on_screenshare(false, None));
    }

    pub async fn put_on_hold(&self) {
        let mut state = self.barrier.enter().await;
        if state.hold.is_some() {
            return;
        }
        state.avail_av |= Av::ON_HOLD;
        state.sent_av = Av::ON_HOLD;
        state.hold = Some(HoldSnapshot {
            mute_camera: state.mute_camera,
            mute_audio: state.mute_audio,
            sharing_screen: state.sharing_screen,
            send_hires: state.send_hires,
            send_vthumb: state.send_vthumb,
        });
        state.mute_camera = true;
        state.mute_audio = true;
        state.sharing_screen = false;
        state.send_hires = false;
        state.send_vthumb = false;
        self.do_update_sent_tracks(&mut state).await;

        // the flags did not change while on hold, announce explicitly
        self.emit(LocalMediaEvent::AvailableChanged(state.avail_av));
        self.hub.fire("on_local_media_change", |o| o.on_local_media_change(Av::ON_HOLD));
        info!("Put on hold");
    }

    pub async fn release_hold(&self) {
        let mut state = self.barrier.enter().await;
        let Some(hold) = state.hold.take() else {
            return;
        };
        state.mute_camera = hold.mute_camera;
        state.mute_audio = hold.mute_audio;
        state.sharing_screen = hold.sharing_screen;
        state.send_hires = hold.send_hires;
        state.send_vthumb = hold.send_vthumb;
        // so that the change is computed against what was actually announced
        state.avail_av = Av::ON_HOLD;
        self.do_update_sent_tracks(&mut state).await;
        info!("Released hold");
    }

    /// Server asked us to start or stop sending high-resolution video
    pub async fn set_send_hires(&self, send: bool) {
        let mut state = self.barrier.enter().await;
        if let Some(hold) = state.hold.as_mut() {
            hold.send_hires = send;
            return;
        }
        state.send_hires = send;
        self.do_update_sent_tracks(&mut state).await;
    }

    /// Server asked us to start or stop sending thumbnail video
    pub async fn set_send_vthumb(&self, send: bool) {
        let mut state = self.barrier.enter().await;
        if let Some(hold) = state.hold.as_mut() {
            hold.send_vthumb = send;
            return;
        }
        state.send_vthumb = send;
        self.do_update_sent_tracks(&mut state).await;
    }

    /// Speaker state at join time
    pub async fn reset_speaker(&self, speaker: SpeakerState) {
        let mut state = self.barrier.enter().await;
        state.speaker = speaker;
        self.publish(&state);
    }

    /// Become pending and open the microphone; returns what we can send, or
    /// `None` if we already are a speaker or pending
    pub async fn request_speaking(&self) -> Option<Av> {
        let mut state = self.barrier.enter().await;
        if state.speaker != SpeakerState::NoSpeaker {
            return None;
        }
        state.speaker = SpeakerState::Pending;
        self.get_local_tracks(&mut state).await;
        self.publish(&state);
        Some(state.obtained_av())
    }

    /// Our speak request was approved; returns whether we became active
    pub async fn start_speaking(&self) -> bool {
        let mut state = self.barrier.enter().await;
        if state.speaker != SpeakerState::Pending {
            return false;
        }
        state.speaker = SpeakerState::Active;
        self.do_update_sent_tracks(&mut state).await;
        true
    }

    /// We are no longer a speaker; returns whether anything changed
    pub async fn stop_speaking(&self) -> bool {
        let mut state = self.barrier.enter().await;
        if state.speaker == SpeakerState::NoSpeaker {
            return false;
        }
        state.speaker = SpeakerState::NoSpeaker;
        self.do_update_sent_tracks(&mut state).await;
        true
    }

    /// Our pending speak request was removed
    pub async fn speak_request_removed(&self) {
        let mut state = self.barrier.enter().await;
        if state.speaker == SpeakerState::Active {
            return;
        }
        state.speaker = SpeakerState::NoSpeaker;
        self.get_local_tracks(&mut state).await;
        self.publish(&state);
    }

    pub async fn stop_local_tracks(&self) {
        let mut state = self.barrier.enter().await;
        stop_track(&mut state.audio);
        stop_track(&mut state.camera);
        stop_track(&mut state.screen);
        self.publish(&state);
    }

    fn emit(&self, event: LocalMediaEvent) {
        if self.events.send(event).is_err() {
            debug!(event = ?event, "Session loop gone, local media event dropped");
        }
    }

    fn publish(&self, state: &LocalMediaState) {
        self.status.store(Arc::new(state.status()));
    }

    /// Open and close capture tracks to match the state; capture failures
    /// are reported as one bitmask
    async fn get_local_tracks(&self, state: &mut LocalMediaState) {
        let screen = state.sharing_screen;
        let camera = !state.mute_camera;
        // opened while pending too, so that unmuting is quick
        let audio = state.speaker > SpeakerState::NoSpeaker;

        if !audio {
            stop_track(&mut state.audio);
        }
        if !camera {
            stop_track(&mut state.camera);
        }
        if !screen {
            stop_track(&mut state.screen);
        }
        let open_audio = audio && state.audio.is_none();
        let open_camera = camera && state.camera.is_none();
        let open_screen = screen && state.screen.is_none();
        if !(open_audio || open_camera || open_screen) {
            return;
        }

        let source = &self.source;
        let (audio_result, camera_result, screen_result) = futures::join!(
            async {
                if open_audio {
                    Some(source.open_microphone().await)
                } else {
                    None
                }
            },
            async {
                if open_camera {
                    let constraints = VideoConstraints {
                        width: Some(CAMERA_CAPTURE_WIDTH),
                        height: CAMERA_CAPTURE_HEIGHT,
                        frame_rate: None,
                    };
                    Some(source.open_camera(constraints).await)
                } else {
                    None
                }
            },
            async {
                if open_screen {
                    Some(source.open_screen(SCREEN_CAPTURE_MAX_HEIGHT).await)
                } else {
                    None
                }
            }
        );

        let mut failed = Av::empty();
        match audio_result {
            Some(Ok(track)) => state.audio = Some(track),
            Some(Err(e)) => {
                error!(error = %e, "Error getting local microphone");
                failed |= Av::AUDIO;
            }
            None => {}
        }
        match camera_result {
            Some(Ok(track)) => state.camera = Some(track),
            Some(Err(e)) => {
                error!(error = %e, "Error getting local camera");
                failed |= Av::CAMERA;
            }
            None => {}
        }
        match screen_result {
            Some(Ok(track)) => state.screen = Some(track),
            Some(Err(e)) => {
                error!(error = %e, "Error getting screen capture");
                state.sharing_screen = false;
                failed |= Av::SCREEN;
            }
            None => {}
        }
        if !failed.is_empty() {
            self.hub.fire("on_local_media_error", |o| o.on_local_media_error(failed));
        }
    }

    async fn send_track(
        transceiver: &Arc<dyn Transceiver>,
        track: Option<Arc<dyn MediaTrack>>,
        name: &str,
    ) -> Option<Arc<dyn MediaTrack>> {
        match transceiver.replace_track(track.clone()).await {
            Ok(()) => track,
            Err(e) => {
                error!(sender = name, error = %e, "Failed to replace sent track");
                None
            }
        }
    }

    async fn do_update_sent_tracks(&self, state: &mut LocalMediaState) {
        let old_avail = state.avail_av;
        let was_sending_hires = state.sent_hires.is_some();
        self.get_local_tracks(state).await;

        if let Some(outbound) = self.outbound.load_full() {
            let audio_track = match (&state.audio, state.speaker, state.mute_audio) {
                (Some(track), SpeakerState::Active, false) => Some(track.clone()),
                _ => None,
            };
            let (hires_track, vthumb_track) = match (&state.camera, &state.screen) {
                (None, screen) if state.sharing_screen => (screen.clone(), screen.clone()),
                (None, _) => (None, None),
                (Some(camera), Some(screen)) if state.sharing_screen => {
                    // camera and screen: the thumbnail must always carry the camera
                    state.send_vthumb = true;
                    (Some(screen.clone()), Some(camera.clone()))
                }
                (Some(camera), _) => (Some(camera.clone()), Some(camera.clone())),
            };
            let hires_track = hires_track.filter(|_| state.send_hires);
            let vthumb_track = vthumb_track.filter(|_| state.send_vthumb);

            let audio_sending = audio_track.is_some();
            let (sent_audio, sent_hires, sent_thumb) = futures::join!(
                Self::send_track(&outbound.audio, audio_track, "audio"),
                Self::send_track(&outbound.hires, hires_track, "hires"),
                Self::send_track(&outbound.thumb, vthumb_track, "vthumb"),
            );
            state.sent_audio = sent_audio;
            state.sent_hires = sent_hires;
            state.sent_thumb = sent_thumb;
            self.emit(LocalMediaEvent::AudioSending(audio_sending && state.sent_audio.is_some()));
            if state.sent_hires.is_some() && !was_sending_hires {
                self.emit(LocalMediaEvent::HiResStarted);
            }
        }

        state.update_avail_and_sent();
        self.publish(state);
        let avail = state.avail_av;
        if avail != old_avail {
            debug!(from = %old_avail, to = %avail, "Available media changed");
            self.emit(LocalMediaEvent::AvailableChanged(avail));
            self.hub
                .fire("on_local_media_change", |o| o.on_local_media_change(avail ^ old_avail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SfuClientError;
    use crate::frame_crypto::{FrameDecryptor, FrameEncryptor};
    use crate::observer::SessionObserver;
    use crate::transport::{
        EncodingParameters, MediaType, TrackSettings, TransceiverDirection, TransceiverStats,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeTrack {
        id: String,
        kind: MediaType,
        label: String,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl MediaTrack for FakeTrack {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn kind(&self) -> MediaType {
            self.kind
        }
        fn label(&self) -> String {
            self.label.clone()
        }
        fn settings(&self) -> TrackSettings {
            TrackSettings { width: Some(960), height: Some(540), frame_rate: Some(30.0) }
        }
        async fn apply_constraints(&self, _constraints: VideoConstraints) -> SfuResult<()> {
            Ok(())
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn track(id: &str, kind: MediaType, label: &str) -> Arc<dyn MediaTrack> {
        Arc::new(FakeTrack {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            stopped: AtomicBool::new(false),
        })
    }

    #[derive(Default)]
    struct FakeSource {
        fail_screen: bool,
    }

    #[async_trait]
    impl LocalMediaSource for FakeSource {
        async fn open_microphone(&self) -> SfuResult<Arc<dyn MediaTrack>> {
            Ok(track("mic", MediaType::Audio, "mic"))
        }
        async fn open_camera(&self, _c: VideoConstraints) -> SfuResult<Arc<dyn MediaTrack>> {
            Ok(track("cam", MediaType::Video, "camera"))
        }
        async fn open_screen(&self, _max_height: u32) -> SfuResult<Arc<dyn MediaTrack>> {
            if self.fail_screen {
                return Err(SfuClientError::LocalMedia("permission denied".to_string()));
            }
            Ok(track("scr", MediaType::Video, "window:12:0"))
        }
    }

    #[derive(Default)]
    struct FakeSender {
        sent: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Transceiver for FakeSender {
        fn mid(&self) -> Option<u32> {
            Some(0)
        }
        fn kind(&self) -> MediaType {
            MediaType::Video
        }
        fn direction(&self) -> TransceiverDirection {
            TransceiverDirection::SendRecv
        }
        async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> SfuResult<()> {
            *self.sent.lock().unwrap() = track.map(|t| t.id());
            Ok(())
        }
        async fn set_encoding_parameters(&self, _params: EncodingParameters) -> SfuResult<()> {
            Ok(())
        }
        fn install_frame_transforms(
            &self,
            _encryptor: Option<Arc<FrameEncryptor>>,
            _decryptor: Arc<FrameDecryptor>,
        ) -> SfuResult<()> {
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

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<Av>>,
        errors: Mutex<Vec<Av>>,
        screenshare: Mutex<Vec<(bool, Option<ScreenShareType>)>>,
    }

    impl SessionObserver for Recorder {
        fn on_local_media_change(&self, changed: Av) {
            self.changes.lock().unwrap().push(changed);
        }
        fn on_local_media_error(&self, failed: Av) {
            self.errors.lock().unwrap().push(failed);
        }
        fn on_screenshare(&self, enabled: bool, kind: Option<ScreenShareType>) {
            self.screenshare.lock().unwrap().push((enabled, kind));
        }
    }

    struct Fixture {
        media: LocalMedia,
        events: mpsc::UnboundedReceiver<LocalMediaEvent>,
        observer: Arc<Recorder>,
        thumb: Arc<FakeSender>,
        hires: Arc<FakeSender>,
        audio: Arc<FakeSender>,
    }

    impl Fixture {
        fn sent(sender: &FakeSender) -> Option<String> {
            sender.sent.lock().unwrap().clone()
        }

        fn drain(&mut self) -> Vec<LocalMediaEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    async fn fixture(source: FakeSource) -> Fixture {
        let observer = Arc::new(Recorder::default());
        let (tx, events) = mpsc::unbounded_channel();
        let media = LocalMedia::new(Arc::new(source), ObserverHub::new(observer.clone()), tx);
        let (thumb, hires, audio) = (
            Arc::new(FakeSender::default()),
            Arc::new(FakeSender::default()),
            Arc::new(FakeSender::default()),
        );
        media
            .attach(OutboundTransceivers {
                thumb: thumb.clone(),
                hires: hires.clone(),
                audio: audio.clone(),
            })
            .await;
        Fixture { media, events, observer, thumb, hires, audio }
    }

    #[test]
    fn test_screen_share_type_from_label() {
        assert_eq!(ScreenShareType::from_label("screen:0:0"), ScreenShareType::WholeScreen);
        assert_eq!(ScreenShareType::from_label("window:42:1"), ScreenShareType::Window);
        assert_eq!(
            ScreenShareType::from_label("web-contents-media-stream://1:2"),
            ScreenShareType::BrowserTab
        );
        assert_eq!(ScreenShareType::from_label("HD camera"), ScreenShareType::Invalid);
    }

    #[tokio::test]
    async fn test_camera_routing_follows_server_flags() {
        let mut f = fixture(FakeSource::default()).await;
        f.media.update_sent_tracks().await;
        // nobody asked for video yet
        assert_eq!(Fixture::sent(&f.hires), None);
        assert_eq!(Fixture::sent(&f.thumb), None);
        assert_eq!(f.media.status().avail_av, Av::CAMERA);
        assert_eq!(f.media.status().sent_av, Av::empty());

        f.media.set_send_vthumb(true).await;
        assert_eq!(Fixture::sent(&f.thumb).as_deref(), Some("cam"));
        f.media.set_send_hires(true).await;
        assert_eq!(Fixture::sent(&f.hires).as_deref(), Some("cam"));
        assert_eq!(f.media.status().sent_av, Av::CAMERA);
        assert_eq!(f.media.status().tx_video, Some(TxVideoSource::HiResCamera));

        let events = f.drain();
        assert!(events.contains(&LocalMediaEvent::AvailableChanged(Av::CAMERA)));
        assert!(events.contains(&LocalMediaEvent::HiResStarted));
        assert_eq!(*f.observer.changes.lock().unwrap(), vec![Av::CAMERA]);
    }

    #[tokio::test]
    async fn test_camera_and_screen_split() {
        let f = fixture(FakeSource::default()).await;
        f.media.set_send_hires(true).await;
        f.media.enable_screenshare(true).await;

        assert_eq!(Fixture::sent(&f.hires).as_deref(), Some("scr"));
        // the thumbnail is forced on to carry the camera
        assert_eq!(Fixture::sent(&f.thumb).as_deref(), Some("cam"));
        let status = f.media.status();
        assert_eq!(status.avail_av, Av::SCREEN_HI_RES | Av::CAMERA_LOW_RES);
        assert_eq!(status.sent_av, Av::SCREEN_HI_RES | Av::CAMERA_LOW_RES);
        assert_eq!(status.tx_video, Some(TxVideoSource::HiResScreen));
        assert_eq!(status.thumb_source_height, SCREEN_CAPTURE_MAX_HEIGHT);
        assert_eq!(
            *f.observer.screenshare.lock().unwrap(),
            vec![(true, Some(ScreenShareType::Window))]
        );

        f.media.mute_camera(true).await;
        assert_eq!(Fixture::sent(&f.hires).as_deref(), Some("scr"));
        assert_eq!(Fixture::sent(&f.thumb).as_deref(), Some("scr"));
        assert_eq!(f.media.status().avail_av, Av::SCREEN);
    }

    #[tokio::test]
    async fn test_failed_screen_capture_is_reported() {
        let f = fixture(FakeSource { fail_screen: true }).await;
        f.media.enable_screenshare(true).await;
        assert_eq!(*f.observer.errors.lock().unwrap(), vec![Av::SCREEN]);
        assert!(f.observer.screenshare.lock().unwrap().is_empty());
        let status = f.media.status();
        assert!(!status.sharing_screen);
        // the camera still came up
        assert_eq!(status.avail_av, Av::CAMERA);
    }

    #[tokio::test]
    async fn test_audio_only_while_active_speaker() {
        let mut f = fixture(FakeSource::default()).await;
        f.media.mute_camera(true).await;
        assert_eq!(f.media.request_speaking().await, Some(Av::AUDIO));
        assert_eq!(f.media.request_speaking().await, None);
        assert_eq!(Fixture::sent(&f.audio), None);

        assert!(f.media.start_speaking().await);
        assert_eq!(Fixture::sent(&f.audio).as_deref(), Some("mic"));
        assert_eq!(f.media.status().sent_av, Av::AUDIO);

        f.media.mute_audio(true).await;
        assert_eq!(Fixture::sent(&f.audio), None);
        let events = f.drain();
        assert!(events.contains(&LocalMediaEvent::AudioSending(true)));
        assert_eq!(events.last(), Some(&LocalMediaEvent::AvailableChanged(Av::empty())));

        assert!(f.media.stop_speaking().await);
        assert!(!f.media.stop_speaking().await);
    }

    #[tokio::test]
    async fn test_hold_saves_and_restores() {
        let mut f = fixture(FakeSource::default()).await;
        f.media.set_send_hires(true).await;
        f.media.set_send_vthumb(true).await;
        f.drain();

        f.media.put_on_hold().await;
        assert_eq!(Fixture::sent(&f.hires), None);
        assert_eq!(Fixture::sent(&f.thumb), None);
        let status = f.media.status();
        assert!(status.on_hold);
        assert_eq!(status.sent_av, Av::ON_HOLD);
        assert_eq!(status.avail_av, Av::CAMERA | Av::ON_HOLD);
        assert!(!status.camera_muted);
        assert_eq!(
            f.drain().last(),
            Some(&LocalMediaEvent::AvailableChanged(Av::CAMERA | Av::ON_HOLD))
        );

        // requests while on hold only update the saved state
        f.media.mute_camera(true).await;
        assert!(f.media.status().camera_muted);
        f.media.mute_camera(false).await;

        f.media.release_hold().await;
        assert_eq!(Fixture::sent(&f.hires).as_deref(), Some("cam"));
        let status = f.media.status();
        assert!(!status.on_hold);
        assert_eq!(status.avail_av, Av::CAMERA);
        let changes = f.observer.changes.lock().unwrap().clone();
        assert_eq!(changes[changes.len() - 2..], [Av::ON_HOLD, Av::ON_HOLD | Av::CAMERA]);
    }

    #[tokio::test]
    async fn test_mute_while_disconnected_only_sets_flag() {
        let f = fixture(FakeSource::default()).await;
        f.media.detach().await;
        f.media.mute_camera(true).await;
        assert!(f.media.status().camera_muted);
        assert_eq!(f.media.status().avail_av, Av::empty());
    }
}
