//! Application-facing capability interfaces
//!
//! The host application implements [`SessionObserver`] to receive session
//! notifications, [`PlayerObserver`] per video consumer and [`KeyWrapper`] to
//! protect key material exchanged with other participants. Notifications are
//! delivered through [`ObserverHub`], which logs each one and contains
//! panics raised by the application.
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


use crate::frame_crypto::FrameKey;
use crate::local_media::ScreenShareType;
use crate::peer::PeerView;
use crate::stats::{RxVideoStats, VideoTxStat};
use async_trait::async_trait;
use sfu_types::{Av, TermCode};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Session notifications; every method defaults to a no-op
#[allow(unused_variables)]
pub trait SessionObserver: Send + Sync {
    fn on_connecting(&self) {}
    fn on_connected(&self) {}
    fn on_joined(&self) {}
    fn on_disconnect(&self, code: TermCode, will_retry: bool) {}

    fn on_peer_joined(&self, peer: &PeerView) {}
    fn on_peer_left(&self, peer: &PeerView, reason: TermCode) {}
    fn on_peer_av_change(&self, peer: &PeerView, av: Av) {}
    fn on_peer_speaker(&self, peer: &PeerView) {}
    fn on_peer_no_speaker(&self, peer: &PeerView) {}
    fn on_peer_speak_request(&self, peer: &PeerView) {}
    fn on_peer_speak_request_del(&self, peer: &PeerView) {}
    fn on_peer_moderator(&self, peer: &PeerView, moderator: bool) {}
    fn on_peer_audio_level(&self, peer: &PeerView, level: f64) {}

    fn on_speaker(&self) {}
    fn on_no_speaker(&self) {}
    fn on_own_speak_request(&self) {}
    fn on_own_speak_request_del(&self) {}
    fn on_moderator(&self, moderator: bool) {}

    /// `changed` holds the flags that flipped
    fn on_local_media_change(&self, changed: Av) {}
    /// `failed` holds the kinds whose capture failed
    fn on_local_media_error(&self, failed: Av) {}
    fn on_screenshare(&self, enabled: bool, kind: Option<ScreenShareType>) {}
    fn on_no_mic_input(&self) {}
    fn on_mic_signal_detected(&self, detected: bool) {}
    /// `None` means we are the loudest
    fn on_active_speaker_change(&self, speaker: Option<&PeerView>, previous: Option<&PeerView>) {}
    fn on_video_tx_stat(&self, stat: Option<&VideoTxStat>) {}
    fn on_server_warning(&self, warning: &str) {}

    /// A video consumer was created for `peer`
    fn new_renderer(&self, peer: &PeerView, hi_res: bool) -> Arc<dyn PlayerObserver> {
        Arc::new(NoopPlayer)
    }
}

/// Notifications of one video consumer
#[allow(unused_variables)]
pub trait PlayerObserver: Send + Sync {
    /// Now showing the inbound video of slot `mid`
    fn on_attached_to_track(&self, mid: u32) {}
    fn on_destroy(&self) {}
    /// A high-resolution player also shows the participant's thumbnail
    fn on_vthumb_attach(&self, mid: u32) {}
    fn on_vthumb_detach(&self) {}
    fn on_rx_stats(&self, stats: &RxVideoStats) {}
    fn on_av_change(&self, av: Av) {}
    fn on_speaker(&self, speaking: bool) {}
}

struct NoopPlayer;

impl PlayerObserver for NoopPlayer {}

/// Protects key material per recipient
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    async fn wrap_key(&self, key: &FrameKey, peer_user_id: &str) -> anyhow::Result<String>;
    async fn unwrap_key(&self, wrapped: &str, peer_user_id: &str) -> anyhow::Result<FrameKey>;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run an application callback, logging instead of propagating a panic
pub fn guarded<R>(name: &str, default: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            error!(event = name, panic = %panic_message(panic.as_ref()), "Event handler panicked");
            default
        }
    }
}

/// Delivers notifications to the application observer
#[derive(Clone)]
pub struct ObserverHub {
    observer: Arc<dyn SessionObserver>,
}

impl ObserverHub {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self { observer }
    }

    pub fn fire(&self, name: &str, f: impl FnOnce(&dyn SessionObserver)) {
        debug!(event = name, "fire [{}]", name);
        let observer = self.observer.as_ref();
        guarded(name, (), || f(observer));
    }

    pub fn fire_player(
        &self,
        name: &str,
        player: &Arc<dyn PlayerObserver>,
        f: impl FnOnce(&dyn PlayerObserver),
    ) {
        debug!(event = name, "fire player [{}]", name);
        let player = player.as_ref();
        guarded(name, (), || f(player));
    }

    pub fn new_renderer(&self, peer: &PeerView, hi_res: bool) -> Arc<dyn PlayerObserver> {
        let observer = self.observer.as_ref();
        guarded("new_renderer", Arc::new(NoopPlayer) as Arc<dyn PlayerObserver>, || {
            observer.new_renderer(peer, hi_res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        joined: AtomicUsize,
    }

    impl SessionObserver for Counting {
        fn on_joined(&self) {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connected(&self) {
            panic!("observer bug");
        }
    }

    #[test]
    fn test_fire_reaches_observer() {
        let observer = Arc::new(Counting::default());
        let hub = ObserverHub::new(observer.clone());
        hub.fire("on_joined", |o| o.on_joined());
        hub.fire("on_connecting", |o| o.on_connecting());
        assert_eq!(observer.joined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let observer = Arc::new(Counting::default());
        let hub = ObserverHub::new(observer.clone());
        hub.fire("on_connected", |o| o.on_connected());
        hub.fire("on_joined", |o| o.on_joined());
        assert_eq!(observer.joined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guarded_returns_default_on_panic() {
        assert_eq!(guarded("x", 5, || 7), 7);
        assert_eq!(guarded("x", 5, || panic!("boom")), 5);
    }
}
