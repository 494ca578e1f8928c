//! Client side of a group media session with a forwarding media server
//!
//! This crate provides:
//! - The session state machine: connect, join, reconnect, participant lifecycle
//! - Session description compression for the signaling wire
//! - The slot registry mapping a fixed transceiver pool to participants
//! - End-to-end frame encryption with delayed key rotation
//! - Adaptive received-layer and sent-screen quality
//!
//! Media transport, capture and rendering are supplied by the application
//! through the traits in [`transport`] and [`observer`].
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


pub mod backoff;
pub mod error;
pub mod frame_crypto;
pub mod key_rotation;
pub mod local_media;
pub mod mic_monitor;
pub mod observer;
pub mod peer;
pub mod quality;
pub mod request_barrier;
pub mod sdp_compress;
pub mod session;
pub mod signaling;
pub mod slots;
pub mod speaker_detector;
pub mod stats;
pub mod stats_recorder;
pub mod transport;

// Re-export main types
pub use error::{SfuClientError, SfuResult};
pub use frame_crypto::{CryptoContext, FrameDecryptor, FrameDropReason, FrameEncryptor, FrameKey};
pub use key_rotation::{PeerChurnTracker, SendKeyManager};
pub use local_media::{LocalMediaStatus, ScreenShareType, SpeakerState};
pub use observer::{KeyWrapper, PlayerObserver, SessionObserver};
pub use peer::PeerView;
pub use quality::QualityDriver;
pub use sdp_compress::{compress, uncompress};
pub use session::{SessionHandle, SessionParams, SessionSnapshot, SessionState};
pub use signaling::{SignalingChannel, SignalingConnector, SignalingEvent, WsConnector};
pub use slots::SlotRegistry;
pub use stats::{RxVideoStats, TxVideoSource, VideoTxStat};
pub use stats_recorder::{HttpTelemetrySink, TelemetrySink};
pub use transport::{
    LocalMediaSource, MediaTrack, MediaTransport, MediaType, Transceiver, TransportEvent,
    TransportFactory,
};
