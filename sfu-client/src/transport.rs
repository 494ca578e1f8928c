//! Media transport abstraction
//!
//! ICE, DTLS, congestion control and codecs live in the host's real-time
//! media stack. The client only needs transceivers it can feed tracks into,
//! attach frame transforms to and poll statistics from.
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
use crate::frame_crypto::{FrameDecryptor, FrameEncryptor};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Media type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Audio stream
    Audio,
    /// Video stream
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    RecvOnly,
}

/// Encoding parameters of the first sender encoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingParameters {
    pub scale_resolution_down_by: Option<f64>,
    /// Bits per second
    pub max_bitrate: Option<u32>,
}

/// Capture settings reported by a track
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSettings {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
}

/// Capture constraints applied to a video track
#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub width: Option<u32>,
    pub height: u32,
    pub frame_rate: Option<f64>,
}

/// A local capture track
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaType;
    /// Device or surface label, e.g. `screen:0:0`
    fn label(&self) -> String;
    fn settings(&self) -> TrackSettings;
    async fn apply_constraints(&self, constraints: VideoConstraints) -> SfuResult<()>;
    fn stop(&self);
}

/// Opens local capture devices
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    async fn open_microphone(&self) -> SfuResult<Arc<dyn MediaTrack>>;
    async fn open_camera(&self, constraints: VideoConstraints) -> SfuResult<Arc<dyn MediaTrack>>;
    async fn open_screen(&self, max_height: u32) -> SfuResult<Arc<dyn MediaTrack>>;
}

/// Outbound RTP counters of a transceiver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundRtpStats {
    /// Milliseconds, monotonic within the transport
    pub timestamp_ms: f64,
    pub bytes_sent: u64,
    pub key_frames_encoded: u64,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

/// Inbound RTP counters of a transceiver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRtpStats {
    pub timestamp_ms: f64,
    pub packets_lost: i64,
    pub bytes_received: u64,
    pub nack_count: u64,
    pub key_frames_decoded: u64,
    /// Seconds
    pub jitter: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransceiverStats {
    pub outbound: Option<OutboundRtpStats>,
    pub inbound: Option<InboundRtpStats>,
}

/// Counters of the selected candidate pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStats {
    pub timestamp_ms: f64,
    /// Seconds
    pub current_round_trip_time: Option<f64>,
    /// Bits per second
    pub available_outgoing_bitrate: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One bidirectional media unit of the transport
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Media id, known once the local description is applied
    fn mid(&self) -> Option<u32>;
    fn kind(&self) -> MediaType;
    fn direction(&self) -> TransceiverDirection;
    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> SfuResult<()>;
    async fn set_encoding_parameters(&self, params: EncodingParameters) -> SfuResult<()>;
    /// Route encoded frames through the given transforms
    fn install_frame_transforms(
        &self,
        encryptor: Option<Arc<FrameEncryptor>>,
        decryptor: Arc<FrameDecryptor>,
    ) -> SfuResult<()>;
    async fn stats(&self) -> SfuResult<TransceiverStats>;
    /// Level of the sent audio, 0.0 to 1.0
    fn sender_audio_level(&self) -> Option<f64>;
    /// Level of the received audio, 0.0 to 1.0
    fn receiver_audio_level(&self) -> Option<f64>;
}

/// Connection-level transport notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Failed,
}

/// A peer connection to the media server
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn add_transceiver(
        &self,
        kind: MediaType,
        direction: TransceiverDirection,
    ) -> SfuResult<Arc<dyn Transceiver>>;
    async fn create_offer(&self) -> SfuResult<String>;
    async fn set_local_description(&self, sdp: &str) -> SfuResult<()>;
    async fn set_remote_description(&self, sdp: &str) -> SfuResult<()>;
    async fn stats(&self) -> SfuResult<ConnectionStats>;
    fn close(&self);
}

/// Creates one transport per connection attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> SfuResult<Arc<dyn MediaTransport>>;
}
