//! Video requests, local media events and the periodic ticks
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


use super::{now, SessionActor, SessionState, Timer, VideoRequest};
use crate::error::{SfuClientError, SfuResult};
use crate::local_media::{LocalMediaEvent, LocalMediaStatus, SpeakerState};
use crate::mic_monitor::MicEvent;
use crate::quality::{tx_constraints, DEFAULT_ASPECT_RATIO};
use crate::speaker_detector::Speaker;
use crate::stats::{SlotRxStats, StatsInput, TxVideoSource};
use sfu_types::ClientCommand;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before the first sent screen quality is applied
const TX_QUALITY_INIT_DELAY: Duration = Duration::from_millis(100);

impl SessionActor {
    pub(super) fn video_request(&mut self, request: VideoRequest) -> SfuResult<()> {
        let state = self.state();
        if state != SessionState::Joined {
            return Err(SfuClientError::InvalidState { state: state.to_string() });
        }
        let commands = match request {
            VideoRequest::RequestThumbnail { cid } => self.peers.request_thumbnail(cid)?,
            VideoRequest::StopThumbnail { cid } => self.peers.stop_thumbnail(cid, &mut self.slots)?,
            VideoRequest::RequestHiRes { cid, divider } => self.peers.request_hires(cid, divider)?,
            VideoRequest::StopHiRes { cid } => self.peers.stop_hires(cid, &mut self.slots)?,
            VideoRequest::SetHiResDivider { cid, divider } => {
                self.peers.set_hires_divider(cid, divider)?
            }
        };
        for command in commands {
            self.send(command)?;
        }
        Ok(())
    }

    pub(super) async fn on_local_media_event(&mut self, event: LocalMediaEvent) {
        match event {
            LocalMediaEvent::AvailableChanged(av) => {
                if self.state() == SessionState::Joined {
                    if let Err(e) = self.send(ClientCommand::AvUpdate { av }) {
                        warn!(error = %e, "Failed to announce available media");
                    }
                }
            }
            LocalMediaEvent::AudioSending(true) => self.mic.restart(now()),
            LocalMediaEvent::AudioSending(false) => self.mic.stop(),
            LocalMediaEvent::HiResStarted => {
                let index = self.quality.init_tx(now());
                debug!(index = index, "High-resolution track started");
                self.schedule(
                    Timer::ApplyTxQuality { generation: self.generation },
                    TX_QUALITY_INIT_DELAY,
                    self.connection_token(),
                );
            }
        }
    }

    /// Constrain the screen capture to sent quality `index`
    pub(super) async fn apply_tx_quality(&self, index: usize) {
        let status = self.local_media.status();
        if status.tx_video != Some(TxVideoSource::HiResScreen) {
            return;
        }
        let Some(track) = status.screen_track.clone() else {
            return;
        };
        let settings = track.settings();
        let aspect = match (settings.width, settings.height) {
            (Some(width), Some(height)) if height > 0 => f64::from(width) / f64::from(height),
            _ => DEFAULT_ASPECT_RATIO,
        };
        let constraints = tx_constraints(index, aspect);
        info!(index = index, height = constraints.height, "Applying sent screen quality");
        if let Err(e) = track.apply_constraints(constraints).await {
            warn!(error = %e, "Failed to constrain screen capture");
        }
    }

    fn on_mic_event(&self, event: MicEvent) {
        match event {
            MicEvent::NoMicInput => self.hub.fire("on_no_mic_input", |o| o.on_no_mic_input()),
            MicEvent::SignalDetected(detected) => self
                .hub
                .fire("on_mic_signal_detected", |o| o.on_mic_signal_detected(detected)),
        }
    }

    async fn gather_stats(&self, status: &LocalMediaStatus) -> StatsInput {
        let mut input = StatsInput::default();
        let Some(conn) = &self.conn else {
            return input;
        };

        if let (Some(source), Some(outbound)) = (status.tx_video, &conn.outbound) {
            let transceiver = match source {
                TxVideoSource::Thumbnail => &outbound.thumb,
                TxVideoSource::HiResScreen | TxVideoSource::HiResCamera => &outbound.hires,
            };
            match transceiver.stats().await {
                Ok(stats) => input.tx_video = stats.outbound.map(|stats| (source, stats)),
                Err(e) => debug!(error = %e, "Outbound video stats unavailable"),
            }
        }

        let active: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.is_active())
            .map(|slot| (slot.mid(), slot.kind(), slot.transceiver()))
            .collect();
        let results = futures::future::join_all(
            active
                .iter()
                .map(|(_, _, transceiver)| transceiver.stats()),
        )
        .await;
        for ((mid, kind, _), result) in active.iter().zip(results) {
            if let Some(stats) = result.ok().and_then(|stats| stats.inbound) {
                input.rx.push(SlotRxStats { mid: *mid, kind: *kind, stats });
            }
        }

        match conn.transport.stats().await {
            Ok(stats) => input.connection = Some(stats),
            Err(e) => debug!(error = %e, "Connection stats unavailable"),
        }
        input
    }

    pub(super) async fn on_stats_tick(&mut self) {
        if self.state() != SessionState::Joined {
            return;
        }
        let now = now();
        let status = self.local_media.status();

        let level = self
            .conn
            .as_ref()
            .and_then(|conn| conn.outbound.as_ref())
            .and_then(|outbound| outbound.audio.sender_audio_level());
        let mic_event = match level {
            Some(level) => self.mic.on_level(level),
            None => None,
        };
        if let Some(event) = mic_event.or_else(|| self.mic.poll(now)) {
            self.on_mic_event(event);
        }

        let input = self.gather_stats(&status).await;
        let mut tick = self.stats.collect(input);
        for (mid, stats) in &tick.rx_video {
            self.peers.forward_rx_stats(*mid, stats, &self.slots);
        }
        let tx_stat = tick.tx_video.clone();
        self.hub
            .fire("on_video_tx_stat", |o| o.on_video_tx_stat(tx_stat.as_ref()));
        if !tick.has_traffic() {
            return;
        }

        let decision = self.quality.on_stats(&tick.quality_sample(), now);
        if let Some(rx) = decision.rx {
            let command = ClientCommand::Layer {
                spt: rx.spatial,
                tmp: rx.temporal,
                stmp: rx.screen_temporal,
            };
            if let Err(e) = self.send(command) {
                warn!(error = %e, "Failed to send layer selection");
            }
        }
        if let Some(index) = decision.tx {
            self.apply_tx_quality(index).await;
        }

        let (hires, lowres, audio) = self.peers.rx_track_counts(&self.slots);
        tick.sample.set("q", f64::from(self.quality.packed_quality()));
        tick.sample.set("av", f64::from(status.sent_av.bits()));
        tick.sample.set("nrxh", f64::from(hires));
        tick.sample.set("nrxl", f64::from(lowres));
        tick.sample.set("nrxa", f64::from(audio));
        self.recorder.on_stats(&tick.sample, now);
    }

    pub(super) fn on_speaker_tick(&mut self) {
        if self.state() != SessionState::Joined {
            return;
        }
        let now = now();
        let levels: Vec<(u32, f64)> = self
            .peers
            .speaker_audio_slots()
            .into_iter()
            .filter_map(|(cid, mid)| {
                let level = self.slots.get(mid)?.transceiver().receiver_audio_level()?;
                Some((cid, level))
            })
            .collect();
        for (cid, level) in &levels {
            if let Some(view) = self.peers.view(*cid) {
                let level = *level;
                self.hub
                    .fire("on_peer_audio_level", |o| o.on_peer_audio_level(&view, level));
            }
        }

        let own_level = if self.local_media.status().speaker == SpeakerState::Active {
            self.conn
                .as_ref()
                .and_then(|conn| conn.outbound.as_ref())
                .and_then(|outbound| outbound.audio.sender_audio_level())
                .map(|level| (level, now))
        } else {
            None
        };
        let Some(change) = self.detector.tick(&levels, own_level, now) else {
            return;
        };
        let view_of = |speaker: Option<Speaker>| {
            speaker
                .and_then(Speaker::peer_cid)
                .and_then(|cid| self.peers.view(cid))
        };
        let speaker = view_of(Some(change.speaker));
        let previous = view_of(change.previous);
        self.hub.fire("on_active_speaker_change", |o| {
            o.on_active_speaker_change(speaker.as_ref(), previous.as_ref())
        });
    }
}
