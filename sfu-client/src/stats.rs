//! Per-tick statistics
//!
//! The transport reports cumulative counters. [`StatsCollector`] keeps the
//! previous reading of every source and turns each tick into rates: one
//! telemetry sample, per-slot received video figures for renderers and the
//! sent video figures for the observer.
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


use crate::quality::QualitySample;
use crate::transport::{ConnectionStats, InboundRtpStats, MediaType, OutboundRtpStats};
use std::collections::{BTreeMap, HashMap};

/// Received video figures of one slot, per second
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RxVideoStats {
    pub packet_loss: f64,
    pub nack_rate: f64,
    pub kbps: f64,
    pub key_fps: f64,
}

/// Which outbound track the sent video figures describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxVideoSource {
    HiResScreen,
    HiResCamera,
    Thumbnail,
}

impl TxVideoSource {
    pub fn tag(self) -> &'static str {
        match self {
            TxVideoSource::HiResScreen => "hi-scr",
            TxVideoSource::HiResCamera => "hi-cam",
            TxVideoSource::Thumbnail => "vthumb",
        }
    }

    pub fn is_hi_res(self) -> bool {
        self != TxVideoSource::Thumbnail
    }
}

/// Sent video figures reported to the observer
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTxStat {
    pub source: TxVideoSource,
    pub kbps: f64,
    pub key_fps: f64,
    pub fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl VideoTxStat {
    pub fn is_hi_res(&self) -> bool {
        self.source.is_hi_res()
    }
}

/// Named values of one tick. Keys starting with `_` are not recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    values: BTreeMap<String, f64>,
}

impl StatsSample {
    pub fn set(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(key, value)| (key.as_str(), *value))
    }
}

/// Counters of one inbound slot
#[derive(Debug, Clone)]
pub struct SlotRxStats {
    pub mid: u32,
    pub kind: MediaType,
    pub stats: InboundRtpStats,
}

/// Raw readings gathered for one tick
#[derive(Debug, Clone, Default)]
pub struct StatsInput {
    pub tx_video: Option<(TxVideoSource, OutboundRtpStats)>,
    pub rx: Vec<SlotRxStats>,
    pub connection: Option<ConnectionStats>,
}

/// Result of one tick
#[derive(Debug, Clone, Default)]
pub struct StatsTick {
    pub sample: StatsSample,
    pub rx_video: Vec<(u32, RxVideoStats)>,
    /// `None` when no video is being sent or no rate is known yet
    pub tx_video: Option<VideoTxStat>,
}

impl StatsTick {
    /// Connection byte rates are known; ticks without them are not recorded
    pub fn has_traffic(&self) -> bool {
        self.sample.contains("rx") || self.sample.contains("tx")
    }

    pub fn quality_sample(&self) -> QualitySample {
        let sending_screen_hires = self
            .tx_video
            .as_ref()
            .is_some_and(|tx| tx.source == TxVideoSource::HiResScreen);
        QualitySample {
            rtt_ms: self.sample.get("rtt"),
            packet_loss: self.sample.get("pl"),
            tx_kbps: self.tx_video.as_ref().filter(|tx| tx.is_hi_res()).map(|tx| tx.kbps),
            sending_screen_hires,
        }
    }
}

fn period_secs(now_ms: f64, prev_ms: f64) -> Option<f64> {
    let period = (now_ms - prev_ms) / 1000.0;
    (period > 0.0).then_some(period)
}

fn rate(now: u64, prev: u64, period: f64) -> f64 {
    now.saturating_sub(prev) as f64 / period
}

/// Converts counters to per-second rates between ticks
#[derive(Debug, Default)]
pub struct StatsCollector {
    prev_rx: HashMap<u32, InboundRtpStats>,
    prev_tx: HashMap<TxVideoSource, OutboundRtpStats>,
    prev_conn: Option<ConnectionStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.prev_rx.clear();
        self.prev_tx.clear();
        self.prev_conn = None;
    }

    pub fn collect(&mut self, input: StatsInput) -> StatsTick {
        let mut tick = StatsTick::default();
        let mut packet_loss = 0.0;
        let mut jitter_ms: Option<f64> = None;
        let mut max_rx_width: Option<u32> = None;

        for slot in input.rx {
            let prev = match self.prev_rx.insert(slot.mid, slot.stats.clone()) {
                Some(prev) => prev,
                None => continue,
            };
            let stats = &slot.stats;
            let Some(period) = period_secs(stats.timestamp_ms, prev.timestamp_ms) else {
                continue;
            };
            let lost_per_sec = (stats.packets_lost - prev.packets_lost) as f64 / period;
            packet_loss += lost_per_sec;

            match slot.kind {
                MediaType::Audio => {
                    if let Some(jitter) = stats.jitter {
                        let ms = (jitter * 1000.0).round();
                        jitter_ms = Some(jitter_ms.map_or(ms, |min| min.min(ms)));
                    }
                }
                MediaType::Video => {
                    if let Some(width) = stats.frame_width {
                        if max_rx_width.map_or(true, |max| width > max) {
                            max_rx_width = Some(width);
                            tick.sample.set("mrxw", width as f64);
                            if let Some(fps) = stats.frames_per_second {
                                tick.sample.set("mrxfps", fps);
                            }
                        }
                    }
                    tick.rx_video.push((
                        slot.mid,
                        RxVideoStats {
                            packet_loss: lost_per_sec,
                            nack_rate: rate(stats.nack_count, prev.nack_count, period),
                            kbps: rate(stats.bytes_received, prev.bytes_received, period) / 128.0,
                            key_fps: rate(stats.key_frames_decoded, prev.key_frames_decoded, period),
                        },
                    ));
                }
            }
        }

        if let Some((source, stats)) = input.tx_video {
            if let Some(prev) = self.prev_tx.insert(source, stats.clone()) {
                if let Some(period) = period_secs(stats.timestamp_ms, prev.timestamp_ms) {
                    let tx = VideoTxStat {
                        source,
                        kbps: rate(stats.bytes_sent, prev.bytes_sent, period) / 128.0,
                        key_fps: rate(stats.key_frames_encoded, prev.key_frames_encoded, period),
                        fps: stats.frames_per_second,
                        width: stats.frame_width,
                        height: stats.frame_height,
                    };
                    tick.sample.set("_vtxkbps", tx.kbps);
                    tick.sample.set("_vtxkfps", tx.key_fps);
                    if let Some(fps) = tx.fps {
                        tick.sample.set("vtxfps", fps);
                    }
                    if let Some(width) = tx.width {
                        tick.sample.set("vtxw", width as f64);
                    }
                    if let Some(height) = tx.height {
                        tick.sample.set("vtxh", height as f64);
                    }
                    tick.tx_video = Some(tx);
                }
            }
        }

        if let Some(conn) = input.connection {
            if let Some(rtt) = conn.current_round_trip_time {
                tick.sample.set("rtt", rtt * 1000.0);
            }
            if let Some(bwe) = conn.available_outgoing_bitrate {
                tick.sample.set("txBwe", (bwe / 1024.0).round());
            }
            if let Some(prev) = self.prev_conn.replace(conn.clone()) {
                if let Some(period) = period_secs(conn.timestamp_ms, prev.timestamp_ms) {
                    let rx = rate(conn.bytes_received, prev.bytes_received, period) / 128.0;
                    let tx = rate(conn.bytes_sent, prev.bytes_sent, period) / 128.0;
                    tick.sample.set("rx", rx.round());
                    tick.sample.set("tx", tx.round());
                }
            }
        }

        tick.sample.set("pl", (packet_loss * 10.0).round() / 10.0);
        tick.sample.set("jtr", jitter_ms.unwrap_or(-1.0));
        tick
    }
}
