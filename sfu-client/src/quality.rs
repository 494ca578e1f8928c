//! Adaptive quality driver
//!
//! Fed once per statistics tick. Received video quality walks a ladder of
//! spatial/temporal layer selections with hysteresis on smoothed round-trip
//! time and packet loss. Sent screen-share quality follows the smoothed
//! outbound bitrate through a table of resolution/framerate bands.
//!
//! The driver is pure: it takes the current instant explicitly and returns
//! decisions for the session to apply.
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


use crate::transport::VideoConstraints;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Received layer selections: (spatial, temporal, screen temporal)
pub const RX_QUALITY: [(u8, u8, u8); 7] = [
    (0, 0, 0),
    (0, 1, 0),
    (0, 2, 0),
    (1, 1, 1),
    (1, 2, 1),
    (2, 1, 2),
    (2, 2, 2),
];
pub const MAX_RX_QUALITY: usize = RX_QUALITY.len() - 1;

/// One sent screen quality band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxQuality {
    pub min_kbps: f64,
    pub max_kbps: f64,
    pub height: u32,
    pub frame_rate: f64,
}

const fn band(min_kbps: f64, max_kbps: f64, height: u32, frame_rate: f64) -> TxQuality {
    TxQuality { min_kbps, max_kbps, height, frame_rate }
}

pub const TX_QUALITY: [TxQuality; 10] = [
    band(0.0, 250.0, 480, 4.0),
    band(200.0, 550.0, 540, 4.0),
    band(500.0, 700.0, 720, 4.0),
    band(600.0, 800.0, 720, 8.0),
    band(700.0, 1000.0, 720, 16.0),
    band(900.0, 1200.0, 1080, 4.0),
    band(1100.0, 1400.0, 1080, 8.0),
    band(1250.0, 1600.0, 1080, 16.0),
    band(1450.0, 1800.0, 1440, 8.0),
    band(1600.0, 2300.0, 1440, 16.0),
];
pub const MAX_TX_QUALITY: usize = TX_QUALITY.len() - 1;
pub const DEFAULT_TX_QUALITY: usize = 2;
pub const DEFAULT_ASPECT_RATIO: f64 = 1.78;

const PLOST_UPPER: f64 = 20.0;
const PLOST_LOWER: f64 = 14.0;
/// Loss bursts matter by occurrence, not magnitude
const PLOST_CAP: f64 = 10.0;
const RTT_LOWER_HEADROOM: f64 = 30.0;
const RTT_UPPER_HEADROOM: f64 = 250.0;
const INITIAL_LOWEST_RTT: f64 = 10000.0;
pub const MIN_TIME_BETWEEN_SWITCHES: Duration = Duration::from_millis(6000);

/// Statistics consumed per tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualitySample {
    pub rtt_ms: Option<f64>,
    /// Packets lost per second across inbound tracks
    pub packet_loss: Option<f64>,
    /// Sent video bitrate of the high-resolution track
    pub tx_kbps: Option<f64>,
    /// The high-resolution track currently carries the screen
    pub sending_screen_hires: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSwitch {
    pub index: usize,
    pub spatial: u8,
    pub temporal: u8,
    pub screen_temporal: u8,
}

/// Decisions of one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityDecision {
    pub rx: Option<RxSwitch>,
    /// New sent screen quality index
    pub tx: Option<usize>,
}

/// Capture constraints for sent screen quality `index`
pub fn tx_constraints(index: usize, aspect_ratio: f64) -> VideoConstraints {
    let band = TX_QUALITY[index.min(MAX_TX_QUALITY)];
    VideoConstraints {
        width: Some((band.height as f64 * aspect_ratio).round() as u32),
        height: band.height,
        frame_rate: Some(band.frame_rate),
    }
}

#[derive(Debug)]
pub struct QualityDriver {
    lowest_rtt: f64,
    /// (lower, upper) round-trip thresholds
    rtt_bounds: Option<(f64, f64)>,
    ma_rtt: Option<f64>,
    ma_plost: f64,
    ma_tx_kbps: Option<f64>,
    rx_quality: usize,
    tx_quality: usize,
    primed: bool,
    last_switch: Option<Instant>,
}

impl Default for QualityDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityDriver {
    pub fn new() -> Self {
        // start a little below the top
        Self::with_initial_rx_quality(MAX_RX_QUALITY - 1)
    }

    pub fn with_initial_rx_quality(index: usize) -> Self {
        Self {
            lowest_rtt: INITIAL_LOWEST_RTT,
            rtt_bounds: None,
            ma_rtt: None,
            ma_plost: 0.0,
            ma_tx_kbps: None,
            rx_quality: index.min(MAX_RX_QUALITY),
            tx_quality: DEFAULT_TX_QUALITY,
            primed: false,
            last_switch: None,
        }
    }

    pub fn rx_quality(&self) -> usize {
        self.rx_quality
    }

    pub fn tx_quality(&self) -> usize {
        self.tx_quality
    }

    /// `rx | tx << 8`, as recorded in telemetry
    pub fn packed_quality(&self) -> u32 {
        self.rx_quality as u32 | (self.tx_quality as u32) << 8
    }

    pub fn on_stats(&mut self, sample: &QualitySample, now: Instant) -> QualityDecision {
        let mut decision = QualityDecision::default();
        let rtt = match sample.rtt_ms {
            Some(rtt) => rtt,
            None => return decision,
        };
        let plost = sample.packet_loss.unwrap_or(0.0).min(PLOST_CAP);

        let ma_rtt = match self.ma_rtt {
            None => {
                // the first sample only seeds the averages
                self.ma_rtt = Some(rtt);
                self.ma_plost = plost;
                return decision;
            }
            Some(ma) => ma,
        };
        if rtt < self.lowest_rtt {
            self.lowest_rtt = rtt;
            self.rtt_bounds = Some((rtt + RTT_LOWER_HEADROOM, rtt + RTT_UPPER_HEADROOM));
        }
        let rtt = (ma_rtt * 3.0 + rtt) / 4.0;
        self.ma_rtt = Some(rtt);
        let plost = (self.ma_plost * 3.0 + plost) / 4.0;
        self.ma_plost = plost;

        if !self.primed {
            self.primed = true;
            return decision;
        }

        let adapt_tx = sample.sending_screen_hires && sample.tx_kbps.is_some();
        let ma_tx_kbps = match (adapt_tx, sample.tx_kbps) {
            (true, Some(kbps)) => {
                let avg = match self.ma_tx_kbps {
                    Some(avg) => (avg * 5.0 + kbps) / 6.0,
                    None => kbps,
                };
                self.ma_tx_kbps = Some(avg);
                debug!(ma_tx_kbps = avg, kbps = kbps, "Sent screen bitrate");
                Some(avg)
            }
            _ => None,
        };

        if self
            .last_switch
            .is_some_and(|at| now.saturating_duration_since(at) < MIN_TIME_BETWEEN_SWITCHES)
        {
            return decision;
        }

        if let Some((lower, upper)) = self.rtt_bounds {
            if rtt > upper || plost > PLOST_UPPER {
                decision.rx = self.switch_rx(-1, now);
            } else if rtt < lower && plost < PLOST_LOWER {
                decision.rx = self.switch_rx(1, now);
            }
        }

        if let Some(kbps) = ma_tx_kbps {
            let target = self.target_tx_quality(kbps);
            if target != self.tx_quality {
                info!(from = self.tx_quality, to = target, kbps = kbps, "Switching sent screen quality");
                self.tx_quality = target;
                self.last_switch = Some(now);
                decision.tx = Some(target);
            }
        }
        decision
    }

    fn switch_rx(&mut self, delta: i32, now: Instant) -> Option<RxSwitch> {
        let target = (self.rx_quality as i32 + delta).clamp(0, MAX_RX_QUALITY as i32) as usize;
        if target == self.rx_quality {
            return None;
        }
        let (spatial, temporal, screen_temporal) = RX_QUALITY[target];
        info!(from = self.rx_quality, to = target, "Switching received quality");
        self.rx_quality = target;
        self.last_switch = Some(now);
        Some(RxSwitch { index: target, spatial, temporal, screen_temporal })
    }

    /// Walk the band table until the band contains `kbps`
    fn target_tx_quality(&self, kbps: f64) -> usize {
        let mut q = self.tx_quality;
        if kbps < TX_QUALITY[q].min_kbps {
            while q > 0 && kbps < TX_QUALITY[q].min_kbps {
                q -= 1;
            }
        } else {
            while q < MAX_TX_QUALITY && kbps > TX_QUALITY[q].max_kbps {
                q += 1;
            }
        }
        q
    }

    /// The high-resolution track started carrying the screen; returns the
    /// quality to apply
    pub fn init_tx(&mut self, now: Instant) -> usize {
        self.last_switch = Some(now);
        self.tx_quality
    }
}
