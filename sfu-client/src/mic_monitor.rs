//! Microphone input monitor
//!
//! While audio is being sent, a long stretch without any input level usually
//! means a hardware mute switch or a dead device. The monitor is driven by
//! the statistics tick: [`MicMuteMonitor::on_level`] with the sent audio
//! level and [`MicMuteMonitor::poll`] for the warning deadline.
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


use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Input level treated as signal
pub const SIGNAL_THRESHOLD: f64 = 0.00001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicEvent {
    /// No input was ever seen in this session
    NoMicInput,
    /// Input came back (`true`) or went silent after having been seen
    SignalDetected(bool),
}

#[derive(Debug)]
pub struct MicMuteMonitor {
    warning_after: Duration,
    avg: f64,
    running: bool,
    /// Silence warning is being shown
    indicator: bool,
    deadline: Option<Instant>,
    input_seen: bool,
}

impl MicMuteMonitor {
    pub fn new(warning_after: Duration) -> Self {
        Self {
            warning_after,
            avg: 0.0,
            running: false,
            indicator: false,
            deadline: None,
            input_seen: false,
        }
    }

    /// New connection
    pub fn reinit(&mut self) {
        self.stop();
        self.indicator = false;
        self.input_seen = false;
    }

    /// Audio started being sent
    pub fn restart(&mut self, now: Instant) {
        self.avg = 0.0;
        self.indicator = false;
        self.running = true;
        self.deadline = Some(now + self.warning_after);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.deadline = None;
    }

    pub fn input_seen(&self) -> bool {
        self.input_seen
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn poll(&mut self, now: Instant) -> Option<MicEvent> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(self.fire_warning())
            }
            _ => None,
        }
    }

    pub fn on_level(&mut self, level: f64) -> Option<MicEvent> {
        if !self.running {
            return None;
        }
        self.avg = if level > self.avg {
            level
        } else {
            (level + self.avg) / 2.0
        };

        if self.avg >= SIGNAL_THRESHOLD {
            self.input_seen = true;
            if self.deadline.take().is_some() {
                return None;
            }
            if self.indicator {
                self.indicator = false;
                info!("Microphone signal detected again");
                return Some(MicEvent::SignalDetected(true));
            }
            None
        } else if !self.indicator && self.deadline.is_none() {
            Some(self.fire_warning())
        } else {
            None
        }
    }

    fn fire_warning(&mut self) -> MicEvent {
        self.indicator = true;
        if self.input_seen {
            warn!("Microphone input went silent");
            MicEvent::SignalDetected(false)
        } else {
            warn!(after_ms = self.warning_after.as_millis() as u64, "No microphone input");
            MicEvent::NoMicInput
        }
    }
}
