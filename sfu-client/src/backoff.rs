//! Reconnect backoff
//!
//! Linear, capped: attempt `n` (0-based) waits `min(n * step, cap)`.
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


use sfu_config::ClientConfig;
use std::time::Duration;

/// Reconnect backoff state
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay added per attempt
    step: Duration,
    /// Maximum delay
    cap: Duration,
    /// Attempts since the last successful join
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(step: Duration, cap: Duration) -> Self {
        Self { step, cap, attempts: 0 }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.reconnect_step(), config.reconnect_cap())
    }

    /// Get delay for a specific attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }

    /// Delay before the next reconnect; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A join completed
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
