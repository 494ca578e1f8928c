//! Active speaker detection
//!
//! Runs on a fixed tick. Each registered speaking peer contributes its
//! current receive level; levels are smoothed and, when detection is
//! enabled, the loudest source above [`SPEAKER_LEVEL_THRESHOLD`] becomes the
//! active speaker, changing at most once per minimum interval.
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


use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const SPEAKER_LEVEL_THRESHOLD: f64 = 0.001;
/// Our own level only counts if it was measured this recently
pub const OWN_LEVEL_MAX_AGE: Duration = Duration::from_millis(1500);

/// Who is talking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Local,
    Peer(u32),
}

impl Speaker {
    pub fn peer_cid(self) -> Option<u32> {
        match self {
            Speaker::Local => None,
            Speaker::Peer(cid) => Some(cid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerChange {
    pub speaker: Speaker,
    pub previous: Option<Speaker>,
}

#[derive(Debug)]
pub struct SpeakerDetector {
    enabled: bool,
    min_change_interval: Duration,
    /// Smoothed level per registered peer
    levels: BTreeMap<u32, f64>,
    current: Option<Speaker>,
    last_change: Option<Instant>,
}

impl SpeakerDetector {
    pub fn new(min_change_interval: Duration) -> Self {
        Self {
            enabled: false,
            min_change_interval,
            levels: BTreeMap::new(),
            current: None,
            last_change: None,
        }
    }

    pub fn enable(&mut self, enabled: bool) {
        debug!(enabled = enabled, "Active speaker detection");
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register(&mut self, cid: u32) {
        self.levels.entry(cid).or_insert(0.0);
    }

    pub fn unregister(&mut self, cid: u32) {
        self.levels.remove(&cid);
        if self.current == Some(Speaker::Peer(cid)) {
            self.current = None;
        }
    }

    pub fn registered(&self) -> impl Iterator<Item = u32> + '_ {
        self.levels.keys().copied()
    }

    pub fn has_peers(&self) -> bool {
        !self.levels.is_empty()
    }

    pub fn current(&self) -> Option<Speaker> {
        self.current
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.current = None;
    }

    /// Feed one tick of receive levels. `own_level` is the last measured
    /// send level and when it was taken.
    pub fn tick(
        &mut self,
        peer_levels: &[(u32, f64)],
        own_level: Option<(f64, Instant)>,
        now: Instant,
    ) -> Option<SpeakerChange> {
        let mut max_level = SPEAKER_LEVEL_THRESHOLD;
        let mut max_peer = None;
        for &(cid, level) in peer_levels {
            let Some(slow) = self.levels.get_mut(&cid) else {
                continue;
            };
            *slow = (*slow * 9.0 + level) / 10.0;
            if self.enabled && *slow > max_level {
                max_level = *slow;
                max_peer = Some(cid);
            }
        }
        if !self.enabled {
            return None;
        }
        let mut speaker = Speaker::Peer(max_peer?);

        let own = own_level
            .filter(|(_, at)| now.saturating_duration_since(*at) < OWN_LEVEL_MAX_AGE)
            .map_or(0.0, |(level, _)| level);
        if own > max_level {
            speaker = Speaker::Local;
        }
        if self.current == Some(speaker) {
            return None;
        }
        if self
            .last_change
            .is_some_and(|at| now.saturating_duration_since(at) < self.min_change_interval)
        {
            return None;
        }
        self.last_change = Some(now);
        let previous = self.current.replace(speaker);
        info!(speaker = ?speaker, previous = ?previous, "Active speaker changed");
        Some(SpeakerChange { speaker, previous })
    }

    /// Smoothed level of a registered peer
    pub fn level(&self, cid: u32) -> Option<f64> {
        self.levels.get(&cid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_CHANGE: Duration = Duration::from_millis(4000);

    fn detector() -> SpeakerDetector {
        let mut detector = SpeakerDetector::new(MIN_CHANGE);
        detector.register(1);
        detector.register(2);
        detector.enable(true);
        detector
    }

    #[test]
    fn test_passive_mode_only_smooths() {
        let mut detector = detector();
        detector.enable(false);
        let now = Instant::now();
        assert_eq!(detector.tick(&[(1, 1.0)], None, now), None);
        assert!((detector.level(1).unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_loudest_peer_becomes_speaker() {
        let mut detector = detector();
        let now = Instant::now();
        let change = detector.tick(&[(1, 0.5), (2, 0.9)], None, now).unwrap();
        assert_eq!(change.speaker, Speaker::Peer(2));
        assert_eq!(change.previous, None);
        assert_eq!(detector.tick(&[(1, 0.5), (2, 0.9)], None, now), None);
    }

    #[test]
    fn test_changes_are_rate_limited() {
        let mut detector = detector();
        let start = Instant::now();
        detector.tick(&[(1, 0.9)], None, start).unwrap();
        let mut at = start;
        for _ in 0..10 {
            at += Duration::from_millis(200);
            assert_eq!(detector.tick(&[(1, 0.0), (2, 1.0)], None, at), None);
        }
        let change = detector
            .tick(&[(1, 0.0), (2, 1.0)], None, start + MIN_CHANGE)
            .unwrap();
        assert_eq!(change.speaker, Speaker::Peer(2));
        assert_eq!(change.previous, Some(Speaker::Peer(1)));
    }

    #[test]
    fn test_fresh_own_level_wins() {
        let mut detector = detector();
        let now = Instant::now();
        let change = detector.tick(&[(1, 0.05)], Some((0.5, now)), now).unwrap();
        assert_eq!(change.speaker, Speaker::Local);

        let mut stale = self::detector();
        let old = now;
        let later = now + Duration::from_secs(2);
        let change = stale.tick(&[(1, 0.05)], Some((0.5, old)), later).unwrap();
        assert_eq!(change.speaker, Speaker::Peer(1));
    }

    #[test]
    fn test_unregister_clears_current() {
        let mut detector = detector();
        let now = Instant::now();
        detector.tick(&[(1, 0.9)], None, now).unwrap();
        detector.unregister(1);
        assert_eq!(detector.current(), None);
        assert_eq!(detector.tick(&[(1, 0.9)], None, now), None);
    }
}
