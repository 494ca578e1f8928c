//! Compressed session description record
//!
//! Carried inside `JOIN` and `ANSWER`. The transport's session description is
//! split into a common header, one reusable template per media kind and a
//! list of per-track differences.
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


use serde::{Deserialize, Serialize};

/// Track kind tag for audio sections
pub const KIND_AUDIO: &str = "a";
/// Track kind tag for video sections
pub const KIND_VIDEO: &str = "v";

/// Compact form of a full session description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSdp {
    /// Lines before the first media section
    #[serde(rename = "cmn")]
    pub common: String,
    /// Template rendered for every audio track
    #[serde(rename = "atpl")]
    pub audio_template: String,
    /// Template rendered for every video track
    #[serde(rename = "vtpl")]
    pub video_template: String,
    pub tracks: Vec<SdpTrack>,
}

/// Per-track fields of one media section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpTrack {
    /// `a`, `v`, or a truncated media type for sections that are not rendered back
    #[serde(rename = "t")]
    pub kind: String,
    /// Extra lines appended after the template
    #[serde(rename = "sdp", default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<u32>,
    /// Media track id from `a=msid`
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    /// Media stream id from `a=msid`
    #[serde(rename = "sid", default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(rename = "dir", default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrcs: Option<Vec<Ssrc>>,
    /// `a=ssrc-group` values, e.g. `FID 1 2`
    #[serde(rename = "ssrcg", default, skip_serializing_if = "Option::is_none")]
    pub ssrc_groups: Option<Vec<String>>,
}

/// Synchronization source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssrc {
    pub id: u32,
    /// Omitted when equal to the track's stream id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
}

impl SdpTrack {
    pub fn is_audio(&self) -> bool {
        self.kind == KIND_AUDIO
    }

    pub fn is_video(&self) -> bool {
        self.kind == KIND_VIDEO
    }
}

#[derive(Default)]
struct DirectionCount {
    send: usize,
    recv: usize,
    send_recv: usize,
}

impl DirectionCount {
    fn add(&mut self, direction: Option<&str>) {
        match direction {
            Some("recvonly") => self.recv += 1,
            Some("sendrecv") => self.send_recv += 1,
            Some("sendonly") => self.send += 1,
            _ => {}
        }
    }

    fn render(&self) -> String {
        let mut out = if self.send > 0 {
            format!("{} send", self.send)
        } else {
            format!("{} recv", self.recv)
        };
        if self.send_recv > 0 {
            out.push_str(&format!(", {} sendrecv", self.send_recv));
        }
        out
    }
}

impl CompressedSdp {
    /// One-line track summary used when logging signaling traffic
    pub fn summary(&self) -> String {
        let mut video = DirectionCount::default();
        let mut audio = DirectionCount::default();
        let mut svc = 0usize;
        for track in &self.tracks {
            if track.is_video() {
                svc += track
                    .ssrc_groups
                    .iter()
                    .flatten()
                    .filter(|group| group.starts_with("SIM"))
                    .count();
                video.add(track.direction.as_deref());
            } else {
                audio.add(track.direction.as_deref());
            }
        }
        let mut summary = format!("<vtracks: {}", video.render());
        if svc > 0 {
            summary.push_str(&format!(", {} SVC", svc));
        }
        summary.push_str(&format!("; atracks: {}>", audio.render()));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(kind: &str, dir: &str) -> SdpTrack {
        SdpTrack {
            kind: kind.to_string(),
            direction: Some(dir.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary() {
        let mut hires = track("v", "sendrecv");
        hires.ssrc_groups = Some(vec!["SIM 1 2 3".to_string(), "FID 1 4".to_string()]);
        let sdp = CompressedSdp {
            tracks: vec![
                track("v", "sendrecv"),
                hires,
                track("a", "sendrecv"),
                track("a", "recvonly"),
                track("v", "recvonly"),
                track("v", "recvonly"),
            ],
            ..Default::default()
        };
        assert_eq!(
            sdp.summary(),
            "<vtracks: 2 recv, 2 sendrecv, 1 SVC; atracks: 1 recv, 1 sendrecv>"
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_value(track("a", "recvonly")).unwrap();
        assert_eq!(json, serde_json::json!({"t": "a", "dir": "recvonly"}));
    }
}
