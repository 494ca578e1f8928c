//! Session description compression
//!
//! The offer/answer produced by the transport repeats the same codec and
//! transport attributes for every media section. Only the first audio and the
//! first video section are kept verbatim as templates; every section is then
//! reduced to the handful of attributes that vary per track:
//!
//! - `a=mid`
//! - the direction attribute
//! - `a=msid`
//! - `a=ssrc` / `a=ssrc-group`
//!
//! Expanding renders `template + per-track lines` in that fixed order.
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


use crate::error::{SfuClientError, SfuResult};
use sfu_types::sdp::{CompressedSdp, SdpTrack, Ssrc, KIND_AUDIO, KIND_VIDEO};
use std::collections::HashSet;
use std::fmt::Write;

const ENDL: &str = "\r\n";

/// Compress a full session description
pub fn compress(sdp: &str) -> SfuResult<CompressedSdp> {
    let lines: Vec<&str> = sdp.lines().collect();
    let mut out = CompressedSdp::default();

    let first_media = next_media_line(&lines, 0);
    for line in &lines[..first_media] {
        out.common.push_str(line);
        out.common.push_str(ENDL);
    }

    let mut i = first_media;
    while i < lines.len() && (out.audio_template.is_empty() || out.video_template.is_empty()) {
        let end = next_media_line(&lines, i + 1);
        let section = &lines[i..end];
        match media_type(lines[i]) {
            "audio" if out.audio_template.is_empty() => {
                if let Some(template) = build_template(section) {
                    out.audio_template = template;
                }
            }
            "video" if out.video_template.is_empty() => {
                if let Some(template) = build_template(section) {
                    out.video_template = template;
                }
            }
            _ => {}
        }
        i = end;
    }

    let mut i = first_media;
    while i < lines.len() {
        let end = next_media_line(&lines, i + 1);
        out.tracks.push(parse_track(&lines[i..end])?);
        i = end;
    }
    Ok(out)
}

/// Expand a compressed description back to its full text form
pub fn uncompress(sdp: &CompressedSdp) -> String {
    let mut out = sdp.common.clone();
    for track in &sdp.tracks {
        let template = if track.is_audio() {
            &sdp.audio_template
        } else if track.is_video() {
            &sdp.video_template
        } else {
            continue;
        };
        render_track(&mut out, track, template);
    }
    out
}

/// Rewrite the high-resolution video track of an offer so that it announces
/// three simulcast layers, each with its retransmission stream
pub fn munge_for_svc(track: &mut SdpTrack) -> SfuResult<()> {
    let (video, rtx) = match track.ssrcs.as_deref() {
        Some([video, rtx, ..]) => (video.clone(), rtx.clone()),
        _ => {
            return Err(SfuClientError::Codec(
                "svc munging needs a video and a retransmission ssrc".to_string(),
            ))
        }
    };
    let first_group = track
        .ssrc_groups
        .as_ref()
        .and_then(|groups| groups.first().cloned())
        .ok_or_else(|| SfuClientError::Codec("svc munging needs an ssrc group".to_string()))?;

    let next = |ssrc: &Ssrc, n: u32| Ssrc {
        id: ssrc.id.wrapping_add(n),
        cname: ssrc.cname.clone(),
    };
    let (video2, video3) = (next(&video, 1), next(&video, 2));
    let (rtx2, rtx3) = (next(&rtx, 1), next(&rtx, 2));

    track.ssrc_groups = Some(vec![
        format!("SIM {} {} {}", video.id, video2.id, video3.id),
        first_group,
        format!("FID {} {}", video2.id, rtx2.id),
        format!("FID {} {}", video3.id, rtx3.id),
    ]);
    track.ssrcs = Some(vec![video, video2, video3, rtx, rtx2, rtx3]);
    Ok(())
}

fn next_media_line(lines: &[&str], from: usize) -> usize {
    lines[from.min(lines.len())..]
        .iter()
        .position(|line| line.starts_with('m'))
        .map(|pos| pos + from)
        .unwrap_or(lines.len())
}

/// `audio` from `m=audio 9 UDP/TLS/RTP/SAVPF 111`
fn media_type(line: &str) -> &str {
    line.get(2..)
        .and_then(|rest| rest.split(' ').next())
        .unwrap_or("")
}

/// Attribute name characters: `[a-zA-Z0-9-+/_]`
fn next_word(line: &str, start: usize) -> (&str, usize) {
    let bytes = line.as_bytes();
    let mut end = start.min(bytes.len());
    while end < bytes.len() {
        let ch = bytes[end];
        if ch.is_ascii_alphanumeric() || matches!(ch, b'-' | b'+' | b'/' | b'_') {
            end += 1;
        } else {
            break;
        }
    }
    (&line[start.min(end)..end], end)
}

fn attribute_name(line: &str) -> &str {
    next_word(line, 2).0
}

fn build_template(section: &[&str]) -> Option<String> {
    let (first, rest) = section.split_first()?;
    let mut template = format!("{}{}", first, ENDL);
    for line in rest {
        if !line.starts_with('a') {
            template.push_str(line);
            template.push_str(ENDL);
            continue;
        }
        match attribute_name(line) {
            // lacks the attributes needed to regenerate sending tracks
            "recvonly" => return None,
            "sendrecv" | "sendonly" | "ssrc-group" | "ssrc" | "mid" | "msid" => {}
            _ => {
                template.push_str(line);
                template.push_str(ENDL);
            }
        }
    }
    Some(template)
}

fn parse_track(section: &[&str]) -> SfuResult<SdpTrack> {
    let kind = match section.first().map(|line| media_type(line)) {
        Some("audio") => KIND_AUDIO.to_string(),
        Some("video") => KIND_VIDEO.to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let mut track = SdpTrack {
        kind,
        ..Default::default()
    };
    let mut seen_ssrcs = HashSet::new();

    for line in section.iter().skip(1).filter(|line| line.starts_with('a')) {
        let (name, name_end) = next_word(line, 2);
        let value = line.get(name_end + 1..).unwrap_or("");
        match name {
            "sendrecv" | "recvonly" | "sendonly" => {
                track.direction = Some(name.to_string());
            }
            "mid" => {
                let mid = value.trim().parse::<u32>().map_err(|_| {
                    SfuClientError::Codec(format!("non-numeric media id: {}", line))
                })?;
                track.mid = Some(mid);
            }
            "msid" => {
                let mut parts = value.split(' ');
                track.stream_id = parts.next().map(str::to_string);
                track.track_id = parts.next().map(str::to_string);
            }
            "ssrc-group" => {
                track
                    .ssrc_groups
                    .get_or_insert_with(Vec::new)
                    .push(value.to_string());
            }
            "ssrc" => {
                let (id_text, id_end) = next_word(line, name_end + 1);
                let id = id_text.parse::<u32>().map_err(|_| {
                    SfuClientError::Codec(format!("invalid ssrc line: {}", line))
                })?;
                if !seen_ssrcs.insert(id) {
                    continue;
                }
                // `a=ssrc:<id> <attribute>:<value>`
                let (_, attr_end) = next_word(line, id_end + 1);
                let (cname, _) = next_word(line, attr_end + 1);
                let cname = (Some(cname) != track.stream_id.as_deref()).then(|| cname.to_string());
                track
                    .ssrcs
                    .get_or_insert_with(Vec::new)
                    .push(Ssrc { id, cname });
            }
            _ => {}
        }
    }
    Ok(track)
}

fn render_track(out: &mut String, track: &SdpTrack, template: &str) {
    out.push_str(template);
    if let Some(extra) = &track.extra {
        out.push_str(extra);
        out.push_str(ENDL);
    }
    // Writing into a String cannot fail
    if let Some(mid) = track.mid {
        let _ = write!(out, "a=mid:{}{}", mid, ENDL);
    }
    if let Some(direction) = &track.direction {
        let _ = write!(out, "a={}{}", direction, ENDL);
    }
    let stream_id = track.stream_id.as_deref().unwrap_or_default();
    let track_id = track.track_id.as_deref().unwrap_or_default();
    if track.track_id.is_some() {
        let _ = write!(out, "a=msid:{} {}{}", stream_id, track_id, ENDL);
    }
    if let Some(ssrcs) = &track.ssrcs {
        for ssrc in ssrcs {
            let cname = ssrc.cname.as_deref().unwrap_or(stream_id);
            let _ = write!(out, "a=ssrc:{} cname:{}{}", ssrc.id, cname, ENDL);
            let _ = write!(out, "a=ssrc:{} msid:{} {}{}", ssrc.id, stream_id, track_id, ENDL);
        }
        for group in track.ssrc_groups.iter().flatten() {
            let _ = write!(out, "a=ssrc-group:{}{}", group, ENDL);
        }
    }
}
