//! Signaling protocol messages
//!
//! Every message is a JSON object keyed by an `a` (action) field, except the
//! `{err, msg?, by?}` termination envelope and the `{warn}` advisory envelope
//! sent by the server.
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


use crate::av::Av;
use crate::error::{Result, SfuTypesError};
use crate::sdp::CompressedSdp;
use crate::term_code::TermCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Commands sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ClientCommand {
    /// Join request carrying the compressed offer
    #[serde(rename = "JOIN")]
    Join {
        sdp: CompressedSdp,
        /// Hex encoded iv seeds of the outbound tracks, keyed by media id
        ivs: BTreeMap<u8, String>,
        av: Av,
        /// Connection id of the previous connection when reconnecting
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cid: Option<u32>,
        /// Number of thumbnails the server may start sending right away
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vthumbs: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        spk: Option<u8>,
    },

    /// Our available audio/video changed
    #[serde(rename = "AV")]
    AvUpdate { av: Av },

    #[serde(rename = "BYE")]
    Bye { rsn: TermCode },

    /// A send key wrapped for each listed recipient
    #[serde(rename = "KEY")]
    Key { id: u8, data: Vec<(u32, String)> },

    /// Request to speak, or a moderator approving `cid`
    #[serde(rename = "SPEAK_RQ")]
    SpeakRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        av: Option<Av>,
    },

    #[serde(rename = "SPEAK_RQ_DEL")]
    SpeakRequestDel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cid: Option<u32>,
    },

    #[serde(rename = "SPEAKER_DEL")]
    SpeakerDel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cid: Option<u32>,
    },

    #[serde(rename = "GET_VTHUMBS")]
    GetVthumbs { cids: Vec<u32> },

    #[serde(rename = "DEL_VTHUMBS")]
    DelVthumbs { cids: Vec<u32> },

    #[serde(rename = "GET_HIRES")]
    GetHires {
        cid: u32,
        r: u8,
        /// Spatial layer offset (resolution divider)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lo: Option<u8>,
    },

    #[serde(rename = "DEL_HIRES")]
    DelHires { cids: Vec<u32> },

    #[serde(rename = "HIRES_SET_LO")]
    HiresSetLo { cid: u32, lo: u8 },

    /// Received layer selection: spatial, temporal, screen temporal
    #[serde(rename = "LAYER")]
    Layer { spt: u8, tmp: u8, stmp: u8 },

    #[serde(rename = "MOD_ENDCALL")]
    ModEndCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anon: Option<u8>,
    },
}

impl ClientCommand {
    pub fn action(&self) -> &'static str {
        match self {
            ClientCommand::Join { .. } => "JOIN",
            ClientCommand::AvUpdate { .. } => "AV",
            ClientCommand::Bye { .. } => "BYE",
            ClientCommand::Key { .. } => "KEY",
            ClientCommand::SpeakRequest { .. } => "SPEAK_RQ",
            ClientCommand::SpeakRequestDel { .. } => "SPEAK_RQ_DEL",
            ClientCommand::SpeakerDel { .. } => "SPEAKER_DEL",
            ClientCommand::GetVthumbs { .. } => "GET_VTHUMBS",
            ClientCommand::DelVthumbs { .. } => "DEL_VTHUMBS",
            ClientCommand::GetHires { .. } => "GET_HIRES",
            ClientCommand::DelHires { .. } => "DEL_HIRES",
            ClientCommand::HiresSetLo { .. } => "HIRES_SET_LO",
            ClientCommand::Layer { .. } => "LAYER",
            ClientCommand::ModEndCall { .. } => "MOD_ENDCALL",
        }
    }
}

/// A participant as listed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub cid: u32,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub av: Av,
}

/// Server designation of an inbound slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackAssignment {
    /// Media id of the inbound slot
    pub mid: u32,
    /// Hex encoded iv seed of the sender's track
    pub iv: String,
    /// Set when the slot keeps carrying the same participant at another resolution
    #[serde(default, deserialize_with = "de_flag")]
    pub r: bool,
}

/// Tracks of a participant that became a speaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerTracks {
    #[serde(default)]
    pub audio: Option<TrackAssignment>,
    #[serde(default)]
    pub video: Option<TrackAssignment>,
}

/// Answer to our `JOIN`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Our connection id
    pub cid: u32,
    pub sdp: CompressedSdp,
    /// Time since the call started, in milliseconds
    #[serde(rename = "t", default)]
    pub join_offset_ms: u64,
    #[serde(rename = "mod", default, deserialize_with = "de_flag")]
    pub moderator: bool,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
    /// Thumbnail assignments keyed by connection id
    #[serde(default)]
    pub vthumbs: BTreeMap<String, TrackAssignment>,
    /// Current speakers keyed by connection id
    #[serde(default)]
    pub speakers: BTreeMap<String, SpeakerTracks>,
}

/// Commands sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum ServerCommand {
    #[serde(rename = "ANSWER")]
    Answer(Answer),

    #[serde(rename = "PEERJOIN")]
    PeerJoin(PeerInfo),

    #[serde(rename = "PEERLEFT")]
    PeerLeft {
        cid: u32,
        #[serde(default)]
        rsn: Option<TermCode>,
    },

    #[serde(rename = "AV")]
    AvUpdate { cid: u32, av: Av },

    /// A peer's send key, wrapped for us
    #[serde(rename = "KEY")]
    Key { from: u32, id: u8, key: String },

    #[serde(rename = "VTHUMBS")]
    Vthumbs {
        tracks: BTreeMap<String, TrackAssignment>,
    },

    #[serde(rename = "HIRES")]
    Hires {
        tracks: BTreeMap<String, TrackAssignment>,
    },

    #[serde(rename = "HIRES_START")]
    HiresStart,

    #[serde(rename = "HIRES_STOP")]
    HiresStop,

    #[serde(rename = "VTHUMB_START")]
    VthumbStart,

    #[serde(rename = "VTHUMB_STOP")]
    VthumbStop,

    #[serde(rename = "SPEAK_REQS")]
    SpeakRequests { cids: Vec<u32> },

    #[serde(rename = "SPEAK_RQ_DEL")]
    SpeakRequestDel { cid: u32 },

    /// A peer (or we, when `cid` is absent) became a speaker
    #[serde(rename = "SPEAK_ON")]
    SpeakOn {
        #[serde(default)]
        cid: Option<u32>,
        #[serde(default)]
        audio: Option<TrackAssignment>,
        #[serde(default)]
        video: Option<TrackAssignment>,
    },

    #[serde(rename = "SPEAK_OFF")]
    SpeakOff {
        #[serde(default)]
        cid: Option<u32>,
    },

    #[serde(rename = "MOD")]
    Moderator {
        #[serde(default)]
        cid: Option<u32>,
        #[serde(rename = "mod", default, deserialize_with = "de_flag")]
        moderator: bool,
    },

    #[serde(other)]
    Unknown,
}

/// Any message received on the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Command(ServerCommand),
    /// The server is closing the session
    Terminate {
        code: TermCode,
        msg: Option<String>,
        by: Option<String>,
    },
    Warning(String),
    /// Action tag not handled by this client
    Unknown { action: String },
}

impl InboundMessage {
    /// Parse a text frame from the signaling channel
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or(SfuTypesError::NotAnObject)?;

        if let Some(err) = obj.get("err") {
            let code = err
                .as_u64()
                .and_then(|code| u8::try_from(code).ok())
                .ok_or_else(|| SfuTypesError::InvalidField {
                    field: "err".to_string(),
                    reason: format!("not a termination code: {}", err),
                })?;
            let text_field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);
            return Ok(InboundMessage::Terminate {
                code: TermCode(code),
                msg: text_field("msg"),
                by: text_field("by"),
            });
        }
        if let Some(warn) = obj.get("warn") {
            let text = match warn {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(InboundMessage::Warning(text));
        }

        let action = obj
            .get("a")
            .and_then(Value::as_str)
            .ok_or_else(|| SfuTypesError::MissingField("a".to_string()))?
            .to_string();
        match serde_json::from_value::<ServerCommand>(value)? {
            ServerCommand::Unknown => Ok(InboundMessage::Unknown { action }),
            cmd => Ok(InboundMessage::Command(cmd)),
        }
    }
}

/// Parse the connection-id keys of a server track map, one entry at a time
pub fn parse_cid_map<T>(
    map: &BTreeMap<String, T>,
) -> impl Iterator<Item = Result<(u32, &T)>> + '_ {
    map.iter().map(|(key, value)| {
        key.parse::<u32>()
            .map(|cid| (cid, value))
            .map_err(|_| SfuTypesError::InvalidField {
                field: "cid".to_string(),
                reason: format!("not a connection id: {}", key),
            })
    })
}

/// Render a protocol message for logging: flags as `n(letters)` and
/// compressed descriptions as their one-line summary
pub fn render_for_log(message: &Value) -> String {
    fn rewrite(value: &mut Value) {
        if let Value::Object(map) = value {
            for (key, field) in map.iter_mut() {
                match key.as_str() {
                    "av" => {
                        if let Some(bits) = field.as_u64().and_then(|b| u8::try_from(b).ok()) {
                            *field = Value::String(Av::from_bits_retain(bits).to_string());
                        }
                    }
                    "sdp" => {
                        if let Ok(sdp) = serde_json::from_value::<CompressedSdp>(field.clone()) {
                            *field = Value::String(sdp.summary());
                        }
                    }
                    _ => rewrite(field),
                }
            }
        }
    }
    let mut copy = message.clone();
    rewrite(&mut copy);
    copy.to_string()
}

/// Accepts `true`/`false` as well as numeric flags
fn de_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Number(f64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(flag) => flag,
        Flag::Number(n) => n != 0.0,
    })
}
