//! Termination codes
//!
//! An 8-bit space where bit 7 marks errors and bit 6 marks disconnect-class
//! reasons. Values the client does not know are carried through unchanged.
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
use std::fmt;

/// Reason a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermCode(pub u8);

impl TermCode {
    /// Flag bit for error codes
    pub const FLAG_ERROR: u8 = 0x80;
    /// Flag bit for disconnect-class codes
    pub const FLAG_DISCONNECT: u8 = 0x40;

    pub const USER_HANGUP: TermCode = TermCode(0);
    pub const TOO_MANY_PARTICIPANTS: TermCode = TermCode(1);
    pub const LEAVING_ROOM: TermCode = TermCode(2);

    /// Media transport connection failed
    pub const RTC_DISCONNECT: TermCode = TermCode(Self::FLAG_DISCONNECT);
    /// Signaling channel dropped
    pub const SIGNALING_DISCONNECT: TermCode = TermCode(Self::FLAG_DISCONNECT | 1);
    pub const SFU_SHUTTING_DOWN: TermCode = TermCode(Self::FLAG_DISCONNECT | 2);
    pub const CHAT_DISCONNECT: TermCode = TermCode(Self::FLAG_DISCONNECT | 3);
    /// Media transport never carried any data
    pub const NO_MEDIA_PATH: TermCode = TermCode(Self::FLAG_DISCONNECT | 4);

    pub const ERR_SIGNALING: TermCode = TermCode(Self::FLAG_ERROR);
    pub const ERR_NO_CALL: TermCode = TermCode(Self::FLAG_ERROR | 1);
    pub const ERR_AUTH: TermCode = TermCode(Self::FLAG_ERROR | 2);
    pub const ERR_API_TIMEOUT: TermCode = TermCode(Self::FLAG_ERROR | 3);
    /// Malformed session description
    pub const ERR_SDP: TermCode = TermCode(Self::FLAG_ERROR | 4);
    pub const ERR_CLIENT_GENERAL: TermCode = TermCode(Self::FLAG_ERROR | 62);
    pub const ERR_SFU_GENERAL: TermCode = TermCode(Self::FLAG_ERROR | 63);

    /// Raw numeric value
    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::FLAG_ERROR != 0
    }

    pub fn is_disconnect(self) -> bool {
        self.0 & Self::FLAG_DISCONNECT != 0
    }

    /// Whether a session ending with this code reconnects automatically
    pub fn is_retriable(self) -> bool {
        self == Self::RTC_DISCONNECT || self == Self::SIGNALING_DISCONNECT
    }

    /// Symbolic name, if the code is known
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::USER_HANGUP => "UserHangup",
            Self::TOO_MANY_PARTICIPANTS => "TooManyParticipants",
            Self::LEAVING_ROOM => "LeavingRoom",
            Self::RTC_DISCONNECT => "RtcDisconnect",
            Self::SIGNALING_DISCONNECT => "SignalingDisconnect",
            Self::SFU_SHUTTING_DOWN => "SfuShuttingDown",
            Self::CHAT_DISCONNECT => "ChatDisconnect",
            Self::NO_MEDIA_PATH => "NoMediaPath",
            Self::ERR_SIGNALING => "ErrSignaling",
            Self::ERR_NO_CALL => "ErrNoCall",
            Self::ERR_AUTH => "ErrAuth",
            Self::ERR_API_TIMEOUT => "ErrApiTimeout",
            Self::ERR_SDP => "ErrSdp",
            Self::ERR_CLIENT_GENERAL => "ErrClientGeneral",
            Self::ERR_SFU_GENERAL => "ErrSfuGeneral",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u8> for TermCode {
    fn from(code: u8) -> Self {
        TermCode(code)
    }
}

impl fmt::Display for TermCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "({})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_layout() {
        assert_eq!(TermCode::RTC_DISCONNECT.code(), 64);
        assert_eq!(TermCode::NO_MEDIA_PATH.code(), 68);
        assert_eq!(TermCode::ERR_SDP.code(), 132);
        assert_eq!(TermCode::ERR_CLIENT_GENERAL.code(), 190);
        assert_eq!(TermCode::ERR_SFU_GENERAL.code(), 191);

        assert!(TermCode::SIGNALING_DISCONNECT.is_disconnect());
        assert!(!TermCode::SIGNALING_DISCONNECT.is_error());
        assert!(TermCode::ERR_AUTH.is_error());
        assert!(!TermCode::USER_HANGUP.is_error());
    }

    #[test]
    fn test_retriable_codes() {
        assert!(TermCode::RTC_DISCONNECT.is_retriable());
        assert!(TermCode::SIGNALING_DISCONNECT.is_retriable());
        assert!(!TermCode::SFU_SHUTTING_DOWN.is_retriable());
        assert!(!TermCode::NO_MEDIA_PATH.is_retriable());
        assert!(!TermCode::USER_HANGUP.is_retriable());
        assert!(!TermCode::ERR_SIGNALING.is_retriable());
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let code: TermCode = serde_json::from_str("77").unwrap();
        assert_eq!(code.code(), 77);
        assert!(code.name().is_none());
        assert_eq!(code.to_string(), "(77)");
        assert_eq!(serde_json::to_string(&code).unwrap(), "77");
        assert_eq!(TermCode::ERR_NO_CALL.to_string(), "ErrNoCall(129)");
    }
}
