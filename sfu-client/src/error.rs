//! Error types for the SFU client
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


use sfu_types::TermCode;
use thiserror::Error;

/// Result type for client operations
pub type SfuResult<T> = Result<T, SfuClientError>;

/// Errors that can occur in the client
#[derive(Error, Debug)]
pub enum SfuClientError {
    /// Session description could not be compressed or expanded
    #[error("Session description error: {0}")]
    Codec(String),

    /// Frame or key cryptography failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Key generation, wrapping or unwrapping failed
    #[error("Key management error: {0}")]
    KeyManagement(String),

    /// Signaling channel error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Media transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local capture failure
    #[error("Local media error: {0}")]
    LocalMedia(String),

    /// Operation not allowed in the current state
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },

    #[error("Unknown peer: {cid}")]
    UnknownPeer { cid: u32 },

    #[error("Unknown slot: mid {mid}")]
    UnknownSlot { mid: u32 },

    /// Internal consistency check failed
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session task is gone
    #[error("Session closed")]
    SessionClosed,
}

impl SfuClientError {
    /// Termination code reported when this error ends a connection
    pub fn term_code(&self) -> TermCode {
        match self {
            SfuClientError::Signaling(_) => TermCode::SIGNALING_DISCONNECT,
            SfuClientError::Transport(_) => TermCode::RTC_DISCONNECT,
            SfuClientError::Codec(_) => TermCode::ERR_SDP,
            _ => TermCode::ERR_CLIENT_GENERAL,
        }
    }
}

impl From<serde_json::Error> for SfuClientError {
    fn from(err: serde_json::Error) -> Self {
        SfuClientError::Protocol(err.to_string())
    }
}

impl From<sfu_types::SfuTypesError> for SfuClientError {
    fn from(err: sfu_types::SfuTypesError) -> Self {
        SfuClientError::Protocol(err.to_string())
    }
}

impl From<hex::FromHexError> for SfuClientError {
    fn from(err: hex::FromHexError) -> Self {
        SfuClientError::Protocol(format!("invalid hex: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SfuClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SfuClientError::Signaling(err.to_string())
    }
}

impl From<sfu_config::ConfigLoadError> for SfuClientError {
    fn from(err: sfu_config::ConfigLoadError) -> Self {
        SfuClientError::Config(err.to_string())
    }
}
