//! Send key lifecycle
//!
//! A rotated key is distributed to every participant as soon as it is
//! generated, but only becomes the encryption key after a short delay, and
//! only if no newer key was generated meanwhile. A flood of rotation triggers
//! therefore moves the pending key forward instead of postponing activation.
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
use crate::frame_crypto::{generate_key, xor_key, CryptoContext, FrameKey, KEY_LEN};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A locally generated send key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendKey {
    /// Monotonic sequence number within the session
    pub seq: u64,
    /// Encryption key
    pub key: FrameKey,
    /// Key material handed to the key wrapper; XORed with the call secret
    /// when one is set
    pub wire_key: FrameKey,
}

impl SendKey {
    /// Key id carried in frame headers and `KEY` messages
    pub fn id(&self) -> u8 {
        (self.seq & 0xff) as u8
    }
}

/// Tracks the newest and the active send key
#[derive(Debug, Default)]
pub struct SendKeyManager {
    call_secret: Option<FrameKey>,
    last_seq: Option<u64>,
    newest: Option<Arc<SendKey>>,
    current: Option<Arc<SendKey>>,
    /// Sequence number of a key whose distribution has not completed
    distributing: Option<u64>,
}

impl SendKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the call-wide secret from its hex form
    pub fn set_call_secret(&mut self, hex_secret: &str) -> SfuResult<()> {
        let bytes = hex::decode(hex_secret)?;
        let secret: FrameKey = bytes.try_into().map_err(|bytes: Vec<u8>| {
            SfuClientError::KeyManagement(format!(
                "call key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        self.call_secret = Some(secret);
        Ok(())
    }

    /// Undo the call secret on key material received from a peer
    pub fn peer_key_from_wire(&self, wire: &FrameKey) -> FrameKey {
        match &self.call_secret {
            Some(secret) => xor_key(wire, secret),
            None => *wire,
        }
    }

    pub fn newest(&self) -> Option<Arc<SendKey>> {
        self.newest.clone()
    }

    pub fn current(&self) -> Option<Arc<SendKey>> {
        self.current.clone()
    }

    /// Generate a new key; it becomes the newest but not the active one.
    /// Fails if the previous key's distribution has not completed.
    pub fn generate(&mut self) -> SfuResult<Arc<SendKey>> {
        if let Some(seq) = self.distributing {
            return Err(SfuClientError::Invariant(format!(
                "key {} is still being distributed",
                seq
            )));
        }
        let seq = self.last_seq.map_or(0, |seq| seq + 1);
        self.last_seq = Some(seq);

        let key = generate_key();
        let wire_key = match &self.call_secret {
            Some(secret) => xor_key(&key, secret),
            None => key,
        };
        let send_key = Arc::new(SendKey { seq, key, wire_key });
        self.newest = Some(send_key.clone());
        self.distributing = Some(seq);
        debug!(key_id = send_key.id(), seq = seq, "Generated send key");
        Ok(send_key)
    }

    /// Generate a key and make it active right away
    pub fn new_key_immediate(&mut self, ctx: &CryptoContext) -> SfuResult<Arc<SendKey>> {
        let key = self.generate()?;
        ctx.set_send_key(key.id(), &key.key)?;
        self.current = Some(key.clone());
        info!(key_id = key.id(), "Send key set");
        Ok(key)
    }

    /// Distribution of key `seq` finished, successfully or not
    pub fn mark_distributed(&mut self, seq: u64) {
        if self.distributing == Some(seq) {
            self.distributing = None;
        } else {
            warn!(seq = seq, "Distribution finished for a key that was not pending");
        }
    }

    /// Activate key `seq` if it is still the newest and later than the
    /// active one. Returns whether it was activated.
    pub fn activate_if_newest(&mut self, seq: u64, ctx: &CryptoContext) -> SfuResult<bool> {
        let key = match &self.newest {
            Some(key) if key.seq == seq => key.clone(),
            _ => {
                debug!(seq = seq, "Superseded key not activated");
                return Ok(false);
            }
        };
        if self.current.as_ref().is_some_and(|current| current.seq >= seq) {
            return Ok(false);
        }
        ctx.set_send_key(key.id(), &key.key)?;
        info!(key_id = key.id(), "Rotated send key activated");
        self.current = Some(key);
        Ok(true)
    }

    /// Forget all keys; the next generated key has id 0
    pub fn reset(&mut self) {
        self.last_seq = None;
        self.newest = None;
        self.current = None;
        self.distributing = None;
    }
}

/// What to do with our key when a participant joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKeyAction {
    /// Send the newest key to the joining participant only
    ResendNewest,
    Rotate,
}

/// Remembers the last participant join/leave to avoid rotating on quick
/// reconnects
#[derive(Debug)]
pub struct PeerChurnTracker {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl PeerChurnTracker {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn on_join(&mut self, user_id: &str, now: Instant) -> JoinKeyAction {
        let action = match &self.last {
            None => JoinKeyAction::ResendNewest,
            Some((last_user, at))
                if last_user == user_id && now.saturating_duration_since(*at) <= self.window =>
            {
                JoinKeyAction::ResendNewest
            }
            Some(_) => JoinKeyAction::Rotate,
        };
        self.last = Some((user_id.to_string(), now));
        action
    }

    pub fn on_leave(&mut self, user_id: &str, now: Instant) {
        self.last = Some((user_id.to_string(), now));
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
