//! End-to-end frame encryption
//!
//! Encoded media frames are wrapped as
//!
//! ```text
//! | le32 (cid << 8 | key id) | le32 counter | ciphertext | 4 byte tag |
//! ```
//!
//! using AES-128-GCM with the 8 byte header as additional authenticated data
//! and a 96 bit nonce of `le32 counter || 8 byte salt`. The GCM tag is
//! truncated to 32 bits.
//!
//! Encryptors and decryptors run on the media path. They only read the
//! shared [`CryptoContext`], which the control path updates by swapping whole
//! snapshots.
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
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Nonce,
};
use arc_swap::{ArcSwap, ArcSwapOption};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const FRAME_HEADER_LEN: usize = 8;
pub const FRAME_TAG_LEN: usize = 4;
pub const KEY_LEN: usize = 16;
pub const SALT_LEN: usize = 8;

/// Raw 128 bit frame key
pub type FrameKey = [u8; KEY_LEN];
/// Per-track random salt, announced to the server as the track's iv
pub type IvSeed = [u8; SALT_LEN];

/// Why an inbound frame was dropped
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDropReason {
    #[error("frame shorter than header and tag")]
    TooShort,

    #[error("slot has no assigned sender")]
    Unassigned,

    #[error("frame from cid {actual}, slot assigned to cid {expected}")]
    SenderMismatch { expected: u32, actual: u32 },

    #[error("no key {key_id} for cid {cid}")]
    UnknownKey { cid: u32, key_id: u8 },

    #[error("authentication tag mismatch")]
    AuthFailed,
}

/// Generate a random frame key
pub fn generate_key() -> FrameKey {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Generate a random per-track salt
pub fn generate_iv_seed() -> IvSeed {
    let mut seed = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

/// Decode a hex iv seed as carried in track assignments
pub fn parse_iv_seed(hex_seed: &str) -> SfuResult<IvSeed> {
    let bytes = hex::decode(hex_seed)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        SfuClientError::Protocol(format!("iv seed must be {} bytes, got {}", SALT_LEN, bytes.len()))
    })
}

/// XOR a key with the call-wide secret
pub fn xor_key(key: &FrameKey, secret: &FrameKey) -> FrameKey {
    let mut out = [0u8; KEY_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = key[i] ^ secret[i];
    }
    out
}

fn key_index(cid: u32, key_id: u8) -> u32 {
    ((cid & 0x00ff_ffff) << 8) | key_id as u32
}

fn build_nonce(counter: u32, salt: &IvSeed) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce[4..].copy_from_slice(salt);
    nonce
}

fn new_cipher(key: &FrameKey) -> SfuResult<Aes128Gcm> {
    Aes128Gcm::new_from_slice(key)
        .map_err(|e| SfuClientError::Crypto(format!("Failed to create cipher: {}", e)))
}

struct ActiveSendKey {
    key_id: u8,
    cipher: Aes128Gcm,
}

/// Key state shared between the control path (single writer) and the frame
/// transforms (many readers)
pub struct CryptoContext {
    own_cid: AtomicU32,
    send_key: ArcSwapOption<ActiveSendKey>,
    /// Keyed by `cid << 8 | key id`
    peer_keys: ArcSwap<HashMap<u32, Arc<Aes128Gcm>>>,
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoContext {
    pub fn new() -> Self {
        Self {
            own_cid: AtomicU32::new(0),
            send_key: ArcSwapOption::empty(),
            peer_keys: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn set_own_cid(&self, cid: u32) {
        self.own_cid.store(cid, Ordering::Release);
    }

    pub fn own_cid(&self) -> u32 {
        self.own_cid.load(Ordering::Acquire)
    }

    /// Switch outbound encryption to `key`
    pub fn set_send_key(&self, key_id: u8, key: &FrameKey) -> SfuResult<()> {
        let cipher = new_cipher(key)?;
        self.send_key.store(Some(Arc::new(ActiveSendKey { key_id, cipher })));
        debug!(key_id = key_id, "Send key activated");
        Ok(())
    }

    pub fn send_key_id(&self) -> Option<u8> {
        self.send_key.load().as_ref().map(|key| key.key_id)
    }

    pub fn add_peer_key(&self, cid: u32, key_id: u8, key: &FrameKey) -> SfuResult<()> {
        let cipher = Arc::new(new_cipher(key)?);
        let index = key_index(cid, key_id);
        self.peer_keys.rcu(|keys| {
            let mut keys = HashMap::clone(keys);
            keys.insert(index, cipher.clone());
            keys
        });
        Ok(())
    }

    pub fn has_peer_key(&self, cid: u32, key_id: u8) -> bool {
        self.peer_keys.load().contains_key(&key_index(cid, key_id))
    }

    /// Drop every key of `cid`, returning how many were removed
    pub fn delete_peer_keys(&self, cid: u32) -> usize {
        let mut removed = 0;
        let prefix = cid & 0x00ff_ffff;
        self.peer_keys.rcu(|keys| {
            let mut keys = HashMap::clone(keys);
            let before = keys.len();
            keys.retain(|index, _| index >> 8 != prefix);
            removed = before - keys.len();
            keys
        });
        removed
    }

    /// Forget all keys and the connection id
    pub fn reset(&self) {
        self.send_key.store(None);
        self.peer_keys.store(Arc::new(HashMap::new()));
        self.own_cid.store(0, Ordering::Release);
    }

    fn peer_cipher(&self, cid: u32, key_id: u8) -> Option<Arc<Aes128Gcm>> {
        self.peer_keys.load().get(&key_index(cid, key_id)).cloned()
    }
}

/// Outbound transform of one track
pub struct FrameEncryptor {
    ctx: Arc<CryptoContext>,
    salt: IvSeed,
    counter: AtomicU32,
}

impl FrameEncryptor {
    pub fn new(ctx: Arc<CryptoContext>, salt: IvSeed) -> Self {
        Self {
            ctx,
            salt,
            counter: AtomicU32::new(0),
        }
    }

    pub fn salt(&self) -> &IvSeed {
        &self.salt
    }

    /// Encrypt one encoded frame; `None` while no send key is active
    pub fn encrypt(&self, frame: &[u8]) -> SfuResult<Option<Vec<u8>>> {
        let key = match self.ctx.send_key.load_full() {
            Some(key) => key,
            None => return Ok(None),
        };
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&key_index(self.ctx.own_cid(), key.key_id).to_le_bytes());
        header[4..].copy_from_slice(&counter.to_le_bytes());

        let nonce = build_nonce(counter, &self.salt);
        let mut body = frame.to_vec();
        let tag = key
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &header, &mut body)
            .map_err(|e| SfuClientError::Crypto(format!("Frame encryption failed: {}", e)))?;

        let mut packet = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + FRAME_TAG_LEN);
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&body);
        packet.extend_from_slice(&tag[..FRAME_TAG_LEN]);
        Ok(Some(packet))
    }
}

struct DecryptAssignment {
    sender_cid: u32,
    salt: IvSeed,
}

/// Inbound transform of one slot
pub struct FrameDecryptor {
    mid: u32,
    ctx: Arc<CryptoContext>,
    assignment: ArcSwapOption<DecryptAssignment>,
    first_frame_logged: AtomicBool,
    dropped: AtomicU64,
}

impl FrameDecryptor {
    pub fn new(mid: u32, ctx: Arc<CryptoContext>) -> Self {
        Self {
            mid,
            ctx,
            assignment: ArcSwapOption::empty(),
            first_frame_logged: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Expect frames from `sender_cid`, whose track uses `salt`
    pub fn assign(&self, sender_cid: u32, salt: IvSeed) {
        self.assignment
            .store(Some(Arc::new(DecryptAssignment { sender_cid, salt })));
        self.first_frame_logged.store(false, Ordering::Relaxed);
    }

    pub fn unassign(&self) {
        self.assignment.store(None);
    }

    pub fn sender_cid(&self) -> Option<u32> {
        self.assignment.load().as_ref().map(|a| a.sender_cid)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Decrypt one packet; failures drop just this frame
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, FrameDropReason> {
        match self.try_decrypt(packet) {
            Ok(frame) => {
                if !self.first_frame_logged.swap(true, Ordering::Relaxed) {
                    info!(mid = self.mid, sender_cid = ?self.sender_cid(), "First frame decrypted");
                }
                Ok(frame)
            }
            Err(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(mid = self.mid, reason = %reason, "Dropping inbound frame");
                Err(reason)
            }
        }
    }

    fn try_decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, FrameDropReason> {
        if packet.len() < FRAME_HEADER_LEN + FRAME_TAG_LEN {
            return Err(FrameDropReason::TooShort);
        }
        let assignment = self
            .assignment
            .load_full()
            .ok_or(FrameDropReason::Unassigned)?;

        let (header, rest) = packet.split_at(FRAME_HEADER_LEN);
        let (body, tag) = rest.split_at(rest.len() - FRAME_TAG_LEN);
        let word = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let counter = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let cid = word >> 8;
        let key_id = (word & 0xff) as u8;
        if cid != assignment.sender_cid {
            return Err(FrameDropReason::SenderMismatch {
                expected: assignment.sender_cid,
                actual: cid,
            });
        }
        let cipher = self
            .ctx
            .peer_cipher(cid, key_id)
            .ok_or(FrameDropReason::UnknownKey { cid, key_id })?;

        let nonce = build_nonce(counter, &assignment.salt);
        let nonce = Nonce::from_slice(&nonce);

        // CTR keystream is symmetric: running the encryption over the
        // ciphertext yields the plaintext
        let mut plain = body.to_vec();
        cipher
            .encrypt_in_place_detached(nonce, &[], &mut plain)
            .map_err(|_| FrameDropReason::AuthFailed)?;

        // The truncated tag can only be checked by recomputing the full one
        let mut reencrypted = plain.clone();
        let expected = cipher
            .encrypt_in_place_detached(nonce, header, &mut reencrypted)
            .map_err(|_| FrameDropReason::AuthFailed)?;
        let diff = expected[..FRAME_TAG_LEN]
            .iter()
            .zip(tag)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(FrameDropReason::AuthFailed);
        }
        Ok(plain)
    }
}
