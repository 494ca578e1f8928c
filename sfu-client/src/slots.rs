//! Transceiver slot registry
//!
//! Every transceiver created at connect time is wrapped in a [`Slot`] owned
//! by the registry and addressed by its media id. Inbound slots are assigned
//! to a participant by the server; video consumers attach to them by handle
//! and the slot counts them. When the last consumer detaches, the owner
//! supplied [`SlotRelease`] is handed back so the server can be told the
//! stream is no longer needed.
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
use crate::frame_crypto::{
    generate_iv_seed, CryptoContext, FrameDecryptor, FrameEncryptor, IvSeed,
};
use crate::transport::{MediaType, Transceiver};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle of a video consumer (renderer view)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

/// Which stream request a release cancels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Thumb,
    HiRes,
}

/// Returned when a slot loses its last consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRelease {
    pub cid: u32,
    pub kind: ReleaseKind,
}

/// Result of reassigning a video slot
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReassignOutcome {
    /// Consumers that were attached to the previous assignment
    pub detached: Vec<ConsumerId>,
    /// Release of the previous assignment, if it had consumers
    pub released: Option<SlotRelease>,
}

/// A session-owned transceiver
pub struct Slot {
    mid: u32,
    kind: MediaType,
    transceiver: Arc<dyn Transceiver>,
    /// Salt of our outbound frames on this slot
    iv_seed: Option<IvSeed>,
    encryptor: Option<Arc<FrameEncryptor>>,
    decryptor: Arc<FrameDecryptor>,
    sender_cid: Option<u32>,
    active: bool,
    is_hi_res: bool,
    consumers: BTreeSet<ConsumerId>,
    release: Option<SlotRelease>,
}

impl Slot {
    pub fn mid(&self) -> u32 {
        self.mid
    }

    pub fn kind(&self) -> MediaType {
        self.kind
    }

    pub fn transceiver(&self) -> Arc<dyn Transceiver> {
        self.transceiver.clone()
    }

    pub fn iv_seed(&self) -> Option<&IvSeed> {
        self.iv_seed.as_ref()
    }

    pub fn encryptor(&self) -> Option<Arc<FrameEncryptor>> {
        self.encryptor.clone()
    }

    pub fn decryptor(&self) -> Arc<FrameDecryptor> {
        self.decryptor.clone()
    }

    /// Participant currently carried by this slot
    pub fn sender_cid(&self) -> Option<u32> {
        self.sender_cid
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_hi_res(&self) -> bool {
        self.is_hi_res
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn has_consumer(&self, consumer: ConsumerId) -> bool {
        self.consumers.contains(&consumer)
    }

    pub fn consumers(&self) -> impl Iterator<Item = ConsumerId> + '_ {
        self.consumers.iter().copied()
    }

    fn assign(&mut self, cid: u32, iv: &IvSeed) {
        self.sender_cid = Some(cid);
        self.decryptor.assign(cid, *iv);
        self.active = true;
    }
}

/// Arena of all slots of one connection, keyed by media id
pub struct SlotRegistry {
    ctx: Arc<CryptoContext>,
    slots: BTreeMap<u32, Slot>,
}

impl SlotRegistry {
    pub fn new(ctx: Arc<CryptoContext>) -> Self {
        Self {
            ctx,
            slots: BTreeMap::new(),
        }
    }

    /// Register a transceiver whose media id is known. Outbound slots get a
    /// random iv seed and an encryptor; every slot gets a decryptor.
    pub fn add(&mut self, transceiver: Arc<dyn Transceiver>, outbound: bool) -> SfuResult<u32> {
        let mid = transceiver.mid().ok_or_else(|| {
            SfuClientError::Transport("transceiver has no media id".to_string())
        })?;
        if self.slots.contains_key(&mid) {
            return Err(SfuClientError::Invariant(format!("duplicate slot mid {}", mid)));
        }
        let (iv_seed, encryptor) = if outbound {
            let iv = generate_iv_seed();
            (Some(iv), Some(Arc::new(FrameEncryptor::new(self.ctx.clone(), iv))))
        } else {
            (None, None)
        };
        let decryptor = Arc::new(FrameDecryptor::new(mid, self.ctx.clone()));
        transceiver.install_frame_transforms(encryptor.clone(), decryptor.clone())?;

        let kind = transceiver.kind();
        self.slots.insert(
            mid,
            Slot {
                mid,
                kind,
                transceiver,
                iv_seed,
                encryptor,
                decryptor,
                sender_cid: None,
                active: false,
                is_hi_res: false,
                consumers: BTreeSet::new(),
                release: None,
            },
        );
        debug!(mid = mid, kind = ?kind, outbound = outbound, "Slot registered");
        Ok(mid)
    }

    pub fn get(&self, mid: u32) -> Option<&Slot> {
        self.slots.get(&mid)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Hex iv seed of an outbound slot
    pub fn iv_seed_hex(&self, mid: u32) -> Option<String> {
        self.slots.get(&mid).and_then(|slot| slot.iv_seed).map(hex::encode)
    }

    fn slot_of_kind(&mut self, mid: u32, kind: MediaType) -> SfuResult<&mut Slot> {
        match self.slots.get_mut(&mid) {
            Some(slot) if slot.kind == kind => Ok(slot),
            Some(_) => Err(SfuClientError::Invariant(format!(
                "slot {} is not a {:?} slot",
                mid, kind
            ))),
            None => Err(SfuClientError::UnknownSlot { mid }),
        }
    }

    /// Assign an audio slot to a speaking participant
    pub fn assign_audio(&mut self, mid: u32, cid: u32, iv: &IvSeed) -> SfuResult<()> {
        let slot = self.slot_of_kind(mid, MediaType::Audio)?;
        slot.assign(cid, iv);
        debug!(mid = mid, cid = cid, "Audio slot assigned");
        Ok(())
    }

    /// Stop decrypting `cid` on an audio slot it still carries
    pub fn release_audio(&mut self, mid: u32, cid: u32) -> SfuResult<()> {
        let slot = self.slot_of_kind(mid, MediaType::Audio)?;
        if slot.sender_cid == Some(cid) {
            slot.sender_cid = None;
            slot.active = false;
            slot.decryptor.unassign();
            debug!(mid = mid, cid = cid, "Audio slot released");
        }
        Ok(())
    }

    /// Assign a video slot. Unless `keep_consumers` is set, all current
    /// consumers are detached in one step; keeping them is only allowed when
    /// the slot switches resolution for the participant it already carries.
    pub fn reassign_video(
        &mut self,
        mid: u32,
        cid: u32,
        iv: &IvSeed,
        is_hi_res: bool,
        keep_consumers: bool,
        release: SlotRelease,
    ) -> SfuResult<ReassignOutcome> {
        let slot = self.slot_of_kind(mid, MediaType::Video)?;
        let mut outcome = ReassignOutcome::default();
        if keep_consumers {
            if slot.sender_cid != Some(cid) {
                return Err(SfuClientError::Invariant(format!(
                    "slot {} carries cid {:?}, cannot keep consumers for cid {}",
                    mid, slot.sender_cid, cid
                )));
            }
        } else if !slot.consumers.is_empty() {
            outcome.detached = std::mem::take(&mut slot.consumers).into_iter().collect();
            outcome.released = slot.release;
        }
        slot.is_hi_res = is_hi_res;
        slot.release = Some(release);
        slot.assign(cid, iv);
        debug!(
            mid = mid,
            cid = cid,
            hi_res = is_hi_res,
            detached = outcome.detached.len(),
            "Video slot reassigned"
        );
        Ok(outcome)
    }

    /// Attach a consumer; returns false if it was already attached
    pub fn attach_consumer(&mut self, mid: u32, consumer: ConsumerId) -> SfuResult<bool> {
        let slot = self.slot_of_kind(mid, MediaType::Video)?;
        if !slot.consumers.insert(consumer) {
            warn!(mid = mid, consumer = consumer.0, "Consumer already attached");
            return Ok(false);
        }
        Ok(true)
    }

    /// Detach a consumer. When the last one goes the slot becomes inactive
    /// and its release is returned. Detaching twice is a no-op.
    pub fn detach_consumer(&mut self, mid: u32, consumer: ConsumerId) -> Option<SlotRelease> {
        let slot = self.slots.get_mut(&mid)?;
        if !slot.consumers.remove(&consumer) {
            debug!(mid = mid, consumer = consumer.0, "Consumer was not attached");
            return None;
        }
        if slot.consumers.is_empty() {
            if let Some(release) = slot.release {
                slot.active = false;
                return Some(release);
            }
        }
        None
    }

    /// Participant id carried by an active slot
    pub fn active_sender(&self, mid: u32) -> Option<u32> {
        self.slots
            .get(&mid)
            .filter(|slot| slot.active)
            .and_then(|slot| slot.sender_cid)
    }

    /// Stop carrying anybody's media; used when the connection goes away
    pub fn clear(&mut self) {
        for slot in self.slots.values() {
            slot.decryptor.unassign();
        }
        self.slots.clear();
    }
}
