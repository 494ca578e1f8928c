//! Remote participants
//!
//! A [`PeerTable`] holds every participant of the current connection with
//! its slot references and its two video consumers: the thumbnail player and
//! the high-resolution player. Players are consumers of the
//! [`SlotRegistry`]; when a slot is reassigned under them they are destroyed,
//! and when a slot loses its last consumer the server is told the stream is
//! no longer needed. Operations return the signaling commands they produce.
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
use crate::frame_crypto::parse_iv_seed;
use crate::observer::{ObserverHub, PlayerObserver};
use crate::slots::{ConsumerId, ReleaseKind, SlotRegistry, SlotRelease};
use crate::stats::RxVideoStats;
use sfu_types::{Av, ClientCommand, PeerInfo, SpeakerTracks, TermCode, TrackAssignment};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Snapshot of a participant handed to the application
#[derive(Debug, Clone, PartialEq)]
pub struct PeerView {
    pub cid: u32,
    pub user_id: String,
    pub av: Av,
    pub is_speaker: bool,
    pub speak_requested: bool,
    pub moderator: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumerRole {
    Thumb,
    HiRes,
    /// Secondary thumbnail view of a high-resolution player
    HiResVthumb,
}

struct Player {
    id: ConsumerId,
    observer: Arc<dyn PlayerObserver>,
    slot: Option<u32>,
}

struct HiResPlayer {
    player: Player,
    divider: u8,
    vthumb_id: ConsumerId,
    vthumb_slot: Option<u32>,
}

struct Peer {
    view: PeerView,
    leaving: bool,
    vthumb_slot: Option<u32>,
    hires_slot: Option<u32>,
    audio_slot: Option<u32>,
    thumb_player: Option<Player>,
    hires_player: Option<HiResPlayer>,
}

impl Peer {
    fn players(&self) -> impl Iterator<Item = &Arc<dyn PlayerObserver>> {
        self.thumb_player
            .iter()
            .map(|p| &p.observer)
            .chain(self.hires_player.iter().map(|p| &p.player.observer))
    }
}

/// Participants of the current connection
pub struct PeerTable {
    hub: ObserverHub,
    peers: BTreeMap<u32, Peer>,
    consumers: HashMap<ConsumerId, (u32, ConsumerRole)>,
    next_consumer: u64,
    max_count: usize,
}

impl PeerTable {
    pub fn new(hub: ObserverHub) -> Self {
        Self {
            hub,
            peers: BTreeMap::new(),
            consumers: HashMap::new(),
            next_consumer: 1,
            max_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, cid: u32) -> bool {
        self.peers.contains_key(&cid)
    }

    pub fn view(&self, cid: u32) -> Option<PeerView> {
        self.peers.get(&cid).map(|peer| peer.view.clone())
    }

    pub fn views(&self) -> Vec<PeerView> {
        self.peers.values().map(|peer| peer.view.clone()).collect()
    }

    /// Connection id and user id of every participant
    pub fn recipients(&self) -> Vec<(u32, String)> {
        self.peers
            .values()
            .map(|peer| (peer.view.cid, peer.view.user_id.clone()))
            .collect()
    }

    /// Highest number of simultaneous participants seen
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn reset_max_count(&mut self) {
        self.max_count = self.peers.len();
    }

    pub fn has_thumbnail_video(&self, cid: u32) -> bool {
        self.peers.get(&cid).is_some_and(|peer| peer.thumb_player.is_some())
    }

    pub fn has_hires_video(&self, cid: u32) -> bool {
        self.peers.get(&cid).is_some_and(|peer| peer.hires_player.is_some())
    }

    /// Add a participant; `announce` is false for the peers listed in the
    /// join answer
    pub fn add(&mut self, info: &PeerInfo, announce: bool) -> PeerView {
        if let Some(peer) = self.peers.get(&info.cid) {
            warn!(cid = info.cid, "Participant already known");
            return peer.view.clone();
        }
        let view = PeerView {
            cid: info.cid,
            user_id: info.user_id.clone(),
            av: info.av,
            is_speaker: false,
            speak_requested: false,
            moderator: false,
        };
        self.peers.insert(
            info.cid,
            Peer {
                view: view.clone(),
                leaving: false,
                vthumb_slot: None,
                hires_slot: None,
                audio_slot: None,
                thumb_player: None,
                hires_player: None,
            },
        );
        self.max_count = self.max_count.max(self.peers.len());
        info!(cid = info.cid, user_id = %info.user_id, av = %info.av, "Participant added");
        if announce {
            self.hub.fire("on_peer_joined", |o| o.on_peer_joined(&view));
        }
        view
    }

    fn peer_mut(&mut self, cid: u32) -> SfuResult<&mut Peer> {
        self.peers
            .get_mut(&cid)
            .ok_or(SfuClientError::UnknownPeer { cid })
    }

    fn alloc_consumer(&mut self, cid: u32, role: ConsumerRole) -> ConsumerId {
        let id = ConsumerId(self.next_consumer);
        self.next_consumer += 1;
        self.consumers.insert(id, (cid, role));
        id
    }

    fn new_thumb_player(&mut self, cid: u32) -> SfuResult<()> {
        let view = self.peer_mut(cid)?.view.clone();
        let observer = self.hub.new_renderer(&view, false);
        let id = self.alloc_consumer(cid, ConsumerRole::Thumb);
        self.peer_mut(cid)?.thumb_player = Some(Player { id, observer, slot: None });
        Ok(())
    }

    fn new_hires_player(&mut self, cid: u32, divider: u8) -> SfuResult<()> {
        let view = self.peer_mut(cid)?.view.clone();
        let observer = self.hub.new_renderer(&view, true);
        let id = self.alloc_consumer(cid, ConsumerRole::HiRes);
        let vthumb_id = self.alloc_consumer(cid, ConsumerRole::HiResVthumb);
        self.peer_mut(cid)?.hires_player = Some(HiResPlayer {
            player: Player { id, observer, slot: None },
            divider,
            vthumb_id,
            vthumb_slot: None,
        });
        Ok(())
    }

    /// Ask the server for the participant's thumbnail video
    pub fn request_thumbnail(&mut self, cid: u32) -> SfuResult<Vec<ClientCommand>> {
        if self.peer_mut(cid)?.thumb_player.is_some() {
            warn!(cid = cid, "Thumbnail video already requested");
            return Ok(Vec::new());
        }
        self.new_thumb_player(cid)?;
        Ok(vec![ClientCommand::GetVthumbs { cids: vec![cid] }])
    }

    /// Ask the server for the participant's high-resolution video,
    /// optionally reduced by `divider` spatial layers
    pub fn request_hires(&mut self, cid: u32, divider: u8) -> SfuResult<Vec<ClientCommand>> {
        let peer = self.peer_mut(cid)?;
        if let Some(player) = &peer.hires_player {
            if player.divider != divider {
                warn!(cid = cid, divider = divider, "High-resolution video already requested, updating divider");
                return self.set_hires_divider(cid, divider);
            }
            warn!(cid = cid, "High-resolution video already requested");
            return Ok(Vec::new());
        }
        self.new_hires_player(cid, divider)?;
        Ok(vec![ClientCommand::GetHires {
            cid,
            r: 1,
            lo: (divider > 0).then_some(divider),
        }])
    }

    pub fn set_hires_divider(&mut self, cid: u32, divider: u8) -> SfuResult<Vec<ClientCommand>> {
        let peer = self.peer_mut(cid)?;
        let Some(player) = peer.hires_player.as_mut() else {
            warn!(cid = cid, "Not receiving high-resolution video from this participant");
            return Ok(Vec::new());
        };
        if divider > 2 {
            warn!(divider = divider, "Invalid resolution divider, must be 0, 1 or 2");
            return Ok(Vec::new());
        }
        player.divider = divider;
        Ok(vec![ClientCommand::HiresSetLo { cid, lo: divider }])
    }

    pub fn stop_thumbnail(
        &mut self,
        cid: u32,
        slots: &mut SlotRegistry,
    ) -> SfuResult<Vec<ClientCommand>> {
        self.peer_mut(cid)?;
        let mut out = Vec::new();
        self.destroy_thumb_player(cid, slots, &mut out);
        Ok(out)
    }

    pub fn stop_hires(
        &mut self,
        cid: u32,
        slots: &mut SlotRegistry,
    ) -> SfuResult<Vec<ClientCommand>> {
        self.peer_mut(cid)?;
        let mut out = Vec::new();
        self.destroy_hires_player(cid, slots, &mut out);
        Ok(out)
    }

    /// The server assigned slot `assignment.mid` to the participant's
    /// thumbnail (`hi_res == false`) or high-resolution video
    pub fn incoming_video(
        &mut self,
        cid: u32,
        assignment: &TrackAssignment,
        hi_res: bool,
        slots: &mut SlotRegistry,
    ) -> SfuResult<Vec<ClientCommand>> {
        if !self.peers.contains_key(&cid) {
            warn!(cid = cid, "Video track for unknown participant");
            return Ok(Vec::new());
        }
        let mid = assignment.mid;
        let Some(slot) = slots.get(mid) else {
            error!(mid = mid, "Unknown video track mid");
            return Err(SfuClientError::UnknownSlot { mid });
        };
        let previous_sender = slot.sender_cid();
        let iv = parse_iv_seed(&assignment.iv)?;
        let mut out = Vec::new();

        if let Some(prev) = previous_sender.filter(|prev| *prev != cid) {
            if let Some(peer) = self.peers.get_mut(&prev) {
                if peer.vthumb_slot == Some(mid) {
                    peer.vthumb_slot = None;
                }
                if peer.hires_slot == Some(mid) {
                    peer.hires_slot = None;
                }
            }
        }
        let peer = self.peer_mut(cid)?;
        let kind = if hi_res {
            peer.hires_slot = Some(mid);
            if peer.vthumb_slot == Some(mid) {
                if !assignment.r {
                    warn!(cid = cid, mid = mid, "Thumbnail slot switched to high resolution without reuse");
                }
                peer.vthumb_slot = None;
            }
            ReleaseKind::HiRes
        } else {
            peer.vthumb_slot = Some(mid);
            ReleaseKind::Thumb
        };

        let outcome = slots.reassign_video(
            mid,
            cid,
            &iv,
            hi_res,
            assignment.r,
            SlotRelease { cid, kind },
        )?;
        for consumer in outcome.detached {
            self.track_gone(consumer, slots, &mut out);
        }
        if let Some(release) = outcome.released {
            self.on_release(mid, release, &mut out);
        }

        let role = if hi_res {
            if self.peer_mut(cid)?.hires_player.is_none() {
                self.new_hires_player(cid, 0)?;
            }
            ConsumerRole::HiRes
        } else {
            if self.peer_mut(cid)?.thumb_player.is_none() {
                self.new_thumb_player(cid)?;
            }
            ConsumerRole::Thumb
        };
        self.attach_player(cid, role, mid, slots, &mut out)?;
        self.handle_special_cases(cid, slots, &mut out)?;
        Ok(out)
    }

    /// Participant's available media changed
    pub fn set_av(
        &mut self,
        cid: u32,
        av: Av,
        slots: &mut SlotRegistry,
    ) -> SfuResult<Vec<ClientCommand>> {
        let peer = self.peer_mut(cid)?;
        if peer.view.av == av {
            warn!(cid = cid, av = %av, "No actual change in av flags");
            return Ok(Vec::new());
        }
        peer.view.av = av;
        let mut out = Vec::new();
        self.handle_special_cases(cid, slots, &mut out)?;

        if let Some(peer) = self.peers.get(&cid) {
            let view = peer.view.clone();
            self.hub.fire("on_peer_av_change", |o| o.on_peer_av_change(&view, av));
            for player in peer.players() {
                self.hub.fire_player("on_av_change", player, |p| p.on_av_change(av));
            }
        }
        Ok(out)
    }

    /// Participant became a speaker; the audio slot carries its audio from
    /// now on. Returns commands caused by a bundled video assignment.
    pub fn add_speaker(
        &mut self,
        cid: u32,
        tracks: &SpeakerTracks,
        slots: &mut SlotRegistry,
    ) -> SfuResult<Vec<ClientCommand>> {
        let audio = tracks.audio.as_ref().ok_or_else(|| {
            SfuClientError::Protocol(format!("speaker {} without audio track", cid))
        })?;
        let peer = self.peer_mut(cid)?;
        if peer.view.is_speaker {
            error!(cid = cid, "Participant is already a speaker");
            return Ok(Vec::new());
        }
        let iv = parse_iv_seed(&audio.iv)?;
        slots.assign_audio(audio.mid, cid, &iv)?;

        let peer = self.peer_mut(cid)?;
        peer.view.is_speaker = true;
        peer.audio_slot = Some(audio.mid);
        let view = peer.view.clone();
        self.hub.fire("on_peer_speaker", |o| o.on_peer_speaker(&view));
        self.notify_players(cid, "on_speaker", |p| p.on_speaker(true));

        match &tracks.video {
            Some(video) => self.incoming_video(cid, video, true, slots),
            None => Ok(Vec::new()),
        }
    }

    /// Returns whether the participant was a speaker
    pub fn remove_speaker(&mut self, cid: u32) -> SfuResult<bool> {
        let peer = self.peer_mut(cid)?;
        if !peer.view.is_speaker {
            warn!(cid = cid, "Participant was not a speaker");
            return Ok(false);
        }
        peer.view.is_speaker = false;
        peer.audio_slot = None;
        let view = peer.view.clone();
        self.hub.fire("on_peer_no_speaker", |o| o.on_peer_no_speaker(&view));
        self.notify_players(cid, "on_speaker", |p| p.on_speaker(false));
        Ok(true)
    }

    pub fn set_speak_request(&mut self, cid: u32, requested: bool) -> SfuResult<()> {
        let peer = self.peer_mut(cid)?;
        if peer.view.speak_requested == requested {
            return Ok(());
        }
        peer.view.speak_requested = requested;
        let view = peer.view.clone();
        if requested {
            self.hub.fire("on_peer_speak_request", |o| o.on_peer_speak_request(&view));
        } else {
            self.hub
                .fire("on_peer_speak_request_del", |o| o.on_peer_speak_request_del(&view));
        }
        Ok(())
    }

    pub fn set_moderator(&mut self, cid: u32, moderator: bool) -> SfuResult<()> {
        let peer = self.peer_mut(cid)?;
        peer.view.moderator = moderator;
        let view = peer.view.clone();
        self.hub
            .fire("on_peer_moderator", |o| o.on_peer_moderator(&view, moderator));
        Ok(())
    }

    /// Remove a participant, destroying its players first
    pub fn destroy(
        &mut self,
        cid: u32,
        reason: TermCode,
        slots: &mut SlotRegistry,
    ) -> Option<PeerView> {
        let peer = self.peers.get_mut(&cid)?;
        peer.leaving = true;
        if peer.view.speak_requested {
            peer.view.speak_requested = false;
            let view = peer.view.clone();
            self.hub
                .fire("on_peer_speak_request_del", |o| o.on_peer_speak_request_del(&view));
        }
        // nothing is sent for a leaving participant
        let mut out = Vec::new();
        self.destroy_hires_player(cid, slots, &mut out);
        self.destroy_thumb_player(cid, slots, &mut out);
        debug_assert!(out.is_empty());

        let peer = self.peers.remove(&cid)?;
        if let Some(mid) = peer.audio_slot {
            if let Err(e) = slots.release_audio(mid, cid) {
                warn!(cid = cid, mid = mid, error = %e, "Failed to release audio slot");
            }
        }
        info!(cid = cid, reason = %reason, "Participant removed");
        self.hub
            .fire("on_peer_left", |o| o.on_peer_left(&peer.view, reason));
        Some(peer.view)
    }

    pub fn destroy_all(&mut self, reason: TermCode, slots: &mut SlotRegistry) -> Vec<PeerView> {
        let cids: Vec<u32> = self.peers.keys().copied().collect();
        cids.into_iter()
            .filter_map(|cid| self.destroy(cid, reason, slots))
            .collect()
    }

    /// Hand received video figures of a slot to the players showing it
    pub fn forward_rx_stats(&self, mid: u32, stats: &RxVideoStats, slots: &SlotRegistry) {
        let Some(slot) = slots.get(mid) else {
            return;
        };
        for consumer in slot.consumers() {
            let Some(&(cid, role)) = self.consumers.get(&consumer) else {
                continue;
            };
            let Some(peer) = self.peers.get(&cid) else {
                continue;
            };
            let observer = match role {
                ConsumerRole::Thumb => peer.thumb_player.as_ref().map(|p| &p.observer),
                ConsumerRole::HiRes => peer.hires_player.as_ref().map(|p| &p.player.observer),
                ConsumerRole::HiResVthumb => None,
            };
            if let Some(observer) = observer {
                self.hub.fire_player("on_rx_stats", observer, |p| p.on_rx_stats(stats));
            }
        }
    }

    /// `(cid, audio mid)` of every speaking participant
    pub fn speaker_audio_slots(&self) -> Vec<(u32, u32)> {
        self.peers
            .values()
            .filter(|peer| peer.view.is_speaker)
            .filter_map(|peer| peer.audio_slot.map(|mid| (peer.view.cid, mid)))
            .collect()
    }

    /// Number of inbound high-resolution, low-resolution and audio streams
    /// being received
    pub fn rx_track_counts(&self, slots: &SlotRegistry) -> (u32, u32, u32) {
        let (mut hires, mut lowres, mut audio) = (0, 0, 0);
        for peer in self.peers.values() {
            if peer.view.is_speaker {
                audio += 1;
            }
            if peer.view.av.is_on_hold() {
                continue;
            }
            if peer.hires_player.as_ref().is_some_and(|p| p.player.slot.is_some()) {
                hires += 1;
            }
            let thumb_slot = peer.thumb_player.as_ref().and_then(|p| p.slot);
            if thumb_slot
                .and_then(|mid| slots.get(mid))
                .is_some_and(|slot| !slot.is_hi_res())
            {
                lowres += 1;
            }
        }
        (hires, lowres, audio)
    }

    fn notify_players(&self, cid: u32, name: &str, f: impl Fn(&dyn PlayerObserver)) {
        if let Some(peer) = self.peers.get(&cid) {
            for player in peer.players() {
                self.hub.fire_player(name, player, &f);
            }
        }
    }

    /// A slot lost its last consumer
    fn on_release(&mut self, mid: u32, release: SlotRelease, out: &mut Vec<ClientCommand>) {
        let Some(peer) = self.peers.get_mut(&release.cid) else {
            debug!(cid = release.cid, mid = mid, "Slot released for a participant that is gone");
            return;
        };
        let command = match release.kind {
            ReleaseKind::Thumb => {
                if peer.vthumb_slot == Some(mid) {
                    peer.vthumb_slot = None;
                }
                ClientCommand::DelVthumbs { cids: vec![release.cid] }
            }
            ReleaseKind::HiRes => {
                if peer.hires_slot == Some(mid) {
                    peer.hires_slot = None;
                }
                ClientCommand::DelHires { cids: vec![release.cid] }
            }
        };
        if !peer.leaving {
            out.push(command);
        }
    }

    fn detach(
        &mut self,
        slots: &mut SlotRegistry,
        mid: u32,
        consumer: ConsumerId,
        out: &mut Vec<ClientCommand>,
    ) {
        if let Some(release) = slots.detach_consumer(mid, consumer) {
            self.on_release(mid, release, out);
        }
    }

    fn attach_player(
        &mut self,
        cid: u32,
        role: ConsumerRole,
        mid: u32,
        slots: &mut SlotRegistry,
        out: &mut Vec<ClientCommand>,
    ) -> SfuResult<()> {
        let peer = self.peer_mut(cid)?;
        let player = match role {
            ConsumerRole::Thumb => peer.thumb_player.as_ref(),
            ConsumerRole::HiRes => peer.hires_player.as_ref().map(|p| &p.player),
            ConsumerRole::HiResVthumb => None,
        }
        .ok_or_else(|| SfuClientError::Invariant(format!("no {:?} player for cid {}", role, cid)))?;
        let (id, current) = (player.id, player.slot);
        if current == Some(mid) {
            warn!(cid = cid, mid = mid, "Player already attached to that slot");
            return Ok(());
        }
        if let Some(prev) = current {
            warn!(cid = cid, from = prev, to = mid, "Player switching slot");
            self.detach(slots, prev, id, out);
        }
        slots.attach_consumer(mid, id)?;

        let peer = self.peer_mut(cid)?;
        let player = match role {
            ConsumerRole::Thumb => peer.thumb_player.as_mut(),
            _ => peer.hires_player.as_mut().map(|p| &mut p.player),
        };
        if let Some(player) = player {
            player.slot = Some(mid);
            let observer = player.observer.clone();
            self.hub
                .fire_player("on_attached_to_track", &observer, |p| p.on_attached_to_track(mid));
        }
        Ok(())
    }

    fn destroy_thumb_player(&mut self, cid: u32, slots: &mut SlotRegistry, out: &mut Vec<ClientCommand>) {
        let Some(player) = self.peers.get_mut(&cid).and_then(|peer| peer.thumb_player.take()) else {
            return;
        };
        self.consumers.remove(&player.id);
        if let Some(mid) = player.slot {
            self.detach(slots, mid, player.id, out);
        }
        self.hub.fire_player("on_destroy", &player.observer, |p| p.on_destroy());
    }

    fn destroy_hires_player(&mut self, cid: u32, slots: &mut SlotRegistry, out: &mut Vec<ClientCommand>) {
        let Some(hires) = self.peers.get_mut(&cid).and_then(|peer| peer.hires_player.take()) else {
            return;
        };
        self.consumers.remove(&hires.player.id);
        self.consumers.remove(&hires.vthumb_id);
        if let Some(mid) = hires.vthumb_slot {
            self.detach(slots, mid, hires.vthumb_id, out);
            self.hub
                .fire_player("on_vthumb_detach", &hires.player.observer, |p| p.on_vthumb_detach());
        }
        if let Some(mid) = hires.player.slot {
            self.detach(slots, mid, hires.player.id, out);
        }
        self.hub
            .fire_player("on_destroy", &hires.player.observer, |p| p.on_destroy());

        // the thumbnail was showing the high-resolution stream, it needs its own again
        let Some(peer) = self.peers.get(&cid) else {
            return;
        };
        if peer.leaving {
            return;
        }
        let thumb_on_hires = peer
            .thumb_player
            .as_ref()
            .and_then(|p| p.slot)
            .and_then(|mid| slots.get(mid))
            .is_some_and(|slot| slot.is_hi_res());
        if thumb_on_hires {
            out.push(ClientCommand::GetVthumbs { cids: vec![cid] });
        }
    }

    /// The slot a consumer was attached to was reassigned
    fn track_gone(&mut self, consumer: ConsumerId, slots: &mut SlotRegistry, out: &mut Vec<ClientCommand>) {
        let Some(&(cid, role)) = self.consumers.get(&consumer) else {
            return;
        };
        debug!(cid = cid, role = ?role, consumer = consumer.0, "Track gone under player");
        match role {
            ConsumerRole::Thumb => self.destroy_thumb_player(cid, slots, out),
            ConsumerRole::HiRes => self.destroy_hires_player(cid, slots, out),
            ConsumerRole::HiResVthumb => {
                let hires = self
                    .peers
                    .get_mut(&cid)
                    .and_then(|peer| peer.hires_player.as_mut());
                if let Some(hires) = hires {
                    hires.vthumb_slot = None;
                    let observer = hires.player.observer.clone();
                    self.hub
                        .fire_player("on_vthumb_detach", &observer, |p| p.on_vthumb_detach());
                }
            }
        }
    }

    /// Keep the secondary thumbnail view of a participant sending camera and
    /// screen in sync with its flags
    fn handle_special_cases(
        &mut self,
        cid: u32,
        slots: &mut SlotRegistry,
        out: &mut Vec<ClientCommand>,
    ) -> SfuResult<()> {
        let peer = self.peer_mut(cid)?;
        if peer.view.av.has_cam_and_screen() {
            let vthumb_slot = peer.vthumb_slot;
            let Some(hires) = peer.hires_player.as_mut() else {
                return Ok(());
            };
            if let (Some(mid), None) = (vthumb_slot, hires.vthumb_slot) {
                slots.attach_consumer(mid, hires.vthumb_id)?;
                hires.vthumb_slot = Some(mid);
                let observer = hires.player.observer.clone();
                self.hub
                    .fire_player("on_vthumb_attach", &observer, |p| p.on_vthumb_attach(mid));
            }
            return Ok(());
        }

        let secondary = peer
            .hires_player
            .as_mut()
            .and_then(|hires| hires.vthumb_slot.take().map(|mid| (mid, hires.vthumb_id, hires.player.observer.clone())));
        if let Some((mid, id, observer)) = secondary {
            self.detach(slots, mid, id, out);
            self.hub
                .fire_player("on_vthumb_detach", &observer, |p| p.on_vthumb_detach());
        }

        let peer = self.peer_mut(cid)?;
        let thumb_slot = peer.thumb_player.as_ref().map(|p| p.slot);
        if let (Some(current), Some(hires_slot)) = (thumb_slot, peer.hires_slot) {
            if current != Some(hires_slot) {
                self.attach_player(cid, ConsumerRole::Thumb, hires_slot, slots, out)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_crypto::{CryptoContext, FrameDecryptor, FrameEncryptor};
    use crate::observer::SessionObserver;
    use crate::transport::{
        EncodingParameters, MediaTrack, MediaType, Transceiver, TransceiverDirection,
        TransceiverStats,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubTransceiver {
        mid: u32,
        kind: MediaType,
    }

    #[async_trait]
    impl Transceiver for StubTransceiver {
        fn mid(&self) -> Option<u32> {
            Some(self.mid)
        }
        fn kind(&self) -> MediaType {
            self.kind
        }
        fn direction(&self) -> TransceiverDirection {
            TransceiverDirection::RecvOnly
        }
        async fn replace_track(&self, _track: Option<Arc<dyn MediaTrack>>) -> SfuResult<()> {
            Ok(())
        }
        async fn set_encoding_parameters(&self, _params: EncodingParameters) -> SfuResult<()> {
            Ok(())
        }
        fn install_frame_transforms(
            &self,
            _encryptor: Option<Arc<FrameEncryptor>>,
            _decryptor: Arc<FrameDecryptor>,
        ) -> SfuResult<()> {
            Ok(())
        }
        async fn stats(&self) -> SfuResult<TransceiverStats> {
            Ok(TransceiverStats::default())
        }
        fn sender_audio_level(&self) -> Option<f64> {
            None
        }
        fn receiver_audio_level(&self) -> Option<f64> {
            None
        }
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct LoggingPlayer {
        name: String,
        log: Log,
    }

    impl PlayerObserver for LoggingPlayer {
        fn on_attached_to_track(&self, mid: u32) {
            self.log.lock().unwrap().push(format!("{} attach {}", self.name, mid));
        }
        fn on_destroy(&self) {
            self.log.lock().unwrap().push(format!("{} destroy", self.name));
        }
        fn on_vthumb_attach(&self, mid: u32) {
            self.log.lock().unwrap().push(format!("{} vthumb {}", self.name, mid));
        }
        fn on_vthumb_detach(&self) {
            self.log.lock().unwrap().push(format!("{} vthumb off", self.name));
        }
    }

    #[derive(Default)]
    struct LoggingObserver {
        log: Log,
    }

    impl SessionObserver for LoggingObserver {
        fn on_peer_left(&self, peer: &PeerView, reason: TermCode) {
            self.log.lock().unwrap().push(format!("left {} {}", peer.cid, reason.0));
        }
        fn new_renderer(&self, peer: &PeerView, hi_res: bool) -> Arc<dyn PlayerObserver> {
            let name = format!("{}{}", if hi_res { "hi" } else { "th" }, peer.cid);
            Arc::new(LoggingPlayer { name, log: self.log.clone() })
        }
    }

    const IV: &str = "0102030405060708";

    fn setup() -> (PeerTable, SlotRegistry, Log) {
        let observer = Arc::new(LoggingObserver::default());
        let log = observer.log.clone();
        let table = PeerTable::new(ObserverHub::new(observer));
        let mut slots = SlotRegistry::new(Arc::new(CryptoContext::new()));
        for mid in 3..6 {
            slots
                .add(Arc::new(StubTransceiver { mid, kind: MediaType::Video }), false)
                .unwrap();
        }
        slots
            .add(Arc::new(StubTransceiver { mid: 6, kind: MediaType::Audio }), false)
            .unwrap();
        (table, slots, log)
    }

    fn peer(table: &mut PeerTable, cid: u32, av: Av) {
        table.add(&PeerInfo { cid, user_id: format!("user{}", cid), av }, true);
    }

    fn track(mid: u32, r: bool) -> TrackAssignment {
        TrackAssignment { mid, iv: IV.to_string(), r }
    }

    fn take(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn test_thumbnail_request_and_release() {
        let (mut table, mut slots, log) = setup();
        peer(&mut table, 7, Av::CAMERA);

        assert_eq!(
            table.request_thumbnail(7).unwrap(),
            vec![ClientCommand::GetVthumbs { cids: vec![7] }]
        );
        assert!(table.request_thumbnail(7).unwrap().is_empty());
        assert!(matches!(
            table.request_thumbnail(9),
            Err(SfuClientError::UnknownPeer { cid: 9 })
        ));

        assert!(table.incoming_video(7, &track(3, false), false, &mut slots).unwrap().is_empty());
        assert_eq!(take(&log), vec!["th7 attach 3"]);
        assert_eq!(slots.get(3).unwrap().consumer_count(), 1);
        assert_eq!(table.rx_track_counts(&slots), (0, 1, 0));

        assert_eq!(
            table.stop_thumbnail(7, &mut slots).unwrap(),
            vec![ClientCommand::DelVthumbs { cids: vec![7] }]
        );
        assert_eq!(take(&log), vec!["th7 destroy"]);
        assert!(!table.has_thumbnail_video(7));
    }

    #[test]
    fn test_reassigned_slot_destroys_previous_player() {
        let (mut table, mut slots, log) = setup();
        peer(&mut table, 7, Av::CAMERA);
        peer(&mut table, 8, Av::CAMERA);
        table.incoming_video(7, &track(3, false), false, &mut slots).unwrap();
        take(&log);

        let out = table.incoming_video(8, &track(3, false), false, &mut slots).unwrap();
        assert_eq!(out, vec![ClientCommand::DelVthumbs { cids: vec![7] }]);
        assert_eq!(take(&log), vec!["th7 destroy", "th8 attach 3"]);
        assert_eq!(slots.get(3).unwrap().sender_cid(), Some(8));
        assert!(!table.has_thumbnail_video(7));
    }

    #[test]
    fn test_camera_and_screen_secondary_view() {
        let (mut table, mut slots, log) = setup();
        peer(&mut table, 7, Av::CAMERA | Av::SCREEN);
        table.request_thumbnail(7).unwrap();
        table.request_hires(7, 0).unwrap();
        table.incoming_video(7, &track(3, false), false, &mut slots).unwrap();
        table.incoming_video(7, &track(4, false), true, &mut slots).unwrap();
        assert_eq!(take(&log), vec!["th7 attach 3", "hi7 vthumb 3", "hi7 attach 4"]);
        assert_eq!(slots.get(3).unwrap().consumer_count(), 2);

        // screen stopped: the thumbnail follows the high-resolution stream
        let out = table.set_av(7, Av::CAMERA, &mut slots).unwrap();
        assert_eq!(out, vec![ClientCommand::DelVthumbs { cids: vec![7] }]);
        assert_eq!(take(&log), vec!["hi7 vthumb off", "th7 attach 4"]);
        assert_eq!(slots.get(4).unwrap().consumer_count(), 2);
        assert!(table.set_av(7, Av::CAMERA, &mut slots).unwrap().is_empty());

        // without the high-resolution player the thumbnail needs its own stream
        let out = table.stop_hires(7, &mut slots).unwrap();
        assert_eq!(out, vec![ClientCommand::GetVthumbs { cids: vec![7] }]);
        assert_eq!(take(&log), vec!["hi7 destroy"]);
    }

    #[test]
    fn test_hires_divider() {
        let (mut table, _slots, _log) = setup();
        peer(&mut table, 7, Av::CAMERA);
        assert_eq!(
            table.request_hires(7, 1).unwrap(),
            vec![ClientCommand::GetHires { cid: 7, r: 1, lo: Some(1) }]
        );
        assert_eq!(
            table.request_hires(7, 2).unwrap(),
            vec![ClientCommand::HiresSetLo { cid: 7, lo: 2 }]
        );
        assert!(table.set_hires_divider(7, 3).unwrap().is_empty());
    }

    #[test]
    fn test_speaker_with_video() {
        let (mut table, mut slots, log) = setup();
        peer(&mut table, 7, Av::AUDIO | Av::CAMERA);
        let tracks = SpeakerTracks {
            audio: Some(track(6, false)),
            video: Some(track(5, false)),
        };
        table.add_speaker(7, &tracks, &mut slots).unwrap();
        assert_eq!(table.speaker_audio_slots(), vec![(7, 6)]);
        assert_eq!(slots.active_sender(6), Some(7));
        assert!(table.has_hires_video(7));
        assert_eq!(take(&log), vec!["hi7 attach 5"]);
        assert_eq!(table.rx_track_counts(&slots), (1, 0, 1));

        let no_audio = SpeakerTracks { audio: None, video: None };
        assert!(matches!(
            table.add_speaker(7, &no_audio, &mut slots),
            Err(SfuClientError::Protocol(_))
        ));
        assert!(table.remove_speaker(7).unwrap());
        assert!(!table.remove_speaker(7).unwrap());
        assert!(table.speaker_audio_slots().is_empty());
    }

    #[test]
    fn test_destroying_speaker_frees_audio_slot() {
        let (mut table, mut slots, _log) = setup();
        peer(&mut table, 7, Av::AUDIO);
        let tracks = SpeakerTracks { audio: Some(track(6, false)), video: None };
        table.add_speaker(7, &tracks, &mut slots).unwrap();
        assert_eq!(slots.get(6).unwrap().decryptor().sender_cid(), Some(7));

        table.destroy(7, TermCode::LEAVING_ROOM, &mut slots).unwrap();
        assert_eq!(slots.active_sender(6), None);
        assert_eq!(slots.get(6).unwrap().decryptor().sender_cid(), None);
    }

    #[test]
    fn test_destroy_sends_nothing_and_notifies() {
        let (mut table, mut slots, log) = setup();
        peer(&mut table, 7, Av::CAMERA);
        table.incoming_video(7, &track(3, false), false, &mut slots).unwrap();
        table.incoming_video(7, &track(4, false), true, &mut slots).unwrap();
        take(&log);

        let view = table.destroy(7, TermCode::LEAVING_ROOM, &mut slots).unwrap();
        assert_eq!(view.cid, 7);
        assert!(table.is_empty());
        assert_eq!(table.max_count(), 1);
        let log = take(&log);
        assert_eq!(log.last().map(String::as_str), Some("left 7 2"));
        assert!(log.contains(&"hi7 destroy".to_string()));
        assert!(log.contains(&"th7 destroy".to_string()));
        assert_eq!(slots.get(4).unwrap().consumer_count(), 0);
        assert!(table.destroy(7, TermCode::LEAVING_ROOM, &mut slots).is_none());
    }
}
