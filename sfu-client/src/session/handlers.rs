//! Server command dispatch and key exchange
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


use super::{now, SessionActor, Timer};
use crate::error::{SfuClientError, SfuResult};
use crate::key_rotation::{JoinKeyAction, SendKey};
use sfu_types::{
    parse_cid_map, ClientCommand, InboundMessage, PeerInfo, ServerCommand, SpeakerTracks, TermCode,
    TrackAssignment,
};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

impl SessionActor {
    /// Handle a message once the join answer has been processed
    pub(super) async fn dispatch(&mut self, message: InboundMessage) {
        let result = match message {
            InboundMessage::Command(command) => {
                let action = command_name(&command);
                self.on_command(command).await.map_err(|e| (action, e))
            }
            InboundMessage::Unknown { action } => {
                warn!(action = %action, "Ignoring unknown signaling action");
                Ok(())
            }
            InboundMessage::Terminate { .. } | InboundMessage::Warning(_) => {
                // handled before queueing
                Ok(())
            }
        };
        if let Err((action, e)) = result {
            match e {
                SfuClientError::Invariant(_) => {
                    error!(action = action, error = %e, "Invariant violated while handling command")
                }
                _ => warn!(action = action, error = %e, "Failed to handle command"),
            }
        }
    }

    async fn on_command(&mut self, command: ServerCommand) -> SfuResult<()> {
        match command {
            ServerCommand::Answer(_) => {
                warn!("Join answer received twice");
                Ok(())
            }
            ServerCommand::PeerJoin(info) => self.on_peer_join(info).await,
            ServerCommand::PeerLeft { cid, rsn } => {
                self.on_peer_left(cid, rsn.unwrap_or(TermCode::SIGNALING_DISCONNECT))
                    .await
            }
            ServerCommand::AvUpdate { cid, av } => {
                let commands = self.peers.set_av(cid, av, &mut self.slots)?;
                self.send_all(commands);
                Ok(())
            }
            ServerCommand::Key { from, id, key } => self.on_peer_key(from, id, &key).await,
            ServerCommand::Vthumbs { tracks } => self.on_video_tracks(&tracks, false),
            ServerCommand::Hires { tracks } => self.on_video_tracks(&tracks, true),
            ServerCommand::HiresStart => {
                self.local_media.set_send_hires(true).await;
                Ok(())
            }
            ServerCommand::HiresStop => {
                self.local_media.set_send_hires(false).await;
                Ok(())
            }
            ServerCommand::VthumbStart => {
                self.local_media.set_send_vthumb(true).await;
                Ok(())
            }
            ServerCommand::VthumbStop => {
                self.local_media.set_send_vthumb(false).await;
                Ok(())
            }
            ServerCommand::SpeakRequests { cids } => {
                for cid in cids {
                    if cid == self.ctx.own_cid() {
                        self.hub.fire("on_own_speak_request", |o| o.on_own_speak_request());
                    } else if let Err(e) = self.peers.set_speak_request(cid, true) {
                        warn!(cid = cid, error = %e, "Speak request from unknown participant");
                    }
                }
                Ok(())
            }
            ServerCommand::SpeakRequestDel { cid } => {
                if cid == self.ctx.own_cid() {
                    self.hub
                        .fire("on_own_speak_request_del", |o| o.on_own_speak_request_del());
                    self.local_media.speak_request_removed().await;
                    Ok(())
                } else {
                    self.peers.set_speak_request(cid, false)
                }
            }
            ServerCommand::SpeakOn { cid, audio, video } => match self.peer_target(cid) {
                None => {
                    if self.local_media.start_speaking().await {
                        self.hub.fire("on_speaker", |o| o.on_speaker());
                    } else {
                        warn!("Speaker role granted without a pending request");
                    }
                    Ok(())
                }
                Some(cid) => {
                    let tracks = SpeakerTracks { audio, video };
                    let commands = self.peers.add_speaker(cid, &tracks, &mut self.slots)?;
                    self.detector.register(cid);
                    self.send_all(commands);
                    Ok(())
                }
            },
            ServerCommand::SpeakOff { cid } => match self.peer_target(cid) {
                None => {
                    if self.local_media.stop_speaking().await {
                        self.hub.fire("on_no_speaker", |o| o.on_no_speaker());
                    }
                    Ok(())
                }
                Some(cid) => {
                    self.detector.unregister(cid);
                    self.peers.remove_speaker(cid)?;
                    Ok(())
                }
            },
            ServerCommand::Moderator { cid, moderator } => match self.peer_target(cid) {
                None => {
                    info!(moderator = moderator, "Own moderator role changed");
                    self.moderator = moderator;
                    self.hub.fire("on_moderator", |o| o.on_moderator(moderator));
                    Ok(())
                }
                Some(cid) => self.peers.set_moderator(cid, moderator),
            },
            ServerCommand::Unknown => Ok(()),
        }
    }

    /// `None` when the command is about us
    fn peer_target(&self, cid: Option<u32>) -> Option<u32> {
        cid.filter(|cid| *cid != self.ctx.own_cid())
    }

    fn on_video_tracks(
        &mut self,
        tracks: &BTreeMap<String, TrackAssignment>,
        hi_res: bool,
    ) -> SfuResult<()> {
        for entry in parse_cid_map(tracks) {
            let (cid, track) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(hi_res = hi_res, error = %e, "Ignoring video track with a malformed key");
                    continue;
                }
            };
            match self.peers.incoming_video(cid, track, hi_res, &mut self.slots) {
                Ok(commands) => self.send_all(commands),
                Err(e @ SfuClientError::Invariant(_)) => {
                    error!(cid = cid, mid = track.mid, hi_res = hi_res, error = %e, "Video track assignment inconsistent")
                }
                Err(e) => {
                    warn!(cid = cid, mid = track.mid, hi_res = hi_res, error = %e, "Video track not assigned")
                }
            }
        }
        Ok(())
    }

    async fn on_peer_join(&mut self, info: PeerInfo) -> SfuResult<()> {
        if self.peers.contains(info.cid) {
            warn!(cid = info.cid, "Join of a participant already present");
            return Ok(());
        }
        let view = self.peers.add(&info, true);
        match self.churn.on_join(&view.user_id, now()) {
            JoinKeyAction::ResendNewest => {
                let key = self.keys.newest().ok_or_else(|| {
                    SfuClientError::Invariant("participant joined before any key exists".to_string())
                })?;
                debug!(cid = view.cid, key_id = key.id(), "Sending newest key to joined participant");
                self.distribute_key(&key, &[(view.cid, view.user_id)]).await
            }
            JoinKeyAction::Rotate => self.rotate_key().await,
        }
    }

    async fn on_peer_left(&mut self, cid: u32, reason: TermCode) -> SfuResult<()> {
        let view = self
            .peers
            .destroy(cid, reason, &mut self.slots)
            .ok_or(SfuClientError::UnknownPeer { cid })?;
        let purged = self.ctx.delete_peer_keys(cid);
        debug!(cid = cid, keys = purged, "Purged keys of departed participant");
        self.detector.unregister(cid);
        self.churn.on_leave(&view.user_id, now());
        self.rotate_key().await
    }

    async fn on_peer_key(&mut self, from: u32, id: u8, wrapped: &str) -> SfuResult<()> {
        let view = self
            .peers
            .view(from)
            .ok_or(SfuClientError::UnknownPeer { cid: from })?;
        let wire_key = self
            .key_wrapper
            .unwrap_key(wrapped, &view.user_id)
            .await
            .map_err(|e| {
                SfuClientError::KeyManagement(format!("failed to unwrap key from {}: {}", from, e))
            })?;
        let key = self.keys.peer_key_from_wire(&wire_key);
        self.ctx.add_peer_key(from, id, &key)?;
        debug!(cid = from, key_id = id, "Added participant key");
        Ok(())
    }

    /// Generate a new send key, send it to every participant and activate
    /// it after the key use delay unless a newer key exists by then
    pub(super) async fn rotate_key(&mut self) -> SfuResult<()> {
        let key = self.keys.generate()?;
        info!(key_id = key.id(), "Rotating send key");
        self.schedule(
            Timer::ActivateKey { generation: self.generation, seq: key.seq },
            self.config.rotate_key_use_delay(),
            self.connection_token(),
        );
        let recipients = self.peers.recipients();
        let result = self.distribute_key(&key, &recipients).await;
        self.keys.mark_distributed(key.seq);
        result
    }

    /// Wrap a key for each recipient and send it in one `KEY` message
    pub(super) async fn distribute_key(
        &self,
        key: &SendKey,
        recipients: &[(u32, String)],
    ) -> SfuResult<()> {
        if recipients.is_empty() {
            debug!(key_id = key.id(), "No participants to send the key to");
            return Ok(());
        }
        let wrapped = futures::future::join_all(recipients.iter().map(|(cid, user_id)| async move {
            let result = self.key_wrapper.wrap_key(&key.wire_key, user_id).await;
            (*cid, result)
        }))
        .await;

        let mut data = Vec::with_capacity(wrapped.len());
        for (cid, result) in wrapped {
            match result {
                Ok(wrapped) => data.push((cid, wrapped)),
                Err(e) => warn!(cid = cid, error = %e, "Failed to wrap key for participant"),
            }
        }
        if data.is_empty() {
            return Err(SfuClientError::KeyManagement(format!(
                "key {} could not be wrapped for any participant",
                key.id()
            )));
        }
        self.send(ClientCommand::Key { id: key.id(), data })
    }
}

fn command_name(command: &ServerCommand) -> &'static str {
    match command {
        ServerCommand::Answer(_) => "ANSWER",
        ServerCommand::PeerJoin(_) => "PEERJOIN",
        ServerCommand::PeerLeft { .. } => "PEERLEFT",
        ServerCommand::AvUpdate { .. } => "AV",
        ServerCommand::Key { .. } => "KEY",
        ServerCommand::Vthumbs { .. } => "VTHUMBS",
        ServerCommand::Hires { .. } => "HIRES",
        ServerCommand::HiresStart => "HIRES_START",
        ServerCommand::HiresStop => "HIRES_STOP",
        ServerCommand::VthumbStart => "VTHUMB_START",
        ServerCommand::VthumbStop => "VTHUMB_STOP",
        ServerCommand::SpeakRequests { .. } => "SPEAK_REQS",
        ServerCommand::SpeakRequestDel { .. } => "SPEAK_RQ_DEL",
        ServerCommand::SpeakOn { .. } => "SPEAK_ON",
        ServerCommand::SpeakOff { .. } => "SPEAK_OFF",
        ServerCommand::Moderator { .. } => "MOD",
        ServerCommand::Unknown => "unknown",
    }
}
