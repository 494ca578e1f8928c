//! Connect, join, teardown and reconnect
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


use super::{
    now, Connection, Request, SessionActor, SessionSnapshot, SessionState, Timer, AUDIO_MID,
    HIRES_MID, THUMB_MID,
};
use crate::error::{SfuClientError, SfuResult};
use crate::local_media::{OutboundTransceivers, SpeakerState};
use crate::sdp_compress::{compress, munge_for_svc, uncompress};
use crate::signaling::{encode_command, SignalingChannel, SignalingEvent};
use crate::stats_recorder::ReportContext;
use crate::transport::{EncodingParameters, MediaType, TransceiverDirection, TransportEvent};
use sfu_types::{parse_cid_map, Answer, ClientCommand, InboundMessage, ServerCommand, TermCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Thumbnails are encoded at this many lines
const THUMB_HEIGHT: f64 = 90.0;
const THUMB_MAX_BITRATE: u32 = 100 * 1024;

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl SessionActor {
    pub(super) async fn run(mut self) {
        debug!("Session loop started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                event = recv_opt(&mut self.signaling_rx) => {
                    let event = event.unwrap_or(SignalingEvent::Closed(None));
                    self.on_signaling_event(event).await;
                }
                event = recv_opt(&mut self.transport_rx) => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => self.transport_rx = None,
                },
                Some(event) = self.media_rx.recv() => self.on_local_media_event(event).await,
                Some(timer) = self.timers_rx.recv() => self.on_timer(timer).await,
                _ = tick_opt(&mut self.stats_interval) => self.on_stats_tick().await,
                _ = tick_opt(&mut self.speaker_interval) => self.on_speaker_tick(),
            }
        }

        // every handle is gone
        self.cancel_reconnect();
        if self.state().is_active() {
            self.terminate(TermCode::USER_HANGUP, true).await;
        }
        self.local_media.stop_local_tracks().await;
        debug!("Session loop terminated");
    }

    pub(super) fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub(super) fn set_state(&self, state: SessionState) {
        let old = self.state_tx.send_replace(state);
        if old != state {
            info!(from = %old, to = %state, "Session state changed");
        }
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Request::Disconnect(reason, reply) => {
                self.disconnect(reason).await;
                let _ = reply.send(Ok(()));
            }
            Request::Send(command, reply) => {
                let result = match self.state() {
                    SessionState::Joined => self.send(command),
                    state => Err(SfuClientError::InvalidState { state: state.to_string() }),
                };
                let _ = reply.send(result);
            }
            Request::Video(request, reply) => {
                let _ = reply.send(self.video_request(request));
            }
            Request::SpeakerDetection(enable) => self.detector.enable(enable),
            Request::InitialVthumbs(count) => self.initial_vthumbs = count,
            Request::Snapshot(reply) => {
                let _ = reply.send(SessionSnapshot {
                    state: self.state(),
                    cid: self.conn.as_ref().and_then(|conn| conn.cid),
                    moderator: self.moderator,
                    peers: self.peers.views(),
                });
            }
        }
    }

    /// Queue a command on the signaling channel
    pub(super) fn send(&self, command: ClientCommand) -> SfuResult<()> {
        let channel = self
            .conn
            .as_ref()
            .and_then(|conn| conn.signaling.as_ref())
            .ok_or(SfuClientError::SessionClosed)?;
        let text = encode_command(&command)?;
        channel
            .send(text)
            .map_err(|_| SfuClientError::Signaling("signaling channel closed".to_string()))
    }

    /// Send commands produced by a component, logging failures
    pub(super) fn send_all(&self, commands: Vec<ClientCommand>) {
        for command in commands {
            let action = command.action();
            if let Err(e) = self.send(command) {
                warn!(action = action, error = %e, "Failed to send command");
            }
        }
    }

    /// Deliver `timer` after `delay` unless `token` is cancelled first
    pub(super) fn schedule(&self, timer: Timer, delay: Duration, token: CancellationToken) {
        let timers = self.timers_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(timer = ?timer, "Timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let _ = timers.send(timer);
                }
            }
        });
    }

    /// Token of the current connection; an already cancelled one otherwise
    pub(super) fn connection_token(&self) -> CancellationToken {
        match &self.conn {
            Some(conn) => conn.token.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::ActivateKey { generation, seq } => {
                if generation != self.generation {
                    debug!(seq = seq, "Key activation from a previous connection ignored");
                    return;
                }
                if let Err(e) = self.keys.activate_if_newest(seq, &self.ctx) {
                    error!(seq = seq, error = %e, "Failed to activate send key");
                }
            }
            Timer::Reconnect => {
                if self.state() != SessionState::RetryingDisconnected {
                    debug!(state = %self.state(), "Reconnect no longer needed");
                    return;
                }
                self.reconnect_token = None;
                if let Err(e) = self.connect().await {
                    error!(error = %e, "Reconnect failed");
                }
            }
            Timer::ApplyTxQuality { generation } => {
                if generation != self.generation {
                    return;
                }
                let index = self.quality.tx_quality();
                self.apply_tx_quality(index).await;
            }
        }
    }

    async fn connect(&mut self) -> SfuResult<()> {
        let state = self.state();
        if state.is_active() {
            return Err(SfuClientError::InvalidState { state: state.to_string() });
        }
        self.cancel_reconnect();
        self.generation += 1;
        self.mic.reinit();
        self.set_state(SessionState::Connecting);
        self.hub.fire("on_connecting", |o| o.on_connecting());

        if let Err(e) = self.open_connection().await {
            let code = e.term_code();
            error!(error = %e, code = %code, "Connection attempt failed");
            self.terminate(code, false).await;
        }
        Ok(())
    }

    async fn open_connection(&mut self) -> SfuResult<()> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self.transport_factory.create(events_tx).await?;
        self.transport_rx = Some(events_rx);
        self.conn = Some(Connection {
            generation: self.generation,
            token: CancellationToken::new(),
            transport: transport.clone(),
            outbound: None,
            inbound: Vec::new(),
            signaling: None,
            started_at: now(),
            cid: None,
            join_offset_ms: 0,
        });

        let thumb = transport
            .add_transceiver(MediaType::Video, TransceiverDirection::SendRecv)
            .await?;
        let hires = transport
            .add_transceiver(MediaType::Video, TransceiverDirection::SendRecv)
            .await?;
        let audio = transport
            .add_transceiver(MediaType::Audio, TransceiverDirection::SendRecv)
            .await?;
        let mut inbound = Vec::new();
        for _ in 1..self.config.max_active_speakers {
            inbound.push(
                transport
                    .add_transceiver(MediaType::Audio, TransceiverDirection::RecvOnly)
                    .await?,
            );
        }
        for _ in 2..self.config.max_input_video_tracks {
            inbound.push(
                transport
                    .add_transceiver(MediaType::Video, TransceiverDirection::RecvOnly)
                    .await?,
            );
        }
        debug!(inbound = inbound.len(), "Transceivers created");
        if let Some(conn) = self.conn.as_mut() {
            conn.outbound = Some(OutboundTransceivers { thumb, hires, audio });
            conn.inbound = inbound;
        }

        let channel = self.connector.connect(&self.url).await?;
        self.on_channel_open(channel).await
    }

    async fn on_channel_open(&mut self, channel: SignalingChannel) -> SfuResult<()> {
        let conn = self.conn.as_mut().ok_or(SfuClientError::SessionClosed)?;
        conn.signaling = Some(channel.outgoing);
        let transport = conn.transport.clone();
        let outbound = conn
            .outbound
            .clone()
            .ok_or_else(|| SfuClientError::Invariant("outbound transceivers missing".to_string()))?;
        let inbound = std::mem::take(&mut conn.inbound);
        self.signaling_rx = Some(channel.incoming);
        self.pending = Some(Vec::new());
        self.set_state(SessionState::Joining);
        self.hub.fire("on_connected", |o| o.on_connected());

        let speaker = if !self.is_group {
            SpeakerState::Active
        } else if self.moderator && self.speak {
            SpeakerState::Pending
        } else {
            SpeakerState::NoSpeaker
        };
        self.local_media.reset_speaker(speaker).await;
        self.local_media.attach(outbound.clone()).await;
        self.local_media.update_sent_tracks().await;

        let offer = transport.create_offer().await?;
        let mut sdp = compress(&offer)?;
        match sdp.tracks.iter_mut().find(|track| track.mid == Some(HIRES_MID)) {
            Some(track) => {
                if let Err(e) = munge_for_svc(track) {
                    warn!(error = %e, "Offer not munged for scalable video");
                }
            }
            None => warn!("Offer has no high-resolution video track"),
        }
        transport.set_local_description(&uncompress(&sdp)).await?;
        debug!(sdp = %sdp.summary(), "Local description set");

        self.slots.clear();
        self.slots.add(outbound.thumb.clone(), true)?;
        self.slots.add(outbound.hires.clone(), true)?;
        self.slots.add(outbound.audio.clone(), true)?;
        for transceiver in inbound {
            self.slots.add(transceiver, false)?;
        }
        let mut ivs = BTreeMap::new();
        for mid in [THUMB_MID, HIRES_MID, AUDIO_MID] {
            let iv = self.slots.iv_seed_hex(mid).ok_or_else(|| {
                SfuClientError::Invariant(format!("outbound slot {} has no iv seed", mid))
            })?;
            ivs.insert(mid as u8, iv);
        }

        let spk = (self.moderator && self.speak).then_some(1);
        self.send(ClientCommand::Join {
            sdp,
            ivs,
            av: self.local_media.status().avail_av,
            cid: self.prev_cid,
            vthumbs: self.initial_vthumbs,
            spk,
        })
    }

    pub(super) async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(text) => {
                let message = match InboundMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed signaling message");
                        return;
                    }
                };
                self.on_message(message).await;
            }
            SignalingEvent::Closed(reason) => {
                self.signaling_rx = None;
                if self.state().is_active() {
                    warn!(reason = ?reason, "Signaling connection lost");
                    self.terminate(TermCode::SIGNALING_DISCONNECT, false).await;
                }
            }
        }
    }

    async fn on_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Terminate { code, msg, by } => {
                warn!(code = %code, msg = ?msg, by = ?by, "Server terminated the session");
                self.terminate(code, false).await;
            }
            InboundMessage::Warning(warning) => {
                warn!(warning = %warning, "Server warning");
                self.hub.fire("on_server_warning", |o| o.on_server_warning(&warning));
            }
            InboundMessage::Command(ServerCommand::Answer(answer)) => {
                if let Err(e) = self.on_answer(answer).await {
                    error!(error = %e, "Failed to process join answer");
                    self.terminate(e.term_code(), false).await;
                }
            }
            message => match self.pending.as_mut() {
                Some(pending) => {
                    debug!(queued = pending.len() + 1, "Holding message until joined");
                    pending.push(message);
                }
                None => self.dispatch(message).await,
            },
        }
    }

    async fn on_answer(&mut self, answer: Answer) -> SfuResult<()> {
        if self.state() != SessionState::Joining {
            warn!(state = %self.state(), "Unexpected join answer");
            return Ok(());
        }
        let now = now();
        let conn = self.conn.as_mut().ok_or(SfuClientError::SessionClosed)?;
        conn.cid = Some(answer.cid);
        conn.join_offset_ms = answer.join_offset_ms;
        let transport = conn.transport.clone();
        let thumb = conn.outbound.as_ref().map(|outbound| outbound.thumb.clone());
        self.ctx.set_own_cid(answer.cid);
        self.prev_cid = Some(answer.cid);
        info!(cid = answer.cid, peers = answer.peers.len(), "Joined call");
        if answer.moderator != self.moderator {
            self.moderator = answer.moderator;
            let moderator = answer.moderator;
            self.hub.fire("on_moderator", |o| o.on_moderator(moderator));
        }

        self.recorder.reset();
        self.recorder.start(now);
        self.stats.reset();
        self.keys.reset();
        self.churn.reset();
        let key = self.keys.new_key_immediate(&self.ctx)?;

        for info in &answer.peers {
            self.peers.add(info, false);
        }
        self.peers.reset_max_count();
        let recipients = self.peers.recipients();
        let distributed = self.distribute_key(&key, &recipients).await;
        self.keys.mark_distributed(key.seq);
        if let Err(e) = distributed {
            error!(error = %e, "Failed to send the initial key");
        }

        if let Err(e) = transport.set_remote_description(&uncompress(&answer.sdp)).await {
            error!(error = %e, "Failed to apply the remote description");
            self.terminate(TermCode::ERR_SDP, false).await;
            return Ok(());
        }

        self.set_state(SessionState::Joined);
        self.backoff.reset();
        self.hub.fire("on_joined", |o| o.on_joined());
        self.stats_interval = Some(periodic(self.config.stats_interval()));
        self.speaker_interval = Some(periodic(self.config.speaker_detector_tick()));

        if let Some(thumb) = thumb {
            let height = self.local_media.status().thumb_source_height;
            let params = EncodingParameters {
                scale_resolution_down_by: Some(f64::from(height) / THUMB_HEIGHT),
                max_bitrate: Some(THUMB_MAX_BITRATE),
            };
            if let Err(e) = thumb.set_encoding_parameters(params).await {
                warn!(error = %e, "Failed to set thumbnail encoding parameters");
            }
        }

        for entry in parse_cid_map(&answer.vthumbs) {
            let (cid, track) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Ignoring thumbnail track with a malformed key");
                    continue;
                }
            };
            match self.peers.incoming_video(cid, track, false, &mut self.slots) {
                Ok(commands) => self.send_all(commands),
                Err(e) => warn!(cid = cid, error = %e, "Failed to assign thumbnail track"),
            }
        }
        for entry in parse_cid_map(&answer.speakers) {
            let (cid, tracks) = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Ignoring speaker with a malformed key");
                    continue;
                }
            };
            match self.peers.add_speaker(cid, tracks, &mut self.slots) {
                Ok(commands) => {
                    self.detector.register(cid);
                    self.send_all(commands);
                }
                Err(e) => warn!(cid = cid, error = %e, "Failed to add speaker"),
            }
        }

        let pending = self.pending.take().unwrap_or_default();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Replaying held messages");
        }
        for message in pending {
            // a replayed message may end the connection
            if self.state() != SessionState::Joined {
                break;
            }
            self.dispatch(message).await;
        }
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => info!("Media transport connected"),
            TransportEvent::Failed => {
                let Some(conn) = &self.conn else {
                    return;
                };
                if !matches!(self.state(), SessionState::Joining | SessionState::Joined) {
                    return;
                }
                let age = now().saturating_duration_since(conn.started_at);
                let code = if self.recorder.sample_count() == 0
                    && age > self.config.no_media_path_timeout()
                {
                    TermCode::NO_MEDIA_PATH
                } else {
                    TermCode::RTC_DISCONNECT
                };
                error!(code = %code, age_ms = age.as_millis() as u64, "Media transport failed");
                self.terminate(code, false).await;
            }
        }
    }

    async fn disconnect(&mut self, reason: TermCode) {
        match self.state() {
            SessionState::Disconnected => debug!("Already disconnected"),
            SessionState::RetryingDisconnected => {
                self.cancel_reconnect();
                self.prev_cid = None;
                self.set_state(SessionState::Disconnected);
                self.local_media.stop_local_tracks().await;
                info!(reason = %reason, "Reconnect cancelled");
                self.hub.fire("on_disconnect", |o| o.on_disconnect(reason, false));
            }
            _ => self.terminate(reason, true).await,
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect_token.take() {
            debug!("Cancelling pending reconnect");
            token.cancel();
        }
    }

    /// End the current connection. `by_user` sends `BYE` and never retries.
    pub(super) async fn terminate(&mut self, code: TermCode, by_user: bool) {
        let state = self.state();
        if !state.is_active() {
            return;
        }
        let retry = !by_user && code.is_retriable();
        info!(code = %code, retry = retry, "Terminating session");
        if by_user {
            if let Err(e) = self.send(ClientCommand::Bye { rsn: code }) {
                debug!(error = %e, "BYE not sent");
            }
        }
        self.set_state(if retry {
            SessionState::RetryingDisconnected
        } else {
            SessionState::Disconnected
        });

        self.generation += 1;
        self.stats_interval = None;
        self.speaker_interval = None;
        self.pending = None;
        self.signaling_rx = None;
        self.transport_rx = None;
        let conn = self.conn.take();
        if let Some(conn) = &conn {
            conn.token.cancel();
            if state == SessionState::Joined {
                self.submit_telemetry(conn, code);
            }
            conn.transport.close();
        }
        // dropping `conn` closes the signaling channel after the queued BYE
        drop(conn);

        self.local_media.detach().await;
        self.mic.stop();
        self.peers.destroy_all(code, &mut self.slots);
        self.slots.clear();
        self.detector.clear();
        self.keys.reset();
        self.ctx.reset();
        self.hub.fire("on_disconnect", |o| o.on_disconnect(code, retry));

        if retry {
            let delay = self.backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, attempt = self.backoff.attempts(), "Scheduling reconnect");
            let token = CancellationToken::new();
            self.reconnect_token = Some(token.clone());
            self.schedule(Timer::Reconnect, delay, token);
        } else {
            self.prev_cid = None;
            self.local_media.stop_local_tracks().await;
        }
    }

    fn submit_telemetry(&mut self, conn: &Connection, code: TermCode) {
        let ctx = ReportContext {
            user_id: self.user_id.clone(),
            cid: conn.cid.unwrap_or_default(),
            call_id: self.call_id.clone(),
            join_offset_ms: conn.join_offset_ms,
            max_peers: self.peers.max_count() as u32,
            mic_input_seen: self.mic.input_seen(),
            is_group: self.is_group,
            sfu_url: Some(self.url.clone()),
        };
        let report = self.recorder.build_report(&ctx, code, now());
        self.recorder.reset();
        let (Some(report), Some(sink)) = (report, self.telemetry.clone()) else {
            return;
        };
        debug!(generation = conn.generation, "Submitting call statistics");
        tokio::spawn(async move {
            if let Err(e) = sink.submit(&report).await {
                warn!(error = %e, "Failed to submit call statistics");
            }
        });
    }
}
