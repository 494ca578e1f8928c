//! Signaling channel
//!
//! A [`SignalingConnector`] opens a text message channel to the media
//! server. The production connector speaks WebSocket with the `svc`
//! sub-protocol; tests plug in an in-memory channel.
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
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use sfu_types::{render_for_log, ClientCommand};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

pub const SUB_PROTOCOL: &str = "svc";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something received on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Message(String),
    /// The channel is gone; carries a reason when one is known
    Closed(Option<String>),
}

/// An open channel. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct SignalingChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SignalingEvent>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &str) -> SfuResult<SignalingChannel>;
}

/// Serialize a command, logging it in compact form
pub fn encode_command(command: &ClientCommand) -> SfuResult<String> {
    let value = serde_json::to_value(command)?;
    debug!(action = command.action(), "send: {}", render_for_log(&value));
    Ok(value.to_string())
}

/// WebSocket connector
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut outgoing: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = outgoing.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                error!(error = %e, "Failed to send signaling message");
                break;
            }
        }
        if let Err(e) = write.close().await {
            debug!(error = %e, "Error closing signaling connection");
        }
        debug!("Signaling sender task terminated");
    }

    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        incoming: mpsc::UnboundedSender<SignalingEvent>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if incoming.send(SignalingEvent::Message(text)).is_err() {
                        // session went away
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Signaling connection closed by server");
                    break frame.map(|f| f.reason.to_string());
                }
                Some(Ok(Message::Binary(data))) => {
                    warn!(len = data.len(), "Ignoring binary signaling message");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Signaling connection error");
                    break Some(e.to_string());
                }
                None => break None,
            }
        };
        let _ = incoming.send(SignalingEvent::Closed(reason));
        debug!("Signaling receiver task terminated");
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &str) -> SfuResult<SignalingChannel> {
        info!(url = url, "Connecting to signaling server");
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUB_PROTOCOL));

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| SfuClientError::Signaling(format!("Failed to connect: {}", e)))?;
        debug!(status = %response.status(), "Signaling connection established");

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::sender_task(write, out_rx));
        tokio::spawn(Self::receiver_task(read, in_tx));

        Ok(SignalingChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
