use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};

use vantage_common::{Error, Result};

use crate::protocol::Envelope;

/// Signaling traffic as seen from the headset.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SdpOffer { sdp: String },
    IceCandidate { mline_index: u32, candidate: String },
    /// The websocket closed; no further events follow.
    Closed,
}

/// Headset-side signaling connection.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<Message>,
}

impl SignalingClient {
    /// Connect to the signaling server and start the reader/writer tasks.
    pub async fn connect(uri: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
        let (ws, _) = connect_async(uri).await.map_err(Error::signaling)?;
        info!("signaling connected to {uri}");
        let (mut sink, mut source) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("invalid signaling JSON from server: {err}");
                        continue;
                    }
                };
                let event = match envelope {
                    Envelope::Offer { sdp } => ServerEvent::SdpOffer { sdp },
                    Envelope::Candidate {
                        mline_index,
                        candidate,
                    } => ServerEvent::IceCandidate {
                        mline_index,
                        candidate,
                    },
                    Envelope::Answer { .. } => {
                        warn!("server sent an answer; the client is the answering side");
                        continue;
                    }
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(ServerEvent::Closed);
        });

        Ok((Self { outbound }, event_rx))
    }

    /// Send the local SDP answer back to the server.
    pub fn send_answer(&self, sdp: String) -> Result<()> {
        self.send(&Envelope::Answer { sdp })
    }

    /// Send one of the local peer's ICE candidates to the server.
    pub fn send_candidate(&self, mline_index: u32, candidate: String) -> Result<()> {
        self.send(&Envelope::Candidate {
            mline_index,
            candidate,
        })
    }

    /// Close the websocket. Further sends fail; the server sees a clean
    /// disconnect.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn send(&self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope).map_err(Error::signaling)?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| Error::signaling("signaling connection closed"))
    }
}
