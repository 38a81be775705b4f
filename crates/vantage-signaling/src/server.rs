use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use vantage_common::{Error, Result};

use crate::protocol::Envelope;

/// Opaque identifier for one connected headset, unique for the lifetime of
/// the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Events delivered to the session layer.
///
/// For a given id, `ClientConnected` precedes every other event and
/// `ClientDisconnected` is emitted exactly once, after which no further
/// events bearing that id are delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    ClientConnected(ClientId),
    SdpAnswer {
        client: ClientId,
        sdp: String,
    },
    IceCandidate {
        client: ClientId,
        mline_index: u32,
        candidate: String,
    },
    ClientDisconnected(ClientId),
}

type Registry = Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>;

/// Accepts headset websocket connections and bridges them to typed events.
///
/// Outbound sends are synchronous so the media threads (GStreamer callbacks)
/// can call them directly.
pub struct SignalingServer {
    clients: Registry,
    local_addr: SocketAddr,
}

impl SignalingServer {
    /// Bind the listener and start accepting clients. Returns the server
    /// handle and the event stream.
    pub async fn bind(
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("signaling listening on {local_addr}");

        let clients: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let accept_clients = Arc::clone(&clients);
        tokio::spawn(async move {
            let next_id = AtomicU64::new(1);
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("signaling accept failed: {err}");
                        continue;
                    }
                };
                let id = ClientId(next_id.fetch_add(1, Ordering::Relaxed));
                debug!("{id} connecting from {peer}");
                tokio::spawn(serve_client(
                    stream,
                    id,
                    Arc::clone(&accept_clients),
                    event_tx.clone(),
                ));
            }
        });

        Ok((
            Self {
                clients,
                local_addr,
            },
            event_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Forward a freshly created SDP offer to the client.
    pub fn send_sdp_offer(&self, client: ClientId, sdp: String) -> Result<()> {
        self.send(client, &Envelope::Offer { sdp })
    }

    /// Forward one of the server peer's ICE candidates to the client.
    pub fn send_candidate(
        &self,
        client: ClientId,
        mline_index: u32,
        candidate: String,
    ) -> Result<()> {
        self.send(
            client,
            &Envelope::Candidate {
                mline_index,
                candidate,
            },
        )
    }

    fn send(&self, client: ClientId, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope).map_err(Error::signaling)?;
        let clients = self.clients.lock().expect("signaling registry poisoned");
        let tx = clients
            .get(&client)
            .ok_or_else(|| Error::UnknownPeer(client.to_string()))?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| Error::UnknownPeer(client.to_string()))
    }
}

async fn serve_client(
    stream: TcpStream,
    id: ClientId,
    clients: Registry,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("{id} websocket handshake failed: {err}");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    clients
        .lock()
        .expect("signaling registry poisoned")
        .insert(id, tx);

    // The registry entry exists before the connected event so that a handler
    // reacting to it can immediately send the offer.
    if events.send(SignalingEvent::ClientConnected(id)).is_err() {
        clients.lock().expect("signaling registry poisoned").remove(&id);
        return;
    }
    info!("{id} connected");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("{id} sent invalid signaling JSON: {err}");
                continue;
            }
        };
        let event = match envelope {
            Envelope::Answer { sdp } => SignalingEvent::SdpAnswer { client: id, sdp },
            Envelope::Candidate {
                mline_index,
                candidate,
            } => SignalingEvent::IceCandidate {
                client: id,
                mline_index,
                candidate,
            },
            Envelope::Offer { .. } => {
                warn!("{id} sent an offer; the server is the offering side");
                continue;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }

    clients
        .lock()
        .expect("signaling registry poisoned")
        .remove(&id);
    let _ = events.send(SignalingEvent::ClientDisconnected(id));
    writer.abort();
    info!("{id} disconnected");
}
