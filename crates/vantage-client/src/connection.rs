//! Signaling + WebRTC peer for the headset.
//!
//! The server is the offering side: we apply its offer, reply with an
//! answer, exchange ICE, and adopt the server-created data channel named
//! `"channel"` as the telemetry uplink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_sdp as gst_sdp;
use gstreamer_webrtc as gst_webrtc;
use tracing::{debug, info, warn};

use vantage_common::{Error, Result};
use vantage_signaling::{ServerEvent, SignalingClient};

use crate::experience::UpLink;
use crate::stream::StreamClient;

pub struct Connection {
    webrtcbin: gst::Element,
    signaling: Mutex<Option<Arc<SignalingClient>>>,
    channel: Mutex<Option<gst_webrtc::WebRTCDataChannel>>,
    connected: AtomicBool,
}

impl Connection {
    /// Wire the peer and start the signaling thread. Returns immediately;
    /// `is_connected` flips once the data channel opens.
    pub fn start(uri: String, stream: &StreamClient) -> Result<Arc<Self>> {
        let conn = Arc::new(Self {
            webrtcbin: stream.webrtcbin().clone(),
            signaling: Mutex::new(None),
            channel: Mutex::new(None),
            connected: AtomicBool::new(false),
        });

        let candidate_conn = Arc::clone(&conn);
        conn.webrtcbin.connect("on-ice-candidate", false, move |values| {
            let (Ok(mline_index), Ok(candidate)) =
                (values[1].get::<u32>(), values[2].get::<String>())
            else {
                warn!("malformed on-ice-candidate signal");
                return None;
            };
            if let Some(signaling) = candidate_conn.signaling_handle() {
                if let Err(err) = signaling.send_candidate(mline_index, candidate) {
                    debug!("local candidate not delivered: {err}");
                }
            }
            None
        });

        let channel_conn = Arc::clone(&conn);
        conn.webrtcbin.connect("on-data-channel", false, move |values| {
            let Ok(channel) = values[1].get::<gst_webrtc::WebRTCDataChannel>() else {
                warn!("malformed on-data-channel signal");
                return None;
            };
            channel_conn.adopt_channel(channel);
            None
        });

        let thread_conn = Arc::clone(&conn);
        std::thread::Builder::new()
            .name("vantage-signaling".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!("signaling runtime failed: {err}");
                        return;
                    }
                };
                runtime.block_on(thread_conn.run_signaling(uri));
            })
            .map_err(|err| Error::signaling(format!("signaling thread: {err}")))?;

        Ok(conn)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Tear the link down: close signaling and forget the channel.
    pub fn disconnect(&self) {
        if let Some(signaling) = self.signaling.lock().expect("signaling slot poisoned").take() {
            signaling.close();
        }
        self.channel.lock().expect("channel slot poisoned").take();
        self.connected.store(false, Ordering::Relaxed);
        info!("connection closed");
    }

    fn signaling_handle(&self) -> Option<Arc<SignalingClient>> {
        self.signaling
            .lock()
            .expect("signaling slot poisoned")
            .clone()
    }

    fn adopt_channel(self: &Arc<Self>, channel: gst_webrtc::WebRTCDataChannel) {
        info!("data channel announced");
        let open_conn = Arc::clone(self);
        channel.connect_on_open(move |_| {
            info!("data channel open");
            open_conn.connected.store(true, Ordering::Relaxed);
        });
        let close_conn = Arc::clone(self);
        channel.connect_on_close(move |_| {
            info!("data channel closed");
            close_conn.connected.store(false, Ordering::Relaxed);
        });
        channel.connect_on_error(|_, err| warn!("data channel error: {err}"));
        channel.connect_on_message_string(|_, text| {
            if let Some(text) = text {
                debug!("data channel text: {text}");
            }
        });
        // Nothing flows downstream on the channel in practice; log and drop.
        channel.connect_on_message_data(|_, data| {
            if let Some(data) = data {
                debug!("ignoring {} bytes of downstream channel data", data.len());
            }
        });
        *self.channel.lock().expect("channel slot poisoned") = Some(channel);
    }

    async fn run_signaling(self: Arc<Self>, uri: String) {
        let (client, mut events) = match SignalingClient::connect(&uri).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!("signaling connect to {uri} failed: {err}");
                return;
            }
        };
        *self.signaling.lock().expect("signaling slot poisoned") = Some(Arc::new(client));

        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::SdpOffer { sdp } => self.apply_offer(&sdp),
                ServerEvent::IceCandidate {
                    mline_index,
                    candidate,
                } => {
                    if !candidate.is_empty() {
                        self.webrtcbin.emit_by_name::<()>(
                            "add-ice-candidate",
                            &[&mline_index, &candidate],
                        );
                    }
                }
                ServerEvent::Closed => {
                    info!("signaling closed by server");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Install the server's offer and answer it.
    fn apply_offer(&self, sdp: &str) {
        let sdp_msg = match gst_sdp::SDPMessage::parse_buffer(sdp.as_bytes()) {
            Ok(msg) => msg,
            Err(_) => {
                warn!("unparseable SDP offer, ignoring");
                return;
            }
        };
        let offer =
            gst_webrtc::WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Offer, sdp_msg);

        let answer_bin = self.webrtcbin.clone();
        let signaling = self.signaling_handle();
        let apply_promise = gst::Promise::with_change_func(move |_reply| {
            let send_bin = answer_bin.clone();
            let signaling = signaling.clone();
            let answer_promise = gst::Promise::with_change_func(move |reply| {
                let reply = match reply {
                    Ok(Some(reply)) => reply,
                    Ok(None) => {
                        warn!("answer creation produced no reply");
                        return;
                    }
                    Err(err) => {
                        warn!("answer creation failed: {err:?}");
                        return;
                    }
                };
                let answer = match reply.get::<gst_webrtc::WebRTCSessionDescription>("answer") {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!("reply carried no answer: {err}");
                        return;
                    }
                };
                send_bin
                    .emit_by_name::<()>("set-local-description", &[&answer, &None::<gst::Promise>]);
                let text = match answer.sdp().as_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("SDP answer not serializable: {err}");
                        return;
                    }
                };
                match signaling {
                    Some(signaling) => {
                        if let Err(err) = signaling.send_answer(text) {
                            warn!("answer not delivered: {err}");
                        }
                    }
                    None => warn!("no signaling to deliver the answer"),
                }
            });
            answer_bin
                .emit_by_name::<()>("create-answer", &[&None::<gst::Structure>, &answer_promise]);
        });
        self.webrtcbin
            .emit_by_name::<()>("set-remote-description", &[&offer, &apply_promise]);
    }
}

impl UpLink for Connection {
    /// Queue telemetry on the reliable ordered channel. Failure is reported,
    /// never fatal: the caller logs and carries on.
    fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let guard = self.channel.lock().expect("channel slot poisoned");
        let Some(channel) = guard.as_ref() else {
            return Err(Error::signaling("data channel not open yet"));
        };
        channel.send_data(Some(&glib::Bytes::from(bytes)));
        Ok(())
    }
}
