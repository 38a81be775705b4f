use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_sdp as gst_sdp;
use gstreamer_webrtc as gst_webrtc;
use tracing::{debug, error, info, warn};

use vantage_common::{Error, Result};
use vantage_signaling::{ClientId, SignalingEvent, SignalingServer};

use crate::dispatch::EventDispatcher;
use crate::pipeline::{DropCounters, StreamPipeline, WEBRTC_TEE_NAME};

const VIDEO_CAPS: &str = "application/x-rtp,media=video,encoding-name=H264,payload=96,\
                          clock-rate=90000,packetization-mode=(string)1,profile-level-id=(string)42e01f";

/// Per-client WebRTC session management.
///
/// Each connected headset gets a `webrtcbin` hanging off the shared tee plus
/// the server-created reliable ordered data channel named `"channel"`. All
/// handlers are per-peer: a failing client is dropped without touching the
/// others.
pub struct SessionRegistry {
    pipeline: gst::Pipeline,
    signaling: Arc<SignalingServer>,
    dispatcher: Arc<EventDispatcher>,
    counters: Arc<DropCounters>,
    // Keeps the channels (and their signal handlers) alive per client.
    channels: Mutex<HashMap<ClientId, gst_webrtc::WebRTCDataChannel>>,
}

impl SessionRegistry {
    pub fn new(
        pipeline: &StreamPipeline,
        signaling: Arc<SignalingServer>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            pipeline: pipeline.pipeline().clone(),
            signaling,
            dispatcher,
            counters: pipeline.counters(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Route one signaling event. Per-peer failures are logged and contained.
    pub fn handle_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::ClientConnected(id) => {
                if let Err(err) = self.client_connected(id) {
                    error!("{id}: session setup failed: {err}");
                    self.remove_peer(id);
                }
            }
            SignalingEvent::SdpAnswer { client, sdp } => {
                if let Err(err) = self.sdp_answer(client, &sdp) {
                    warn!("{client}: dropping peer, bad SDP answer: {err}");
                    self.remove_peer(client);
                }
            }
            SignalingEvent::IceCandidate {
                client,
                mline_index,
                candidate,
            } => self.ice_candidate(client, mline_index, &candidate),
            SignalingEvent::ClientDisconnected(id) => {
                info!("{id}: disconnected");
                self.remove_peer(id);
            }
        }
    }

    fn client_connected(&self, id: ClientId) -> Result<()> {
        info!("{id}: creating webrtc session");

        let webrtcbin = gst::ElementFactory::make("webrtcbin")
            .name(webrtcbin_name(id))
            .property_from_str("bundle-policy", "max-bundle")
            .build()
            .map_err(Error::pipeline)?;
        self.pipeline.add(&webrtcbin).map_err(Error::pipeline)?;

        webrtcbin
            .set_state(gst::State::Ready)
            .map_err(|err| Error::pipeline(format!("webrtcbin READY failed: {err}")))?;

        self.create_data_channel(id, &webrtcbin)?;

        webrtcbin
            .set_state(gst::State::Playing)
            .map_err(|err| Error::pipeline(format!("webrtcbin PLAYING failed: {err}")))?;

        let signaling = Arc::clone(&self.signaling);
        webrtcbin.connect("on-ice-candidate", false, move |values| {
            let (Ok(mline_index), Ok(candidate)) =
                (values[1].get::<u32>(), values[2].get::<String>())
            else {
                warn!("{id}: malformed on-ice-candidate signal");
                return None;
            };
            if let Err(err) = signaling.send_candidate(id, mline_index, candidate) {
                debug!("{id}: candidate not delivered: {err}");
            }
            None
        });

        let caps = gst::Caps::from_str(VIDEO_CAPS).map_err(Error::pipeline)?;
        let transceiver = webrtcbin.emit_by_name::<gst_webrtc::WebRTCRTPTransceiver>(
            "add-transceiver",
            &[&gst_webrtc::WebRTCRTPTransceiverDirection::Sendonly, &caps],
        );
        drop(transceiver);

        let signaling = Arc::clone(&self.signaling);
        let offer_bin = webrtcbin.clone();
        let promise = gst::Promise::with_change_func(move |reply| {
            let reply = match reply {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    warn!("{id}: offer creation produced no reply");
                    return;
                }
                Err(err) => {
                    warn!("{id}: offer creation failed: {err:?}");
                    return;
                }
            };
            let offer = match reply.get::<gst_webrtc::WebRTCSessionDescription>("offer") {
                Ok(offer) => offer,
                Err(err) => {
                    warn!("{id}: reply carried no offer: {err}");
                    return;
                }
            };
            offer_bin.emit_by_name::<()>("set-local-description", &[&offer, &None::<gst::Promise>]);

            match offer.sdp().as_text() {
                Ok(sdp) => {
                    if let Err(err) = signaling.send_sdp_offer(id, sdp) {
                        warn!("{id}: offer not delivered: {err}");
                        return;
                    }
                }
                Err(err) => {
                    warn!("{id}: SDP offer not serializable: {err}");
                    return;
                }
            }

            if let Err(err) = connect_bin_to_tee(&offer_bin) {
                error!("{id}: failed to link tee: {err}");
            }
        });
        webrtcbin.emit_by_name::<()>("create-offer", &[&None::<gst::Structure>, &promise]);

        Ok(())
    }

    fn create_data_channel(&self, id: ClientId, webrtcbin: &gst::Element) -> Result<()> {
        let options = Some(
            gst::Structure::builder("data-channel-options")
                .field("ordered", true)
                .build(),
        );
        let channel = webrtcbin
            .emit_by_name::<Option<gst_webrtc::WebRTCDataChannel>>(
                "create-data-channel",
                &[&"channel", &options],
            )
            .ok_or_else(|| Error::pipeline("could not create data channel"))?;

        channel.connect_on_open(move |channel| {
            info!("{id}: data channel open");
            channel.send_string(Some("vantage server ready"));
        });
        channel.connect_on_close(move |_| {
            info!("{id}: data channel closed");
        });
        channel.connect_on_error(move |_, err| {
            warn!("{id}: data channel error: {err}");
        });

        let dispatcher = Arc::clone(&self.dispatcher);
        let counters = Arc::clone(&self.counters);
        channel.connect_on_message_data(move |_, data| {
            let Some(data) = data else { return };
            match vantage_proto::decode_up_null_terminated(data.as_ref()) {
                Ok(msg) => dispatcher.dispatch(&msg),
                Err(err) => {
                    counters
                        .up_decode_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    warn!("{id}: undecodable up message: {err}");
                }
            }
        });
        channel.connect_on_message_string(move |_, text| {
            if let Some(text) = text {
                debug!("{id}: data channel text: {text}");
            }
        });

        self.channels
            .lock()
            .expect("channel registry poisoned")
            .insert(id, channel);
        Ok(())
    }

    fn sdp_answer(&self, id: ClientId, sdp: &str) -> Result<()> {
        let webrtcbin = self
            .webrtcbin_for(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_string()))?;

        let sdp_msg = gst_sdp::SDPMessage::parse_buffer(sdp.as_bytes())
            .map_err(|_| Error::signaling("unparseable SDP answer"))?;
        let answer =
            gst_webrtc::WebRTCSessionDescription::new(gst_webrtc::WebRTCSDPType::Answer, sdp_msg);

        let promise = gst::Promise::new();
        webrtcbin.emit_by_name::<()>("set-remote-description", &[&answer, &promise]);
        let _ = promise.wait();
        debug!("{id}: remote description installed");
        Ok(())
    }

    fn ice_candidate(&self, id: ClientId, mline_index: u32, candidate: &str) {
        if candidate.is_empty() {
            return;
        }
        let Some(webrtcbin) = self.webrtcbin_for(id) else {
            warn!("{id}: candidate for unknown peer");
            return;
        };
        webrtcbin.emit_by_name::<()>("add-ice-candidate", &[&mline_index, &candidate]);
        debug!("{id}: remote candidate added");
    }

    /// Unlink and dispose the peer without stalling the shared tee: block the
    /// feeding pad downstream, then take the bin out of the pipeline from
    /// inside the probe.
    fn remove_peer(&self, id: ClientId) {
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .remove(&id);

        let Some(webrtcbin) = self.webrtcbin_for(id) else {
            return;
        };
        let Some(sinkpad) = webrtcbin.static_pad("sink_0") else {
            // Never linked; remove directly.
            dispose_bin(&webrtcbin);
            return;
        };
        let Some(feeder) = sinkpad.peer() else {
            dispose_bin(&webrtcbin);
            return;
        };
        feeder.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, move |_pad, _info| {
            dispose_bin(&webrtcbin);
            gst::PadProbeReturn::Remove
        });
    }

    fn webrtcbin_for(&self, id: ClientId) -> Option<gst::Element> {
        self.pipeline.by_name(&webrtcbin_name(id))
    }
}

fn webrtcbin_name(id: ClientId) -> String {
    format!("webrtcbin_{id}")
}

fn dispose_bin(webrtcbin: &gst::Element) {
    if let Some(parent) = webrtcbin
        .parent()
        .and_then(|p| p.downcast::<gst::Pipeline>().ok())
    {
        let _ = parent.remove(webrtcbin);
    }
    let _ = webrtcbin.set_state(gst::State::Null);
}

fn connect_bin_to_tee(webrtcbin: &gst::Element) -> Result<()> {
    let pipeline = webrtcbin
        .parent()
        .and_then(|p| p.downcast::<gst::Pipeline>().ok())
        .ok_or_else(|| Error::pipeline("webrtcbin detached from pipeline"))?;
    let tee = pipeline
        .by_name(WEBRTC_TEE_NAME)
        .ok_or_else(|| Error::pipeline("tee missing"))?;
    let srcpad = tee
        .request_pad_simple("src_%u")
        .ok_or_else(|| Error::pipeline("tee src pad request failed"))?;
    let sinkpad = webrtcbin
        .request_pad_simple("sink_0")
        .ok_or_else(|| Error::pipeline("webrtcbin sink pad request failed"))?;
    srcpad
        .link(&sinkpad)
        .map_err(|err| Error::pipeline(format!("tee link failed: {err:?}")))?;
    Ok(())
}
