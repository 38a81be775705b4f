use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_rtp as gst_rtp;
use tracing::{debug, error, info, trace, warn};

use vantage_common::{Error, Result};
use vantage_proto::{encode_down, DownMessage, RTP_EXTENSION_ID, RTP_TWO_BYTE_EXT_MAX};

pub const WEBRTC_TEE_NAME: &str = "webrtctee";
pub const RTP_PAYLOADER_NAME: &str = "rtppay";

/// Configuration for the shared encode pipeline.
#[derive(Debug, Clone)]
pub struct PipelineArgs {
    pub appsrc_name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// When set, a tee records the encoded stream into a Matroska file.
    pub record_path: Option<PathBuf>,
}

impl Default for PipelineArgs {
    fn default() -> Self {
        Self {
            appsrc_name: "scene".to_string(),
            width: 1920,
            height: 1080,
            fps: 60,
            record_path: None,
        }
    }
}

/// Counters for recovered error paths; each logs on first occurrence only.
#[derive(Default)]
pub struct DropCounters {
    pub down_encode_failures: AtomicU64,
    pub oversize_extensions: AtomicU64,
    pub up_decode_failures: AtomicU64,
    oversize_logged: AtomicBool,
    encode_logged: AtomicBool,
}

/// The shared encode/payload pipeline.
///
/// One instance feeds every connected client through the `webrtctee`
/// element; per-client `webrtcbin`s are attached by the session registry.
pub struct StreamPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    down_msg: Arc<Mutex<Option<Bytes>>>,
    counters: Arc<DropCounters>,
    _bus_watch: gst::bus::BusWatchGuard,
}

impl StreamPipeline {
    pub fn create(args: &PipelineArgs) -> Result<Self> {
        let record_tee = match &args.record_path {
            Some(path) => format!(
                "tee name=savetee \
                 savetee. ! queue ! matroskamux ! filesink location={} \
                 savetee. ! ",
                path.display()
            ),
            None => String::new(),
        };

        let launch = format!(
            "appsrc name={name} is-live=true format=time do-timestamp=true \
               caps=video/x-raw,format=RGBA,width={w},height={h},framerate={fps}/1 ! \
             queue ! \
             videoconvert ! \
             video/x-raw,format=NV12 ! \
             queue ! \
             x264enc tune=zerolatency sliced-threads=true speed-preset=superfast bframes=2 bitrate=4096 ! \
             video/x-h264,profile=main ! \
             {record_tee}\
             queue ! \
             h264parse ! \
             rtph264pay name={rtppay} config-interval=1 ! \
             application/x-rtp,payload=96 ! \
             tee name={tee} allow-not-linked=true",
            name = args.appsrc_name,
            w = args.width,
            h = args.height,
            fps = args.fps,
            rtppay = RTP_PAYLOADER_NAME,
            tee = WEBRTC_TEE_NAME,
        );
        debug!("pipeline: {launch}");

        let pipeline = gst::parse::launch(&launch)
            .map_err(Error::pipeline)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::pipeline("top-level element is not a pipeline"))?;

        let appsrc = pipeline
            .by_name(&args.appsrc_name)
            .ok_or_else(|| Error::pipeline("appsrc missing"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| Error::pipeline("appsrc type mismatch"))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| Error::pipeline("pipeline has no bus"))?;
        let bus_watch = bus
            .add_watch(|_, message| {
                match message.view() {
                    gst::MessageView::Error(err) => {
                        error!(
                            "pipeline error from {:?}: {} ({:?})",
                            err.src().map(|s| s.path_string()),
                            err.error(),
                            err.debug()
                        );
                    }
                    gst::MessageView::Warning(w) => {
                        warn!(
                            "pipeline warning from {:?}: {} ({:?})",
                            w.src().map(|s| s.path_string()),
                            w.error(),
                            w.debug()
                        );
                    }
                    gst::MessageView::Eos(..) => {
                        info!("pipeline reached EOS");
                    }
                    _ => {}
                }
                glib::ControlFlow::Continue
            })
            .map_err(Error::pipeline)?;

        let this = Self {
            pipeline,
            appsrc,
            down_msg: Arc::new(Mutex::new(None)),
            counters: Arc::new(DropCounters::default()),
            _bus_watch: bus_watch,
        };
        this.install_payloader_probe()?;
        Ok(this)
    }

    /// Install the tagging probe on the payloader src pad. Runs once per
    /// pipeline: the pad is shared, upstream of the tee.
    fn install_payloader_probe(&self) -> Result<()> {
        let rtppay = self
            .pipeline
            .by_name(RTP_PAYLOADER_NAME)
            .ok_or_else(|| Error::pipeline("rtppay element missing"))?;
        let pad = rtppay
            .static_pad("src")
            .ok_or_else(|| Error::pipeline("rtppay has no src pad"))?;

        let down_msg = Arc::clone(&self.down_msg);
        let counters = Arc::clone(&self.counters);
        pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
            let bytes = down_msg.lock().expect("down message lock poisoned").clone();
            let Some(bytes) = bytes else {
                return gst::PadProbeReturn::Ok;
            };
            if let Some(gst::PadProbeData::Buffer(ref mut buffer)) = info.data {
                tag_marker_packet(buffer.make_mut(), &bytes, &counters);
            }
            gst::PadProbeReturn::Ok
        })
        .ok_or_else(|| Error::pipeline("failed to install payloader probe"))?;
        Ok(())
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    pub fn counters(&self) -> Arc<DropCounters> {
        Arc::clone(&self.counters)
    }

    /// Replace the per-frame metadata attached to subsequent access units.
    ///
    /// Called by the scene producer; the probe reads the freshest handle on
    /// every marker packet. Oversize messages are dropped here, before they
    /// ever reach the wire.
    pub fn set_down_msg(&self, msg: &DownMessage) {
        match encode_down(msg) {
            Ok(bytes) => {
                trace!(
                    "down message for frame {} ({} bytes)",
                    msg.frame_sequence_id,
                    bytes.len()
                );
                *self.down_msg.lock().expect("down message lock poisoned") = Some(bytes);
            }
            Err(err) => {
                self.counters
                    .down_encode_failures
                    .fetch_add(1, Ordering::Relaxed);
                if !self.counters.encode_logged.swap(true, Ordering::Relaxed) {
                    error!("dropping down message: {err}");
                }
            }
        }
    }

    /// Push one RGBA frame from the scene producer.
    pub fn push_frame(&self, data: &[u8]) -> Result<()> {
        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|err| Error::pipeline(format!("appsrc push failed: {err:?}")))
    }

    pub fn play(&self) -> Result<()> {
        info!("starting pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map(|_| ())
            .map_err(|err| Error::pipeline(format!("failed to reach PLAYING: {err}")))
    }

    /// Shutdown: settle with EOS, wait bounded on the bus, then drop to
    /// NULL. Safe to call more than once.
    pub fn stop(&self) {
        info!("stopping pipeline");
        self.pipeline.send_event(gst::event::Eos::new());
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                3 * gst::ClockTime::SECOND,
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            warn!("failed to reach NULL on shutdown: {err}");
        }
    }

    pub fn stop_if_playing(&self) {
        let (res, state, _pending) = self.pipeline.state(Some(3 * gst::ClockTime::SECOND));
        if res.is_err() {
            warn!("unable to query pipeline state");
            return;
        }
        if state == gst::State::Playing {
            self.stop();
        }
    }
}

/// Attach the serialized down message to `buffer` when it closes an access
/// unit (marker bit set). Failures never stall the media path: the buffer
/// always flows on, untagged.
pub fn tag_marker_packet(buffer: &mut gst::BufferRef, payload: &[u8], counters: &DropCounters) {
    let mut rtp = match gst_rtp::RTPBuffer::from_buffer_writable(buffer) {
        Ok(rtp) => rtp,
        Err(err) => {
            warn!("failed to map RTP buffer: {err}");
            return;
        }
    };

    // Only the last packet of the access unit carries the metadata.
    if !rtp.is_marker() {
        return;
    }

    if payload.len() > RTP_TWO_BYTE_EXT_MAX {
        counters.oversize_extensions.fetch_add(1, Ordering::Relaxed);
        if !counters.oversize_logged.swap(true, Ordering::Relaxed) {
            error!(
                "down message too large for one RTP extension element ({} > {} bytes)",
                payload.len(),
                RTP_TWO_BYTE_EXT_MAX
            );
        }
        return;
    }

    if let Err(err) = rtp.add_extension_twobytes_header(0, RTP_EXTENSION_ID, payload) {
        error!("failed to add RTP extension: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_proto::{blend_mode, decode_down, PoseF};

    fn init() {
        gst::init().unwrap();
    }

    /// Minimal RTP packet: fixed 12-byte header, no extension, no CSRC.
    fn rtp_packet(marker: bool, payload: &[u8]) -> gst::Buffer {
        let mut data = Vec::with_capacity(12 + payload.len());
        data.push(0x80); // V=2
        data.push(if marker { 0x80 | 96 } else { 96 });
        data.extend_from_slice(&1234u16.to_be_bytes()); // seq
        data.extend_from_slice(&900_000u32.to_be_bytes()); // timestamp
        data.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes()); // ssrc
        data.extend_from_slice(payload);
        gst::Buffer::from_mut_slice(data)
    }

    fn sample_down() -> DownMessage {
        DownMessage {
            frame_sequence_id: 99,
            view_pose_left: Some(PoseF::IDENTITY),
            view_pose_right: Some(PoseF::IDENTITY),
            env_blend_mode: blend_mode::ADDITIVE,
            additive_black_threshold: 0.1,
        }
    }

    #[test]
    fn marker_packet_carries_exactly_one_decodable_extension() {
        init();
        let msg = sample_down();
        let payload = encode_down(&msg).unwrap();
        let counters = DropCounters::default();

        let mut buffer = rtp_packet(true, &[0xAB; 32]);
        tag_marker_packet(buffer.make_mut(), &payload, &counters);

        let rtp = gst_rtp::RTPBuffer::from_buffer_readable(&buffer).unwrap();
        let (appbits, data) = rtp
            .extension_twobytes_header(RTP_EXTENSION_ID, 0)
            .expect("marker packet must carry the extension");
        assert_eq!(appbits, 0);
        assert_eq!(decode_down(data).unwrap(), msg);
        assert!(rtp.extension_twobytes_header(RTP_EXTENSION_ID, 1).is_none());
    }

    #[test]
    fn non_marker_packet_is_left_untouched() {
        init();
        let payload = encode_down(&sample_down()).unwrap();
        let counters = DropCounters::default();

        let mut buffer = rtp_packet(false, &[0xAB; 32]);
        let before = buffer.size();
        tag_marker_packet(buffer.make_mut(), &payload, &counters);
        assert_eq!(buffer.size(), before);

        let rtp = gst_rtp::RTPBuffer::from_buffer_readable(&buffer).unwrap();
        assert!(rtp.extension_twobytes_header(RTP_EXTENSION_ID, 0).is_none());
    }

    #[test]
    fn oversize_payload_passes_packet_through_unchanged() {
        init();
        let oversize = vec![0x55u8; RTP_TWO_BYTE_EXT_MAX + 1];
        let counters = DropCounters::default();

        let mut buffer = rtp_packet(true, &[0xAB; 32]);
        let before = buffer.size();
        tag_marker_packet(buffer.make_mut(), &oversize, &counters);

        assert_eq!(buffer.size(), before);
        assert_eq!(counters.oversize_extensions.load(Ordering::Relaxed), 1);
        let rtp = gst_rtp::RTPBuffer::from_buffer_readable(&buffer).unwrap();
        assert!(rtp.extension_twobytes_header(RTP_EXTENSION_ID, 0).is_none());
    }

    #[test]
    fn max_size_payload_still_fits() {
        init();
        let max = vec![0x44u8; RTP_TWO_BYTE_EXT_MAX];
        let counters = DropCounters::default();

        let mut buffer = rtp_packet(true, &[0xAB; 32]);
        tag_marker_packet(buffer.make_mut(), &max, &counters);

        let rtp = gst_rtp::RTPBuffer::from_buffer_readable(&buffer).unwrap();
        let (_, data) = rtp.extension_twobytes_header(RTP_EXTENSION_ID, 0).unwrap();
        assert_eq!(data, max.as_slice());
    }
}
