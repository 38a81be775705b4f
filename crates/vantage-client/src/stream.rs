//! Receive/decode side: WebRTC video in, GL textures out.
//!
//! The depayloader's sink pad sees every RTP packet; marker packets carry the
//! per-frame metadata extension, which is held as "pending" until the decoder
//! finishes the access unit it closed. The appsink callback (the decode
//! thread) then uploads the frame under the EGL capability and publishes a
//! [`Sample`] through the single-slot queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use glow::HasContext;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_rtp as gst_rtp;
use tracing::{debug, info, warn};

use vantage_common::{Error, Result};
use vantage_proto::{decode_down, DownMessage, RTP_EXTENSION_ID};

use crate::clock::MonotonicStamp;
use crate::egl::EglContext;
use crate::sample::{Sample, SampleQueue};

pub struct StreamClient {
    pipeline: gst::Pipeline,
    webrtcbin: gst::Element,
    queue: Arc<SampleQueue>,
    shared: Arc<DecodeShared>,
}

struct DecodeShared {
    egl: Arc<EglContext>,
    /// Texture names owned by the decode side, ready for reuse.
    pool: Mutex<Vec<u32>>,
    /// Metadata from the most recent marker packet, awaiting its frame.
    pending_down: Mutex<Option<DownMessage>>,
    metadata_drops: AtomicU64,
}

impl DecodeShared {
    /// Upload one RGBA frame into a pooled texture. Decode-thread only.
    fn upload(&self, data: &[u8], width: i32, height: i32) -> Result<u32> {
        let guard = self.egl.acquire()?;
        let gl = guard.gl();
        let pooled = self.pool.lock().expect("texture pool poisoned").pop();
        let name = match pooled {
            Some(name) => name,
            None => {
                let texture = unsafe { gl.create_texture() }.map_err(Error::gl)?;
                unsafe {
                    gl.bind_texture(glow::TEXTURE_2D, Some(texture));
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_MIN_FILTER,
                        glow::LINEAR as i32,
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_MAG_FILTER,
                        glow::LINEAR as i32,
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_WRAP_S,
                        glow::CLAMP_TO_EDGE as i32,
                    );
                    gl.tex_parameter_i32(
                        glow::TEXTURE_2D,
                        glow::TEXTURE_WRAP_T,
                        glow::CLAMP_TO_EDGE as i32,
                    );
                }
                texture.0.get()
            }
        };
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, crate::render::native_texture(name));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                width,
                height,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                Some(data),
            );
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        Ok(name)
    }

    fn recycle(&self, texture: u32) {
        self.pool.lock().expect("texture pool poisoned").push(texture);
    }
}

impl StreamClient {
    pub fn new(egl: Arc<EglContext>) -> Result<Arc<Self>> {
        let pipeline = gst::Pipeline::new();

        let webrtcbin = gst::ElementFactory::make("webrtcbin")
            .name("webrtc")
            .property_from_str("bundle-policy", "max-bundle")
            .build()
            .map_err(Error::pipeline)?;

        let depay = make_element("rtph264depay")?;
        let parse = make_element("h264parse")?;
        let decode = make_element("avdec_h264")?;
        let convert = make_element("videoconvert")?;
        let capsfilter = make_element("capsfilter")?;
        capsfilter.set_property(
            "caps",
            gst::Caps::builder("video/x-raw")
                .field("format", "RGBA")
                .build(),
        );
        let appsink = gst_app::AppSink::builder().name("frames").build();
        // Latest-frame semantics: the slot queue does the same one level up.
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_property("sync", false);

        pipeline
            .add_many([
                &webrtcbin,
                &depay,
                &parse,
                &decode,
                &convert,
                &capsfilter,
                appsink.upcast_ref(),
            ])
            .map_err(Error::pipeline)?;
        gst::Element::link_many([
            &depay,
            &parse,
            &decode,
            &convert,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .map_err(Error::pipeline)?;

        let queue = Arc::new(SampleQueue::new());
        let shared = Arc::new(DecodeShared {
            egl,
            pool: Mutex::new(Vec::new()),
            pending_down: Mutex::new(None),
            metadata_drops: AtomicU64::new(0),
        });

        // Metadata probe: marker packets close an access unit and carry the
        // frame's down message in the two-byte-header extension.
        let probe_shared = Arc::clone(&shared);
        let depay_sink = depay
            .static_pad("sink")
            .ok_or_else(|| Error::pipeline("depayloader has no sink pad"))?;
        depay_sink
            .add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
                if let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data {
                    read_marker_extension(buffer, &probe_shared);
                }
                gst::PadProbeReturn::Ok
            })
            .ok_or_else(|| Error::pipeline("failed to install metadata probe"))?;

        // Incoming track: link the depayload chain when webrtcbin exposes it.
        let depay_for_link = depay.clone();
        webrtcbin.connect_pad_added(move |_, pad| {
            if pad.direction() != gst::PadDirection::Src {
                return;
            }
            let Some(sink) = depay_for_link.static_pad("sink") else {
                return;
            };
            if sink.is_linked() {
                return;
            }
            match pad.link(&sink) {
                Ok(_) => info!("video track linked to decoder"),
                Err(err) => warn!("failed to link incoming track: {err:?}"),
            }
        });

        let sink_shared = Arc::clone(&shared);
        let sink_queue = Arc::clone(&queue);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Err(err) = publish_decoded(&sample, &sink_shared, &sink_queue) {
                        warn!("decoded frame dropped: {err}");
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        Ok(Arc::new(Self {
            pipeline,
            webrtcbin,
            queue,
            shared,
        }))
    }

    /// The peer element the connection negotiates on.
    pub fn webrtcbin(&self) -> &gst::Element {
        &self.webrtcbin
    }

    pub fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map(|_| ())
            .map_err(|err| Error::pipeline(format!("stream pipeline PLAYING failed: {err}")))
    }

    /// Non-blocking pull of the freshest decoded sample. Render-thread only.
    pub fn try_pull_sample(&self) -> Option<Sample> {
        self.drain_returns();
        self.queue.try_pull()
    }

    /// Give a pulled sample back for texture reuse. Exactly once per pull.
    pub fn release_sample(&self, sample: Sample) {
        self.queue.hand_back(sample);
    }

    fn drain_returns(&self) {
        for sample in self.queue.take_returned() {
            self.shared.recycle(sample.texture);
        }
    }

    /// Stop decoding and free every texture owned by this side.
    pub fn stop(&self) {
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            warn!("stream pipeline NULL failed: {err}");
        }
        self.drain_returns();
        let mut names: Vec<u32> = std::mem::take(
            &mut *self.shared.pool.lock().expect("texture pool poisoned"),
        );
        if let Some(sample) = self.queue.try_pull() {
            names.push(sample.texture);
        }
        if names.is_empty() {
            return;
        }
        match self.shared.egl.acquire() {
            Ok(guard) => {
                let gl = guard.gl();
                for name in names {
                    if let Some(texture) = crate::render::native_texture(name) {
                        unsafe { gl.delete_texture(texture) };
                    }
                }
            }
            Err(err) => warn!("leaking {} textures, no EGL: {err}", names.len()),
        }
        debug!("stream client stopped");
    }
}

fn make_element(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|err| Error::pipeline(format!("{factory}: {err}")))
}

/// Pull the down message off a marker packet, keeping the previous metadata
/// when the extension is absent or undecodable.
fn read_marker_extension(buffer: &gst::Buffer, shared: &DecodeShared) {
    let Ok(rtp) = gst_rtp::RTPBuffer::from_buffer_readable(buffer) else {
        return;
    };
    if !rtp.is_marker() {
        return;
    }
    let Some((_appbits, data)) = rtp.extension_twobytes_header(RTP_EXTENSION_ID, 0) else {
        return;
    };
    match decode_down(data) {
        Ok(msg) => {
            *shared
                .pending_down
                .lock()
                .expect("pending metadata poisoned") = Some(msg);
        }
        Err(err) => {
            shared.metadata_drops.fetch_add(1, Ordering::Relaxed);
            warn!("undecodable frame metadata, keeping previous: {err}");
        }
    }
}

fn publish_decoded(
    sample: &gst::Sample,
    shared: &Arc<DecodeShared>,
    queue: &Arc<SampleQueue>,
) -> Result<()> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| Error::pipeline("sample without buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| Error::pipeline("sample without caps"))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| Error::pipeline("caps without structure"))?;
    let width = structure
        .get::<i32>("width")
        .map_err(|_| Error::pipeline("caps missing width"))?;
    let height = structure
        .get::<i32>("height")
        .map_err(|_| Error::pipeline("caps missing height"))?;

    let map = buffer
        .map_readable()
        .map_err(|_| Error::pipeline("buffer not readable"))?;

    let texture = shared.upload(map.as_slice(), width, height)?;
    let decode_complete_time = MonotonicStamp::now()?;
    let meta = shared
        .pending_down
        .lock()
        .expect("pending metadata poisoned")
        .unwrap_or_default();

    let displaced = queue.publish(bind_sample(texture, &meta, decode_complete_time));
    if let Some(old) = displaced {
        shared.recycle(old.texture);
    }
    for returned in queue.take_returned() {
        shared.recycle(returned.texture);
    }
    Ok(())
}

/// Bind the pending per-frame metadata to the frame that just finished
/// decoding.
fn bind_sample(texture: u32, meta: &DownMessage, decode_complete_time: MonotonicStamp) -> Sample {
    Sample {
        texture,
        texture_target: glow::TEXTURE_2D,
        view_poses: [
            meta.view_pose_left.unwrap_or(vantage_proto::PoseF::IDENTITY),
            meta.view_pose_right.unwrap_or(vantage_proto::PoseF::IDENTITY),
        ],
        env_blend_mode: meta.env_blend_mode,
        additive_black_threshold: meta.additive_black_threshold,
        frame_sequence_id: meta.frame_sequence_id,
        decode_complete_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vantage_proto::{blend_mode, PoseF};

    #[test]
    fn metadata_binds_to_the_sample() {
        let meta = DownMessage {
            frame_sequence_id: 12,
            view_pose_left: Some(PoseF::IDENTITY),
            view_pose_right: None,
            env_blend_mode: blend_mode::ADDITIVE,
            additive_black_threshold: 0.2,
        };
        let stamp = MonotonicStamp {
            tv_sec: 1,
            tv_nsec: 500,
        };
        let sample = bind_sample(7, &meta, stamp);
        assert_eq!(sample.texture, 7);
        assert_eq!(sample.frame_sequence_id, 12);
        assert_eq!(sample.env_blend_mode, blend_mode::ADDITIVE);
        assert_eq!(sample.view_poses[1], PoseF::IDENTITY);
        assert_eq!(sample.decode_complete_time, stamp);
    }

    #[test]
    fn missing_metadata_defaults_keep_decoding_alive() {
        let sample = bind_sample(
            3,
            &DownMessage::default(),
            MonotonicStamp {
                tv_sec: 0,
                tv_nsec: 0,
            },
        );
        assert_eq!(sample.frame_sequence_id, 0);
        assert_eq!(sample.env_blend_mode, blend_mode::UNSET);
    }
}
