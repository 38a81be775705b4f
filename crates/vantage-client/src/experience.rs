//! The client frame pipeline: wait → begin → locate → pull → render → end →
//! report.
//!
//! One instance owns the XR session objects, the swapchain, and the
//! previously pulled sample; it runs on the XR render thread. Generic over
//! the GL-flavored OpenXR graphics APIs (GLES on device).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glow::HasContext;
use openxr as xr;
use tracing::{error, info, warn};

use vantage_common::{Error, Result};
use vantage_proto::{
    blend_mode, encode_up, PoseF, Quatf, TrackingMessage, UpFrameMessage, UpMessage, Vec3f,
};

use crate::clock::{MonotonicStamp, TimeConverter};
use crate::egl::EglContext;
use crate::passthrough::Passthrough;
use crate::render::{native_texture, DrawInfo, Renderer};
use crate::sample::Sample;
use crate::stream::StreamClient;

const VIEW_COUNT: usize = 2;
const SWAPCHAIN_WAIT_WARN: Duration = Duration::from_millis(2);

/// Destination for encoded up messages (the data channel in production).
pub trait UpLink: Send + Sync {
    fn send_bytes(&self, bytes: &[u8]) -> Result<()>;
}

/// Outcome of one frame-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRenderResult {
    NewSample,
    ReusedSample,
    NoSampleAvailable,
    ShouldNotRender,
    /// wait-frame failed; the caller may retry next iteration.
    ErrorWaitFrame,
    /// The GL context could not be made current; retry next iteration.
    ErrorEgl,
}

impl PollRenderResult {
    /// Whether this iteration contributes a projection layer.
    pub fn submits_projection(self) -> bool {
        matches!(self, Self::NewSample | Self::ReusedSample)
    }
}

/// Serialize-and-send side of the telemetry stream with the shared message
/// counter. Ids are strictly increasing and start at 1.
pub struct Telemetry {
    uplink: Arc<dyn UpLink>,
    next_up_message: AtomicI64,
}

impl Telemetry {
    pub fn new(uplink: Arc<dyn UpLink>) -> Self {
        Self {
            uplink,
            next_up_message: AtomicI64::new(1),
        }
    }

    /// Stamp the next id and send. Send failures are reported, never fatal.
    pub fn emit(&self, mut msg: UpMessage) -> bool {
        let id = self.next_up_message.fetch_add(1, Ordering::Relaxed);
        msg.up_message_id = id;
        let bytes = encode_up(&msg);
        match self.uplink.send_bytes(&bytes) {
            Ok(()) => true,
            Err(err) => {
                warn!("up message #{id} not sent: {err}");
                false
            }
        }
    }

    pub fn emit_tracking(&self, view_pose_in_world: PoseF) -> bool {
        self.emit(UpMessage {
            up_message_id: 0,
            tracking: Some(TrackingMessage {
                view_pose_in_world: Some(view_pose_in_world),
            }),
            frame: None,
        })
    }

    pub fn emit_frame(&self, frame: UpFrameMessage) -> bool {
        self.emit(UpMessage {
            up_message_id: 0,
            tracking: None,
            frame: Some(frame),
        })
    }
}

pub struct ExperienceConfig {
    pub eye_extents: (u32, u32),
    /// Threshold used until a down message supplies one.
    pub default_black_threshold: f32,
}

struct RenderedFrame {
    poses: [xr::Posef; VIEW_COUNT],
    frame_sequence_id: i64,
    decode_complete_time: MonotonicStamp,
}

pub struct RemoteExperience<G: xr::Graphics<Format = u32, SwapchainImage = u32>> {
    instance: xr::Instance,
    session: xr::Session<G>,
    frame_waiter: xr::FrameWaiter,
    frame_stream: xr::FrameStream<G>,
    world_space: xr::Space,
    view_space: xr::Space,
    swapchain: xr::Swapchain<G>,
    framebuffers: Vec<glow::NativeFramebuffer>,
    renderer: Renderer,
    egl: Arc<EglContext>,
    stream: Arc<StreamClient>,
    telemetry: Telemetry,
    passthrough: Passthrough,
    converter: TimeConverter,
    eye_width: u32,
    eye_height: u32,
    default_black_threshold: f32,
    prev_sample: Option<Sample>,
    last_display_period: Option<i64>,
}

impl<G: xr::Graphics<Format = u32, SwapchainImage = u32>> RemoteExperience<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: xr::Instance,
        system: xr::SystemId,
        session: xr::Session<G>,
        frame_waiter: xr::FrameWaiter,
        frame_stream: xr::FrameStream<G>,
        egl: Arc<EglContext>,
        stream: Arc<StreamClient>,
        uplink: Arc<dyn UpLink>,
        config: ExperienceConfig,
    ) -> Result<Self> {
        let converter = TimeConverter::new(&instance)?;

        let modes = instance
            .enumerate_environment_blend_modes(system, xr::ViewConfigurationType::PRIMARY_STEREO)
            .map_err(|err| Error::xr(format!("blend mode enumeration: {err:?}")))?;
        let mut passthrough = Passthrough::new(modes);
        // Start see-through when the runtime allows it.
        passthrough.set_blend_mode(xr::EnvironmentBlendMode::ADDITIVE);

        let (eye_width, eye_height) = config.eye_extents;

        // Some runtimes require the GL context to be current around swapchain
        // creation; keep it held for framebuffer setup too.
        let (swapchain, framebuffers, renderer) = {
            let guard = egl.acquire()?;
            let gl = guard.gl();

            info!("creating {}x{} swapchain", eye_width * 2, eye_height);
            let swapchain = session
                .create_swapchain(&xr::SwapchainCreateInfo {
                    create_flags: xr::SwapchainCreateFlags::EMPTY,
                    usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
                    format: glow::SRGB8_ALPHA8,
                    sample_count: 1,
                    width: eye_width * 2,
                    height: eye_height,
                    face_count: 1,
                    array_size: 1,
                    mip_count: 1,
                })
                .map_err(|err| Error::xr(format!("swapchain creation: {err:?}")))?;

            let images = swapchain
                .enumerate_images()
                .map_err(|err| Error::xr(format!("swapchain images: {err:?}")))?;
            let mut framebuffers = Vec::with_capacity(images.len());
            for image in images {
                framebuffers.push(framebuffer_for_image(gl, image)?);
            }
            let renderer = Renderer::new(gl)?;
            (swapchain, framebuffers, renderer)
        };

        let world_space = session
            .create_reference_space(xr::ReferenceSpaceType::STAGE, xr::Posef::IDENTITY)
            .map_err(|err| Error::xr(format!("stage space: {err:?}")))?;
        let view_space = session
            .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY)
            .map_err(|err| Error::xr(format!("view space: {err:?}")))?;

        Ok(Self {
            instance,
            session,
            frame_waiter,
            frame_stream,
            world_space,
            view_space,
            swapchain,
            framebuffers,
            renderer,
            egl,
            stream,
            telemetry: Telemetry::new(uplink),
            passthrough,
            converter,
            eye_width,
            eye_height,
            default_black_threshold: config.default_black_threshold,
            prev_sample: None,
            last_display_period: None,
        })
    }

    /// One iteration of the frame loop. Every begun frame is ended, with an
    /// empty layer list on the paths that skip rendering.
    pub fn poll_and_render_frame(&mut self) -> PollRenderResult {
        let frame_state = match self.frame_waiter.wait() {
            Ok(state) => state,
            Err(err) => {
                error!("wait_frame failed: {err:?}");
                return PollRenderResult::ErrorWaitFrame;
            }
        };
        if let Err(err) = self.frame_stream.begin() {
            // A runtime that cannot begin a waited frame is not coming back.
            error!("begin_frame failed: {err:?}");
            std::process::abort();
        }
        let display_time = frame_state.predicted_display_time;
        self.observe_display_period(frame_state.predicted_display_period);

        let begin_time = match MonotonicStamp::now() {
            Ok(stamp) => stamp,
            Err(err) => {
                warn!("monotonic clock read failed: {err}");
                return self.finish_frame(display_time, None, None, PollRenderResult::ShouldNotRender);
            }
        };

        let views = match self.session.locate_views(
            xr::ViewConfigurationType::PRIMARY_STEREO,
            display_time,
            &self.world_space,
        ) {
            Ok((_flags, views)) if views.len() >= VIEW_COUNT => views,
            Ok(_) => {
                warn!("runtime located fewer than {VIEW_COUNT} views");
                return self.finish_frame(display_time, None, None, PollRenderResult::ShouldNotRender);
            }
            Err(err) => {
                warn!("locate_views failed: {err:?}");
                return self.finish_frame(display_time, None, None, PollRenderResult::ShouldNotRender);
            }
        };

        let egl = Arc::clone(&self.egl);
        let guard = match egl.acquire() {
            Ok(guard) => guard,
            Err(err) => {
                warn!("EGL context not current: {err}");
                return self.finish_frame(display_time, None, None, PollRenderResult::ErrorEgl);
            }
        };

        let (result, rendered) = if frame_state.should_render {
            self.render_sample(guard.gl())
        } else {
            (PollRenderResult::ShouldNotRender, None)
        };

        let outcome = self.finish_frame(display_time, Some((views, begin_time)), rendered, result);
        drop(guard);
        outcome
    }

    /// Pull or reuse a sample and draw it into the acquired swapchain image.
    fn render_sample(
        &mut self,
        gl: &glow::Context,
    ) -> (PollRenderResult, Option<RenderedFrame>) {
        let result = match self.stream.try_pull_sample() {
            Some(new_sample) => {
                if new_sample.env_blend_mode != blend_mode::UNSET {
                    self.passthrough.set_blend_mode_tag(new_sample.env_blend_mode);
                }
                if let Some(prev) = self.prev_sample.replace(new_sample) {
                    self.stream.release_sample(prev);
                }
                PollRenderResult::NewSample
            }
            None if self.prev_sample.is_some() => PollRenderResult::ReusedSample,
            None => return (PollRenderResult::NoSampleAvailable, None),
        };
        let Some(sample) = self.prev_sample else {
            return (PollRenderResult::NoSampleAvailable, None);
        };

        let comp = self.passthrough.composition();
        let threshold = if sample.env_blend_mode != blend_mode::UNSET {
            sample.additive_black_threshold
        } else {
            self.default_black_threshold
        };

        let image_index = match self.swapchain.acquire_image() {
            Ok(index) => index as usize,
            Err(err) => {
                error!("acquire_image failed: {err:?}");
                std::process::abort();
            }
        };
        let wait_start = Instant::now();
        if let Err(err) = self.swapchain.wait_image(xr::Duration::INFINITE) {
            error!("wait_image failed: {err:?}");
            std::process::abort();
        }
        let waited = wait_start.elapsed();
        if waited > SWAPCHAIN_WAIT_WARN {
            warn!("wait_image took {waited:?}");
        }

        let Some(&framebuffer) = self.framebuffers.get(image_index) else {
            error!("swapchain produced unknown image index {image_index}");
            let _ = self.swapchain.release_image();
            return (PollRenderResult::ShouldNotRender, None);
        };

        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.viewport(0, 0, (self.eye_width * 2) as i32, self.eye_height as i32);
            let [r, g, b, a] = comp.clear_color;
            gl.clear_color(r, g, b, a);
            gl.clear(glow::COLOR_BUFFER_BIT);
        }
        self.renderer.draw(
            gl,
            &DrawInfo {
                texture: sample.texture,
                texture_target: sample.texture_target,
                alpha_for_additive: comp.alpha_for_additive,
                black_threshold: threshold,
            },
        );
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        if let Err(err) = self.swapchain.release_image() {
            error!("release_image failed: {err:?}");
        }

        let rendered = RenderedFrame {
            poses: [
                pose_to_xr(&sample.view_poses[0]),
                pose_to_xr(&sample.view_poses[1]),
            ],
            frame_sequence_id: sample.frame_sequence_id,
            decode_complete_time: sample.decode_complete_time,
        };
        (result, Some(rendered))
    }

    /// Submit the layer list, then report pose and (when a sample was
    /// rendered) frame timing.
    fn finish_frame(
        &mut self,
        display_time: xr::Time,
        located: Option<(Vec<xr::View>, MonotonicStamp)>,
        rendered: Option<RenderedFrame>,
        result: PollRenderResult,
    ) -> PollRenderResult {
        let comp = self.passthrough.composition();

        let ended = match (&located, &rendered) {
            (Some((views, _)), Some(frame)) => {
                let extent = xr::Extent2Di {
                    width: self.eye_width as i32,
                    height: self.eye_height as i32,
                };
                let left_rect = xr::Rect2Di {
                    offset: xr::Offset2Di { x: 0, y: 0 },
                    extent,
                };
                let right_rect = xr::Rect2Di {
                    offset: xr::Offset2Di {
                        x: self.eye_width as i32,
                        y: 0,
                    },
                    extent,
                };
                let projection_views = [
                    xr::CompositionLayerProjectionView::new()
                        .pose(frame.poses[0])
                        .fov(views[0].fov)
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(&self.swapchain)
                                .image_rect(left_rect)
                                .image_array_index(0),
                        ),
                    xr::CompositionLayerProjectionView::new()
                        .pose(frame.poses[1])
                        .fov(views[1].fov)
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(&self.swapchain)
                                .image_rect(right_rect)
                                .image_array_index(0),
                        ),
                ];
                let projection = xr::CompositionLayerProjection::new()
                    .space(&self.world_space)
                    .layer_flags(comp.projection_flags)
                    .views(&projection_views);
                let layers: [&xr::CompositionLayerBase<G>; 1] = [&projection];
                self.frame_stream
                    .end(display_time, comp.env_blend_mode, &layers)
            }
            _ => self
                .frame_stream
                .end(display_time, comp.env_blend_mode, &[]),
        };
        if let Err(err) = ended {
            warn!("end_frame failed: {err:?}");
        }

        self.report_tracking(display_time);
        if let (Some((_, begin_time)), Some(frame)) = (located, rendered) {
            self.report_frame_timing(begin_time, &frame, display_time);
        }
        result
    }

    fn report_tracking(&self, display_time: xr::Time) {
        let location = match self.view_space.locate(&self.world_space, display_time) {
            Ok(location) => location,
            Err(err) => {
                warn!("view-in-world locate failed: {err:?}");
                return;
            }
        };
        self.telemetry.emit_tracking(xr_to_pose(&location.pose));
    }

    fn report_frame_timing(
        &self,
        begin_time: MonotonicStamp,
        frame: &RenderedFrame,
        display_time: xr::Time,
    ) {
        let decode_complete = match self
            .converter
            .to_xr_time(&self.instance, frame.decode_complete_time)
        {
            Ok(time) => time,
            Err(err) => {
                warn!("decode-complete time conversion failed: {err}");
                return;
            }
        };
        let begin_frame = match self.converter.to_xr_time(&self.instance, begin_time) {
            Ok(time) => time,
            Err(err) => {
                warn!("begin-frame time conversion failed: {err}");
                return;
            }
        };
        self.telemetry.emit_frame(UpFrameMessage {
            frame_sequence_id: frame.frame_sequence_id,
            decode_complete_time: decode_complete.as_nanos(),
            begin_frame_time: begin_frame.as_nanos(),
            display_time: display_time.as_nanos(),
        });
    }

    fn observe_display_period(&mut self, period: xr::Duration) {
        let ns = period.as_nanos();
        if ns <= 0 || self.last_display_period == Some(ns) {
            return;
        }
        info!("display refresh {:.1} Hz", 1_000_000_000.0 / ns as f64);
        self.last_display_period = Some(ns);
    }

    /// Release the held sample and GPU objects. XR handles are released by
    /// drop, newest first.
    pub fn shutdown(&mut self) {
        if let Some(prev) = self.prev_sample.take() {
            self.stream.release_sample(prev);
        }
        match self.egl.acquire() {
            Ok(guard) => {
                let gl = guard.gl();
                self.renderer.destroy(gl);
                for framebuffer in self.framebuffers.drain(..) {
                    unsafe { gl.delete_framebuffer(framebuffer) };
                }
            }
            Err(err) => warn!("teardown without GL context, leaking framebuffers: {err}"),
        }
        info!("remote experience shut down");
    }
}

fn framebuffer_for_image(gl: &glow::Context, image: u32) -> Result<glow::NativeFramebuffer> {
    unsafe {
        let framebuffer = gl.create_framebuffer().map_err(Error::gl)?;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
        gl.framebuffer_texture_2d(
            glow::FRAMEBUFFER,
            glow::COLOR_ATTACHMENT0,
            glow::TEXTURE_2D,
            native_texture(image),
            0,
        );
        let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        if status != glow::FRAMEBUFFER_COMPLETE {
            gl.delete_framebuffer(framebuffer);
            return Err(Error::gl(format!(
                "framebuffer incomplete for swapchain image: 0x{status:X}"
            )));
        }
        Ok(framebuffer)
    }
}

fn pose_to_xr(pose: &PoseF) -> xr::Posef {
    let orientation = pose.orientation.unwrap_or(Quatf::IDENTITY);
    let position = pose.position.unwrap_or(Vec3f {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    });
    xr::Posef {
        orientation: xr::Quaternionf {
            x: orientation.x,
            y: orientation.y,
            z: orientation.z,
            w: orientation.w,
        },
        position: xr::Vector3f {
            x: position.x,
            y: position.y,
            z: position.z,
        },
    }
}

fn xr_to_pose(pose: &xr::Posef) -> PoseF {
    PoseF::new(
        Quatf {
            w: pose.orientation.w,
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
        },
        Vec3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vantage_proto::decode_up;

    #[derive(Default)]
    struct CapturingUpLink {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl UpLink for CapturingUpLink {
        fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::signaling("link down"));
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn up_message_ids_start_at_one_and_increase() {
        let link = Arc::new(CapturingUpLink::default());
        let telemetry = Telemetry::new(Arc::clone(&link) as Arc<dyn UpLink>);

        assert!(telemetry.emit_tracking(PoseF::IDENTITY));
        assert!(telemetry.emit_frame(UpFrameMessage {
            frame_sequence_id: 1,
            decode_complete_time: 10,
            begin_frame_time: 5,
            display_time: 20,
        }));
        assert!(telemetry.emit_tracking(PoseF::IDENTITY));

        let sent = link.sent.lock().unwrap();
        let ids: Vec<i64> = sent
            .iter()
            .map(|bytes| decode_up(bytes).unwrap().up_message_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn send_failure_still_consumes_an_id() {
        let link = Arc::new(CapturingUpLink::default());
        let telemetry = Telemetry::new(Arc::clone(&link) as Arc<dyn UpLink>);

        assert!(telemetry.emit_tracking(PoseF::IDENTITY));
        link.fail.store(true, Ordering::Relaxed);
        assert!(!telemetry.emit_tracking(PoseF::IDENTITY));
        link.fail.store(false, Ordering::Relaxed);
        assert!(telemetry.emit_tracking(PoseF::IDENTITY));

        let sent = link.sent.lock().unwrap();
        let ids: Vec<i64> = sent
            .iter()
            .map(|bytes| decode_up(bytes).unwrap().up_message_id)
            .collect();
        // The failed send burned id 2; ordering stays strict.
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn only_sample_results_submit_projection() {
        assert!(PollRenderResult::NewSample.submits_projection());
        assert!(PollRenderResult::ReusedSample.submits_projection());
        assert!(!PollRenderResult::NoSampleAvailable.submits_projection());
        assert!(!PollRenderResult::ShouldNotRender.submits_projection());
        assert!(!PollRenderResult::ErrorWaitFrame.submits_projection());
        assert!(!PollRenderResult::ErrorEgl.submits_projection());
    }

    #[test]
    fn pose_conversion_roundtrips() {
        let pose = PoseF::new(
            Quatf {
                w: 0.9,
                x: 0.1,
                y: 0.2,
                z: 0.3,
            },
            Vec3f {
                x: 1.0,
                y: 1.5,
                z: -2.0,
            },
        );
        let xr_pose = pose_to_xr(&pose);
        assert_eq!(xr_to_pose(&xr_pose), pose);
    }
}
