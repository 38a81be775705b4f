#[cfg(not(target_os = "android"))]
fn main() {
    eprintln!("vantage-client drives an Android XR headset; build for android targets");
}

#[cfg(target_os = "android")]
fn main() {
    if let Err(err) = android::run() {
        eprintln!("vantage-client failed: {err}");
        std::process::exit(1);
    }
}

#[cfg(target_os = "android")]
mod android {
    use std::sync::Arc;
    use std::time::Duration;

    use gstreamer as gst;
    use openxr as xr;
    use tracing::{info, warn};

    use vantage_client::config;
    use vantage_client::egl::EglContext;
    use vantage_client::experience::{ExperienceConfig, PollRenderResult, RemoteExperience, UpLink};
    use vantage_client::{Connection, StreamClient};
    use vantage_common::{Error, Result};
    use vantage_proto::DEFAULT_ADDITIVE_BLACK_THRESHOLD;

    const PROPERTY_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn run() -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();

        gst::init().map_err(Error::pipeline)?;
        let egl = Arc::new(EglContext::new()?);

        let entry = unsafe { xr::Entry::load() }
            .map_err(|err| Error::xr(format!("OpenXR loader: {err:?}")))?;
        entry
            .initialize_android_loader()
            .map_err(|err| Error::xr(format!("android loader init: {err:?}")))?;

        let available = entry
            .enumerate_extensions()
            .map_err(|err| Error::xr(format!("extension enumeration: {err:?}")))?;
        if !available.khr_opengl_es_enable {
            return Err(Error::xr("XR_KHR_opengl_es_enable unavailable"));
        }
        if !available.khr_convert_timespec_time {
            return Err(Error::xr("XR_KHR_convert_timespec_time unavailable"));
        }
        let mut extensions = xr::ExtensionSet::default();
        extensions.khr_opengl_es_enable = true;
        extensions.khr_android_create_instance = true;
        extensions.khr_convert_timespec_time = true;

        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: "Vantage",
                    application_version: 1,
                    engine_name: "Vantage",
                    engine_version: 1,
                    api_version: xr::Version::new(1, 0, 0),
                },
                &extensions,
                &[],
            )
            .map_err(|err| Error::xr(format!("create_instance: {err:?}")))?;
        let system = instance
            .system(xr::FormFactor::HEAD_MOUNTED_DISPLAY)
            .map_err(|err| Error::xr(format!("system: {err:?}")))?;

        let views = instance
            .enumerate_view_configuration_views(
                system,
                xr::ViewConfigurationType::PRIMARY_STEREO,
            )
            .map_err(|err| Error::xr(format!("view configuration: {err:?}")))?;
        if views.len() != 2 {
            return Err(Error::xr(format!(
                "expected 2 stereo views, runtime reports {}",
                views.len()
            )));
        }
        let eye_extents = (
            views[0].recommended_image_rect_width,
            views[0].recommended_image_rect_height,
        );
        info!("eye extents {}x{}", eye_extents.0, eye_extents.1);

        let _requirements = instance
            .graphics_requirements::<xr::OpenGlEs>(system)
            .map_err(|err| Error::xr(format!("graphics requirements: {err:?}")))?;

        let (session, frame_waiter, frame_stream) = unsafe {
            instance.create_session::<xr::OpenGlEs>(
                system,
                &xr::opengles::SessionCreateInfo::Android {
                    config: egl.raw_config(),
                    context: egl.raw_context(),
                    display: egl.raw_display(),
                },
            )
        }
        .map_err(|err| Error::xr(format!("create_session: {err:?}")))?;

        // Streaming link.
        let uri = config::websocket_uri(PROPERTY_TIMEOUT);
        info!("signaling at {uri}");
        let stream = StreamClient::new(Arc::clone(&egl))?;
        let connection = Connection::start(uri, &stream)?;
        stream.play()?;

        let default_black_threshold = config::black_threshold_override(PROPERTY_TIMEOUT)
            .unwrap_or(DEFAULT_ADDITIVE_BLACK_THRESHOLD);

        let mut experience = RemoteExperience::new(
            instance.clone(),
            system,
            session.clone(),
            frame_waiter,
            frame_stream,
            Arc::clone(&egl),
            Arc::clone(&stream),
            Arc::clone(&connection) as Arc<dyn UpLink>,
            ExperienceConfig {
                eye_extents,
                default_black_threshold,
            },
        )?;

        // Session lifecycle + frame loop.
        let mut event_buffer = xr::EventDataBuffer::new();
        let mut session_running = false;
        'main: loop {
            while let Some(event) = instance
                .poll_event(&mut event_buffer)
                .map_err(|err| Error::xr(format!("poll_event: {err:?}")))?
            {
                if let xr::Event::SessionStateChanged(change) = event {
                    match change.state() {
                        xr::SessionState::READY => {
                            session
                                .begin(xr::ViewConfigurationType::PRIMARY_STEREO)
                                .map_err(|err| Error::xr(format!("session begin: {err:?}")))?;
                            session_running = true;
                            info!("session running");
                        }
                        xr::SessionState::STOPPING => {
                            session
                                .end()
                                .map_err(|err| Error::xr(format!("session end: {err:?}")))?;
                            session_running = false;
                            info!("session stopped");
                        }
                        xr::SessionState::EXITING | xr::SessionState::LOSS_PENDING => {
                            break 'main;
                        }
                        _ => {}
                    }
                }
            }

            if !session_running {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            match experience.poll_and_render_frame() {
                PollRenderResult::ErrorWaitFrame => {
                    warn!("wait-frame error, retrying");
                    std::thread::sleep(Duration::from_millis(5));
                }
                PollRenderResult::ErrorEgl => {
                    warn!("EGL error, retrying");
                }
                _ => {}
            }
        }

        // Reverse-order teardown: link first, then GPU objects, then the XR
        // handles as the experience drops.
        connection.disconnect();
        experience.shutdown();
        stream.stop();
        Ok(())
    }
}
