use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gstreamer as gst;
use tracing::{debug, info, warn};

use vantage_proto::{
    blend_mode, DownMessage, PoseF, DEFAULT_ADDITIVE_BLACK_THRESHOLD,
};
use vantage_server::{EventDispatcher, EventKind, PipelineArgs, SessionRegistry, StreamPipeline};
use vantage_signaling::SignalingServer;

#[derive(Parser, Debug)]
#[command(name = "vantage-server")]
struct Args {
    /// Websocket signaling listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    signaling: SocketAddr,

    /// Full (both eyes, side by side) stream width.
    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Record the encoded stream into this Matroska file.
    #[arg(long)]
    record: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    gst::init()?;

    // Bus watch and webrtc glue run on the default main context.
    let main_loop = glib::MainLoop::new(None, false);
    {
        let main_loop = main_loop.clone();
        std::thread::Builder::new()
            .name("glib-main".to_string())
            .spawn(move || main_loop.run())?;
    }

    let pipeline = Arc::new(StreamPipeline::create(&PipelineArgs {
        appsrc_name: "scene".to_string(),
        width: args.width,
        height: args.height,
        fps: args.fps,
        record_path: args.record.clone(),
    })?);

    let dispatcher = Arc::new(EventDispatcher::new());

    // Input consumer: the freshest head pose feeds the next frames' metadata.
    let latest_pose = Arc::new(Mutex::new(PoseF::IDENTITY));
    {
        let latest_pose = Arc::clone(&latest_pose);
        dispatcher.register(EventKind::Tracking, move |msg| {
            if let Some(pose) = msg.tracking.and_then(|t| t.view_pose_in_world) {
                *latest_pose.lock().expect("pose lock poisoned") = pose;
            }
        });
    }
    dispatcher.register(EventKind::FrameTiming, |msg| {
        if let Some(frame) = &msg.frame {
            debug!(
                "frame {} timing: begin={} decode_done={} display={}",
                frame.frame_sequence_id,
                frame.begin_frame_time,
                frame.decode_complete_time,
                frame.display_time
            );
        }
    });

    let (signaling, mut events) = SignalingServer::bind(args.signaling).await?;
    let signaling = Arc::new(signaling);
    let sessions = SessionRegistry::new(&pipeline, Arc::clone(&signaling), Arc::clone(&dispatcher));

    pipeline.play()?;

    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_scene_producer(
        Arc::clone(&pipeline),
        Arc::clone(&latest_pose),
        Arc::clone(&stop),
        &args,
    )?;

    info!("serving; ctrl-c to stop");
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    // Promise waits inside may block briefly; keep event
                    // order by handling inline on a blocking-allowed thread.
                    Some(event) => tokio::task::block_in_place(|| sessions.handle_event(event)),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    if producer.join().is_err() {
        warn!("scene producer panicked");
    }
    pipeline.stop_if_playing();
    main_loop.quit();
    Ok(())
}

/// Placeholder scene: an animated gradient, one buffer per frame, with the
/// matching down message installed before the frame enters the encoder.
fn spawn_scene_producer(
    pipeline: Arc<StreamPipeline>,
    latest_pose: Arc<Mutex<PoseF>>,
    stop: Arc<AtomicBool>,
    args: &Args,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    let (width, height, fps) = (args.width as usize, args.height as usize, args.fps.max(1));
    std::thread::Builder::new()
        .name("scene-producer".to_string())
        .spawn(move || {
            let frame_interval = Duration::from_secs(1) / fps;
            let mut frame = vec![0u8; width * height * 4];
            let mut sequence: i64 = 1;

            while !stop.load(Ordering::Relaxed) {
                let pose = *latest_pose.lock().expect("pose lock poisoned");
                pipeline.set_down_msg(&DownMessage {
                    frame_sequence_id: sequence,
                    view_pose_left: Some(pose),
                    view_pose_right: Some(pose),
                    env_blend_mode: blend_mode::OPAQUE,
                    additive_black_threshold: DEFAULT_ADDITIVE_BLACK_THRESHOLD,
                });

                paint_gradient(&mut frame, width, height, sequence);
                if let Err(err) = pipeline.push_frame(&frame) {
                    warn!("frame {sequence} not pushed: {err}");
                    break;
                }
                sequence += 1;
                std::thread::sleep(frame_interval);
            }
            debug!("scene producer stopped after {} frames", sequence - 1);
        })
}

fn paint_gradient(frame: &mut [u8], width: usize, height: usize, sequence: i64) {
    let phase = (sequence % 256) as usize;
    for y in 0..height {
        let row = &mut frame[y * width * 4..(y + 1) * width * 4];
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            px[0] = ((x * 255 / width) + phase) as u8;
            px[1] = (y * 255 / height) as u8;
            px[2] = phase as u8;
            px[3] = 255;
        }
    }
}
