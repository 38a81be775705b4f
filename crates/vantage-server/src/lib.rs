//! Server side of the Vantage streaming link.
//!
//! One shared GStreamer pipeline encodes and payloads the scene video; each
//! connected headset gets its own `webrtcbin` fed from a tee, plus a reliable
//! ordered data channel carrying telemetry back. A probe on the payloader
//! attaches the current per-frame [`vantage_proto::DownMessage`] to the
//! marker packet of every access unit.

pub mod dispatch;
pub mod pipeline;
pub mod session;

pub use dispatch::{EventDispatcher, EventKind};
pub use pipeline::{PipelineArgs, StreamPipeline};
pub use session::SessionRegistry;
