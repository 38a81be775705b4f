//! Headset side of the Vantage streaming link.
//!
//! Three threads cooperate here: the XR render thread runs
//! [`experience::RemoteExperience::poll_and_render_frame`], the decode thread
//! publishes finished frames through the single-slot [`sample::SampleQueue`],
//! and the WebRTC stack delivers data-channel callbacks. The EGL context is a
//! shared scoped capability ([`egl::EglContext`]) serialized across all of
//! them.

pub mod clock;
pub mod config;
pub mod connection;
pub mod egl;
pub mod experience;
pub mod passthrough;
pub mod render;
pub mod sample;
pub mod stream;

pub use connection::Connection;
pub use experience::{PollRenderResult, RemoteExperience, UpLink};
pub use sample::{Sample, SampleQueue};
pub use stream::StreamClient;
