//! Websocket signaling for Vantage.
//!
//! The server accepts one websocket per headset, hands out client ids, and
//! turns the JSON envelope into typed [`SignalingEvent`]s; the client side
//! connects to the server and surfaces the offer/candidate flow. SDP and ICE
//! payloads are opaque strings here — this crate only moves them.

#![forbid(unsafe_code)]

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ServerEvent, SignalingClient};
pub use protocol::Envelope;
pub use server::{ClientId, SignalingEvent, SignalingServer};
