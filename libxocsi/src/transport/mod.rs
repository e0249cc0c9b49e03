//! QUIC transport layer for CSI messages.
//!
//! [`CsiClient`] and [`CsiServer`] exchange [`CsiMessage`] values as JSON
//! over QUIC bi-directional streams using `quinn`, one request and one
//! response per stream.
//!
//! [`CsiMessage`]: crate::message::CsiMessage

pub mod client;
pub mod server;

/// ALPN protocol id both ends must offer.
pub const ALPN: &[u8] = b"xocsi/1";

pub use client::CsiClient;
pub use server::{CsiServer, ServerState};
