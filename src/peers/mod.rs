//! Peer routing: remote clients and the membership-driven picker.

mod client;
mod picker;

pub use client::PeerClient;
pub use picker::PeerPicker;
