//! Peer connection capability
//!
//! The WebRTC engine that creates offers, applies answers and gathers ICE
//! candidates lives outside this crate. Signaling talks to it only through
//! `PeerConnection`.

use crate::config::BundlePolicy;
use crate::sdp::{SdpAnswer, SdpOffer};
use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Callback invoked by the engine when negotiation is needed
pub type NegotiationNeededHandler = Box<dyn Fn() + Send + Sync + 'static>;

/// Media kind of a requested pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Opaque media-plane attachment handed out by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaPad {
    id: u32,
    kind: MediaKind,
}

impl MediaPad {
    pub fn new(id: u32, kind: MediaKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Pad name, `sink_<id>`
    pub fn name(&self) -> String {
        format!("sink_{}", self.id)
    }
}

/// Operations the WHIP signaling needs from a WebRTC peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SdpOffer>;

    /// Apply the offer as local description
    async fn set_local_description(&self, offer: &SdpOffer) -> Result<()>;

    /// Apply the endpoint's answer as remote description
    async fn set_remote_description(&self, answer: &SdpAnswer) -> Result<()>;

    /// Replace the single STUN server (`stun://host:port`)
    async fn set_stun_server(&self, url: &str) -> Result<()>;

    /// Replace the explicitly configured TURN server (`turn(s)://user:pass@host:port`)
    async fn set_turn_server(&self, url: &str) -> Result<()>;

    /// Add a TURN/TURNS server, additive
    ///
    /// Returns false if the engine rejects the URL.
    async fn add_turn_server(&self, url: &str) -> bool;

    async fn set_bundle_policy(&self, policy: BundlePolicy) -> Result<()>;

    /// Attach a media input
    async fn request_pad(&self, kind: MediaKind) -> Result<MediaPad>;

    /// Detach a media input obtained from `request_pad`
    async fn release_pad(&self, pad: &MediaPad) -> Result<()>;

    /// Register the negotiation-needed callback, replacing any previous one
    fn on_negotiation_needed(&self, handler: NegotiationNeededHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_name() {
        let pad = MediaPad::new(3, MediaKind::Video);
        assert_eq!(pad.name(), "sink_3");
        assert_eq!(pad.kind().to_string(), "video");
    }
}
