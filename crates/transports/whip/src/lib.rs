//! WHIP client for WebRTC publishing
//!
//! Implements the client side of the WebRTC-HTTP Ingestion Protocol: the SDP
//! offer produced by a peer connection is POSTed to a WHIP endpoint, the
//! answer from the `201 Created` reply is applied back, and the resource named
//! by the `Location` header is DELETEd on shutdown. ICE servers advertised by
//! the endpoint in `Link` headers are picked up from an OPTIONS preflight.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  WhipSink (config, pads, shutdown)                      │
//! │  ├─ NegotiationOrchestrator                             │
//! │  │   negotiation-needed → offer → POST → answer         │
//! │  ├─ WhipSession (OPTIONS / POST / DELETE, resource URL) │
//! │  │   ├─ link_header::parse (rel="ice-server")           │
//! │  │   └─ ice::apply_ice_servers                          │
//! │  ├─ dyn HttpClient      (reqwest)                       │
//! │  └─ dyn PeerConnection  (webrtc-rs)                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use whipsink::WhipConfig;
//!
//! let config = WhipConfig::new("https://example.com/whip/endpoint/room1234")
//!     .with_stun_server("stun://stun.l.google.com:19302");
//! assert!(config.validate().is_ok());
//! assert!(config.use_link_headers);
//! ```
//!
//! ## Publishing
//!
//! ```no_run
//! # #[cfg(feature = "webrtc-engine")]
//! # async fn example() -> whipsink::Result<()> {
//! use std::sync::Arc;
//! use whipsink::{MediaKind, ReqwestHttpClient, WebRtcPeerConnection, WhipConfig, WhipSink};
//!
//! let config = WhipConfig::new("https://example.com/whip/endpoint/room1234");
//! let http = Arc::new(ReqwestHttpClient::new(config.timeout())?);
//! let peer = Arc::new(WebRtcPeerConnection::new(config.bundle_policy)?);
//!
//! let sink = WhipSink::new(config, http, peer).await?;
//! sink.request_pad(MediaKind::Audio).await?;
//! // ... negotiation runs when the peer connection asks for it ...
//! sink.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod http;
pub mod ice;
pub mod link_header;
pub mod negotiation;
pub mod peer;
pub mod sdp;
pub mod session;
pub mod sink;

#[cfg(feature = "webrtc-engine")]
pub mod engine;

pub use config::{BundlePolicy, NegotiationMode, WhipConfig};
pub use error::{Error, Result};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestHttpClient};
pub use link_header::IceServer;
pub use negotiation::{CycleReport, Dispatcher, NegotiationOrchestrator};
pub use peer::{MediaKind, MediaPad, NegotiationNeededHandler, PeerConnection};
pub use sdp::{SdpAnswer, SdpOffer, SessionDescription};
pub use session::{SessionState, WhipAnswer, WhipSession};
pub use sink::WhipSink;

#[cfg(feature = "webrtc-engine")]
pub use engine::WebRtcPeerConnection;

/// Get library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
