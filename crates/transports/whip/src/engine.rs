//! `PeerConnection` over webrtc-rs
//!
//! WHIP without trickle ICE: `create_offer` waits for candidate gathering to
//! finish so the offer that gets POSTed already carries every candidate.
//!
//! webrtc-rs passes ICE servers to its gatherer only when the connection is
//! created, so the connection is created lazily by the first `create_offer`.
//! STUN/TURN servers and the bundle policy set before that point take effect;
//! afterwards they are refused.

use crate::config::BundlePolicy;
use crate::peer::{MediaKind, MediaPad, NegotiationNeededHandler, PeerConnection};
use crate::sdp::{SdpAnswer, SdpOffer, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// ICE servers for the connection, kept apart so STUN can be replaced
/// without touching TURN
#[derive(Debug, Default)]
struct IceServers {
    stun: Option<RTCIceServer>,
    turn: Option<RTCIceServer>,
    extra_turn: Vec<RTCIceServer>,
}

impl IceServers {
    fn to_vec(&self) -> Vec<RTCIceServer> {
        self.stun
            .iter()
            .chain(self.turn.iter())
            .chain(self.extra_turn.iter())
            .cloned()
            .collect()
    }
}

struct PadTrack {
    track: Arc<TrackLocalStaticSample>,
    /// Set once the track is attached to the connection
    sender: Option<Arc<RTCRtpSender>>,
}

/// Everything collected before the connection is built
///
/// webrtc-rs hands the ICE server list to its gatherer only when the
/// connection is created, so servers and bundle policy are frozen once
/// `built` is set.
struct EngineState {
    bundle_policy: BundlePolicy,
    ice_servers: IceServers,
    pads: HashMap<u32, PadTrack>,
    handler: Option<Arc<NegotiationNeededHandler>>,
    built: bool,
}

/// webrtc-rs peer connection used as the WHIP media engine
///
/// The underlying `RTCPeerConnection` is created by the first
/// `create_offer`, with every ICE server and pad configured up to then.
pub struct WebRtcPeerConnection {
    api: API,
    connection: OnceCell<Arc<RTCPeerConnection>>,
    state: Mutex<EngineState>,
    next_pad: AtomicU32,
}

impl WebRtcPeerConnection {
    /// Prepare a peer connection with default codecs and interceptors
    pub fn new(bundle_policy: BundlePolicy) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnection(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnection(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        Ok(Self {
            api,
            connection: OnceCell::new(),
            state: Mutex::new(EngineState {
                bundle_policy,
                ice_servers: IceServers::default(),
                pads: HashMap::new(),
                handler: None,
                built: false,
            }),
            next_pad: AtomicU32::new(0),
        })
    }

    /// Underlying webrtc-rs connection, once the first offer was created
    pub fn inner(&self) -> Option<&Arc<RTCPeerConnection>> {
        self.connection.get()
    }

    /// Local track backing a pad, for writing samples
    pub fn track(&self, pad: &MediaPad) -> Option<Arc<TrackLocalStaticSample>> {
        self.state
            .lock()
            .pads
            .get(&pad.id())
            .map(|pad| Arc::clone(&pad.track))
    }

    pub async fn close(&self) -> Result<()> {
        let Some(peer_connection) = self.connection.get() else {
            return Ok(());
        };
        peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to close peer connection: {}", e)))
    }

    /// The connection, built on first use
    async fn connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let result = self.connection.get_or_try_init(|| self.build()).await;
        match result {
            Ok(peer_connection) => Ok(Arc::clone(peer_connection)),
            Err(e) => {
                self.state.lock().built = false;
                Err(e)
            }
        }
    }

    async fn build(&self) -> Result<Arc<RTCPeerConnection>> {
        let (rtc_config, tracks) = {
            let mut state = self.state.lock();
            state.built = true;
            let rtc_config = RTCConfiguration {
                ice_servers: state.ice_servers.to_vec(),
                bundle_policy: rtc_bundle_policy(state.bundle_policy),
                ..Default::default()
            };
            let tracks: Vec<(u32, Arc<TrackLocalStaticSample>)> = state
                .pads
                .iter()
                .map(|(id, pad)| (*id, Arc::clone(&pad.track)))
                .collect();
            (rtc_config, tracks)
        };
        let ice_server_count = rtc_config.ice_servers.len();

        let peer_connection = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnection(format!("Failed to create peer connection: {}", e))
        })?);

        for (id, track) in tracks {
            let sender = peer_connection
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::PeerConnection(format!("Failed to add track: {}", e)))?;
            let mut state = self.state.lock();
            if let Some(pad) = state.pads.get_mut(&id) {
                pad.sender = Some(sender);
            }
        }

        let (handler, bundle_policy) = {
            let state = self.state.lock();
            (state.handler.clone(), state.bundle_policy)
        };
        if let Some(handler) = handler {
            install_negotiation_handler(&peer_connection, handler);
        }

        info!(
            "Created WebRTC peer connection (bundle policy {}, {} ICE server(s))",
            bundle_policy, ice_server_count
        );
        Ok(peer_connection)
    }

    fn update_ice_servers(&self, update: impl FnOnce(&mut IceServers)) -> Result<()> {
        let mut state = self.state.lock();
        if state.built {
            return Err(Error::PeerConnection(
                "ICE servers are fixed once the first offer was created".to_string(),
            ));
        }
        update(&mut state.ice_servers);
        Ok(())
    }
}

fn install_negotiation_handler(
    peer_connection: &RTCPeerConnection,
    handler: Arc<NegotiationNeededHandler>,
) {
    peer_connection.on_negotiation_needed(Box::new(move || {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            fire_negotiation_needed(handler);
        })
    }));
}

fn fire_negotiation_needed(handler: Arc<NegotiationNeededHandler>) {
    // Blocking negotiation must not run on a runtime worker
    tokio::task::spawn_blocking(move || (*handler)());
}

fn rtc_bundle_policy(policy: BundlePolicy) -> RTCBundlePolicy {
    match policy {
        BundlePolicy::None => RTCBundlePolicy::Unspecified,
        BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
        BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
    }
}

/// `stun://host:port` to webrtc-rs form
fn stun_ice_server(url: &str) -> Result<RTCIceServer> {
    let address = url
        .strip_prefix("stun://")
        .filter(|address| !address.is_empty())
        .ok_or_else(|| Error::InvalidConfig(format!("Not a stun:// URL: {}", url)))?;

    Ok(RTCIceServer {
        urls: vec![format!("stun:{}", address)],
        ..Default::default()
    })
}

/// `turn(s)://user:pass@host:port` to webrtc-rs form
fn turn_ice_server(url: &str) -> Result<RTCIceServer> {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("turn://") {
        ("turn", rest)
    } else if let Some(rest) = url.strip_prefix("turns://") {
        ("turns", rest)
    } else {
        return Err(Error::InvalidConfig(format!("Not a turn(s):// URL: {}", url)));
    };

    let (credentials, address) = rest
        .rsplit_once('@')
        .ok_or_else(|| Error::InvalidConfig(format!("TURN URL has no credentials: {}://...", scheme)))?;
    let (username, credential) = credentials
        .split_once(':')
        .ok_or_else(|| Error::InvalidConfig(format!("TURN URL has no password: {}://...", scheme)))?;

    if address.is_empty() || username.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "Incomplete TURN URL: {}://{}:***@{}",
            scheme, username, address
        )));
    }

    Ok(RTCIceServer {
        urls: vec![format!("{}:{}", scheme, address)],
        username: username.to_string(),
        credential: credential.to_string(),
        ..Default::default()
    })
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SdpOffer> {
        let peer_connection = self.connection().await?;
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to create offer: {}", e)))?;

        let mut gathering_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to set local description: {}", e)))?;
        let _ = gathering_complete.recv().await;
        debug!("ICE gathering complete");

        let local = peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::PeerConnection("No local description after gathering".to_string()))?;
        SessionDescription::offer(local.sdp)
    }

    async fn set_local_description(&self, offer: &SdpOffer) -> Result<()> {
        let Some(peer_connection) = self.connection.get() else {
            return Err(Error::PeerConnection(
                "No offer was created on this connection".to_string(),
            ));
        };
        if let Some(current) = peer_connection.local_description().await {
            if current.sdp == offer.as_text() {
                return Ok(());
            }
        }

        let description = RTCSessionDescription::offer(offer.as_text().to_string())
            .map_err(|e| Error::SdpParse(e.to_string()))?;
        peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, answer: &SdpAnswer) -> Result<()> {
        let Some(peer_connection) = self.connection.get() else {
            return Err(Error::PeerConnection(
                "Answer received before an offer was created".to_string(),
            ));
        };
        let description = RTCSessionDescription::answer(answer.as_text().to_string())
            .map_err(|e| Error::SdpParse(e.to_string()))?;
        peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to set remote description: {}", e)))
    }

    async fn set_stun_server(&self, url: &str) -> Result<()> {
        let server = stun_ice_server(url)?;
        self.update_ice_servers(|servers| servers.stun = Some(server))
    }

    async fn set_turn_server(&self, url: &str) -> Result<()> {
        let server = turn_ice_server(url)?;
        self.update_ice_servers(|servers| servers.turn = Some(server))
    }

    async fn add_turn_server(&self, url: &str) -> bool {
        let result = turn_ice_server(url)
            .and_then(|server| self.update_ice_servers(|servers| servers.extra_turn.push(server)));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    async fn set_bundle_policy(&self, policy: BundlePolicy) -> Result<()> {
        let mut state = self.state.lock();
        if policy == state.bundle_policy {
            return Ok(());
        }
        if state.built {
            return Err(Error::PeerConnection(format!(
                "Bundle policy is fixed once the first offer was created ({}), cannot switch to {}",
                state.bundle_policy, policy
            )));
        }
        state.bundle_policy = policy;
        Ok(())
    }

    async fn request_pad(&self, kind: MediaKind) -> Result<MediaPad> {
        let id = self.next_pad.fetch_add(1, Ordering::Relaxed);
        let pad = MediaPad::new(id, kind);

        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            format!("{}-{}", kind, pad.name()),
            "whipsink".to_string(),
        ));

        // Before the connection exists the track is attached at build time,
        // and adding it is what makes negotiation necessary
        let pending_handler = {
            let mut state = self.state.lock();
            if state.built {
                None
            } else {
                state.pads.insert(
                    id,
                    PadTrack {
                        track: Arc::clone(&track),
                        sender: None,
                    },
                );
                Some(state.handler.clone())
            }
        };
        if let Some(handler) = pending_handler {
            if let Some(handler) = handler {
                fire_negotiation_needed(handler);
            }
            return Ok(pad);
        }

        let peer_connection = self.connection().await?;
        let sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::PeerConnection(format!("Failed to add {} track: {}", kind, e)))?;

        self.state.lock().pads.insert(
            id,
            PadTrack {
                track,
                sender: Some(sender),
            },
        );
        Ok(pad)
    }

    async fn release_pad(&self, pad: &MediaPad) -> Result<()> {
        let built = self.state.lock().built;
        let peer_connection = if built {
            Some(self.connection().await?)
        } else {
            None
        };

        let pad_track = self.state.lock().pads.remove(&pad.id());
        let Some(pad_track) = pad_track else {
            return Err(Error::PeerConnection(format!("Unknown pad {}", pad.name())));
        };

        match (peer_connection, pad_track.sender) {
            (Some(peer_connection), Some(sender)) => peer_connection
                .remove_track(&sender)
                .await
                .map_err(|e| Error::PeerConnection(format!("Failed to remove track: {}", e))),
            _ => Ok(()),
        }
    }

    fn on_negotiation_needed(&self, handler: NegotiationNeededHandler) {
        let handler = Arc::new(handler);
        self.state.lock().handler = Some(Arc::clone(&handler));
        if let Some(peer_connection) = self.connection.get() {
            install_negotiation_handler(peer_connection, handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stun_url_conversion() {
        let server = stun_ice_server("stun://stun.l.google.com:19302").unwrap();
        assert_eq!(server.urls, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert!(stun_ice_server("stun://").is_err());
        assert!(stun_ice_server("turn://a:b@c").is_err());
    }

    #[test]
    fn test_turn_url_conversion() {
        let server = turn_ice_server("turn://user:p@ss@turn.example.net:3478?transport=udp").unwrap();
        assert_eq!(
            server.urls,
            vec!["turn:turn.example.net:3478?transport=udp".to_string()]
        );
        assert_eq!(server.username, "user");
        assert_eq!(server.credential, "p@ss");

        let server = turn_ice_server("turns://u:p@turn.example.net:5349").unwrap();
        assert_eq!(server.urls, vec!["turns:turn.example.net:5349".to_string()]);
    }

    #[test]
    fn test_turn_url_without_credentials_rejected() {
        assert!(turn_ice_server("turn://turn.example.net:3478").is_err());
        assert!(turn_ice_server("turn://user@turn.example.net:3478").is_err());
        assert!(turn_ice_server("stun://turn.example.net").is_err());
    }

    #[test]
    fn test_bundle_policy_mapping() {
        assert_eq!(rtc_bundle_policy(BundlePolicy::None), RTCBundlePolicy::Unspecified);
        assert_eq!(rtc_bundle_policy(BundlePolicy::MaxBundle), RTCBundlePolicy::MaxBundle);
    }

    #[tokio::test]
    async fn test_pad_request_and_release() {
        let pc = WebRtcPeerConnection::new(BundlePolicy::MaxBundle).unwrap();
        let pad = pc.request_pad(MediaKind::Audio).await.unwrap();
        assert_eq!(pad.name(), "sink_0");
        assert!(pc.track(&pad).is_some());

        pc.release_pad(&pad).await.unwrap();
        assert!(pc.track(&pad).is_none());
        assert!(pc.release_pad(&pad).await.is_err());
        pc.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pad_before_offer_fires_negotiation_needed() {
        let pc = WebRtcPeerConnection::new(BundlePolicy::None).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(());
        }));

        pc.request_pad(MediaKind::Video).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("negotiation-needed was not fired")
            .unwrap();
        assert!(pc.inner().is_none());
    }

    #[tokio::test]
    async fn test_bundle_policy_fixed_by_first_offer() {
        let pc = WebRtcPeerConnection::new(BundlePolicy::Balanced).unwrap();
        assert!(pc.set_bundle_policy(BundlePolicy::Balanced).await.is_ok());
        assert!(pc.set_bundle_policy(BundlePolicy::MaxBundle).await.is_ok());
        pc.request_pad(MediaKind::Audio).await.unwrap();

        pc.create_offer().await.unwrap();

        assert!(pc.set_bundle_policy(BundlePolicy::MaxBundle).await.is_ok());
        assert!(pc.set_bundle_policy(BundlePolicy::Balanced).await.is_err());
        assert_eq!(
            pc.inner().unwrap().get_configuration().await.bundle_policy,
            RTCBundlePolicy::MaxBundle
        );
        pc.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stun_server_reaches_gathering() {
        let stun = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stun_url = format!("stun://{}", stun.local_addr().unwrap());
        let receiving = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, _) = tokio::time::timeout(Duration::from_secs(30), stun.recv_from(&mut buf))
                .await
                .expect("no STUN request reached the configured server")
                .unwrap();
            buf[..len].to_vec()
        });

        let pc = WebRtcPeerConnection::new(BundlePolicy::MaxBundle).unwrap();
        pc.set_stun_server(&stun_url).await.unwrap();
        pc.request_pad(MediaKind::Audio).await.unwrap();

        let offer = tokio::time::timeout(Duration::from_secs(30), pc.create_offer())
            .await
            .expect("ICE gathering did not finish")
            .unwrap();
        assert!(offer.as_text().contains("m=audio"));

        // Binding request with the STUN magic cookie
        let packet = receiving.await.unwrap();
        assert!(packet.len() >= 20);
        assert_eq!(&packet[0..2], &[0x00, 0x01]);
        assert_eq!(&packet[4..8], &[0x21, 0x12, 0xA4, 0x42]);

        // Too late for the gatherer, so refused instead of silently ignored
        assert!(pc.set_stun_server("stun://stun.example.net:3478").await.is_err());
        assert!(pc.set_turn_server("turn://u:p@turn.example.net:3478").await.is_err());
        assert!(!pc.add_turn_server("turn://u:p@turn.example.net:3478").await);
        pc.close().await.unwrap();
    }
}
