//! WHIP sink: the publishing element
//!
//! Owns the configuration, the session and the orchestrator, hooks the
//! orchestrator to the peer connection's negotiation-needed event and passes
//! media pads through to the peer connection.

use crate::config::{BundlePolicy, WhipConfig};
use crate::http::HttpClient;
use crate::negotiation::{CycleReport, Dispatcher, NegotiationOrchestrator};
use crate::peer::{MediaKind, MediaPad, PeerConnection};
use crate::sdp::SdpAnswer;
use crate::session::{SessionState, WhipSession};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// WHIP publisher bound to one peer connection
pub struct WhipSink {
    session: Arc<WhipSession>,
    orchestrator: Arc<NegotiationOrchestrator>,
    peer: Arc<dyn PeerConnection>,
    runtime: Handle,
    pads: Mutex<Vec<MediaPad>>,
}

impl WhipSink {
    /// Create a sink on the current tokio runtime
    pub async fn new(
        config: WhipConfig,
        http: Arc<dyn HttpClient>,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidConfig(format!("No tokio runtime available: {}", e)))?;
        Self::with_runtime(config, http, peer, runtime).await
    }

    /// Create a sink whose negotiation cycles run on `runtime`
    ///
    /// The explicit STUN/TURN servers and the bundle policy are applied to the
    /// peer connection before the negotiation-needed handler is installed.
    pub async fn with_runtime(
        config: WhipConfig,
        http: Arc<dyn HttpClient>,
        peer: Arc<dyn PeerConnection>,
        runtime: Handle,
    ) -> Result<Self> {
        let session = Arc::new(WhipSession::new(config.clone(), http, Arc::clone(&peer))?);

        if let Some(stun_server) = &config.stun_server {
            peer.set_stun_server(stun_server).await?;
        }
        if let Some(turn_server) = &config.turn_server {
            peer.set_turn_server(turn_server).await?;
        }
        if config.bundle_policy != BundlePolicy::None {
            peer.set_bundle_policy(config.bundle_policy).await?;
        }

        let dispatcher = Dispatcher::new(config.negotiation_mode, runtime.clone());
        let orchestrator = Arc::new(NegotiationOrchestrator::new(
            Arc::clone(&session),
            Arc::clone(&peer),
            dispatcher,
        ));

        let orchestrator_weak = Arc::downgrade(&orchestrator);
        peer.on_negotiation_needed(Box::new(move || match orchestrator_weak.upgrade() {
            Some(orchestrator) => {
                orchestrator.on_negotiation_needed();
            }
            None => debug!("Negotiation needed after the sink was dropped"),
        }));

        info!(
            "WHIP sink ready for {} ({:?} negotiation)",
            config.whip_endpoint, config.negotiation_mode
        );

        Ok(Self {
            session,
            orchestrator,
            peer,
            runtime,
            pads: Mutex::new(Vec::new()),
        })
    }

    pub fn session(&self) -> &Arc<WhipSession> {
        &self.session
    }

    pub fn orchestrator(&self) -> &Arc<NegotiationOrchestrator> {
        &self.orchestrator
    }

    /// Snapshot of the configuration
    ///
    /// `stun_server`, `turn_server` and `bundle_policy` are informational
    /// after construction: they record the last value the peer connection
    /// accepted. The peer connection holds the effective settings, and
    /// servers discovered from Link headers are not reflected here.
    pub fn config(&self) -> WhipConfig {
        self.session.config()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn resource_url(&self) -> Option<String> {
        self.session.resource_url()
    }

    /// Watch finished negotiation cycles
    pub fn subscribe(&self) -> watch::Receiver<CycleReport> {
        self.orchestrator.subscribe()
    }

    pub fn set_endpoint(&self, whip_endpoint: &str) -> Result<()> {
        self.session.set_endpoint(whip_endpoint)
    }

    pub fn set_use_link_headers(&self, use_link_headers: bool) {
        self.session.set_use_link_headers(use_link_headers);
    }

    pub fn set_auth_token(&self, auth_token: Option<&str>) {
        self.session.set_auth_token(auth_token);
    }

    /// Set the explicit STUN server (`stun://host:port`)
    pub async fn set_stun_server(&self, stun_server: &str) -> Result<()> {
        if !stun_server.starts_with("stun://") {
            return Err(Error::InvalidConfig(format!(
                "stun_server must start with stun://, got {}",
                stun_server
            )));
        }
        self.peer.set_stun_server(stun_server).await?;
        self.session
            .update_config(|config| config.stun_server = Some(stun_server.to_string()));
        Ok(())
    }

    /// Set the explicit TURN server (`turn(s)://user:pass@host:port`)
    pub async fn set_turn_server(&self, turn_server: &str) -> Result<()> {
        if !turn_server.starts_with("turn://") && !turn_server.starts_with("turns://") {
            return Err(Error::InvalidConfig(format!(
                "turn_server must start with turn:// or turns://, got {}",
                turn_server
            )));
        }
        self.peer.set_turn_server(turn_server).await?;
        self.session
            .update_config(|config| config.turn_server = Some(turn_server.to_string()));
        Ok(())
    }

    pub async fn set_bundle_policy(&self, bundle_policy: BundlePolicy) -> Result<()> {
        self.peer.set_bundle_policy(bundle_policy).await?;
        self.session
            .update_config(|config| config.bundle_policy = bundle_policy);
        Ok(())
    }

    /// Request a media pad from the peer connection
    pub async fn request_pad(&self, kind: MediaKind) -> Result<MediaPad> {
        if self.session.is_torn_down() {
            return Err(Error::TornDown);
        }
        let pad = self.peer.request_pad(kind).await?;
        debug!("Requested pad {} ({})", pad.name(), kind);
        self.pads.lock().push(pad.clone());
        Ok(pad)
    }

    /// Release a pad obtained from [`WhipSink::request_pad`]
    pub async fn release_pad(&self, pad: &MediaPad) -> Result<()> {
        let known = {
            let mut pads = self.pads.lock();
            let before = pads.len();
            pads.retain(|other| other != pad);
            pads.len() != before
        };
        if !known {
            return Err(Error::PeerConnection(format!("Unknown pad {}", pad.name())));
        }
        self.peer.release_pad(pad).await?;
        debug!("Released pad {}", pad.name());
        Ok(())
    }

    /// Pads currently requested
    pub fn pads(&self) -> Vec<MediaPad> {
        self.pads.lock().clone()
    }

    /// Run a negotiation cycle now and wait for it
    pub async fn negotiate(&self) -> Result<SdpAnswer> {
        self.orchestrator.negotiate().await
    }

    /// Tear the session down, DELETEing the resource if one exists
    ///
    /// Returns the DELETE status. Safe to call more than once.
    pub async fn shutdown(&self) -> Option<u16> {
        let status = self.session.teardown().await;
        info!("WHIP sink shut down");
        status
    }
}

impl Drop for WhipSink {
    fn drop(&mut self) {
        if self.session.is_torn_down() {
            return;
        }
        warn!("WHIP sink dropped without shutdown, tearing down in background");
        let session = Arc::clone(&self.session);
        self.runtime.spawn(async move {
            session.teardown().await;
        });
    }
}

impl std::fmt::Debug for WhipSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhipSink")
            .field("session", &self.session)
            .field("pads", &self.pads.lock().len())
            .finish()
    }
}
