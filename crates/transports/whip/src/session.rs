//! WHIP session: OPTIONS preflight, offer POST and resource DELETE
//!
//! All session state sits behind one `parking_lot::Mutex`. The lock is taken
//! to read what a request needs, released for the network exchange, then taken
//! again to commit the result. Every exchange is abortable and tagged with the
//! session generation, so a response that lands after `teardown()` never
//! touches session state.

use crate::config::WhipConfig;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::ice::{apply_ice_servers, AppliedIceServers};
use crate::link_header;
use crate::peer::PeerConnection;
use crate::sdp::SdpOffer;
use crate::{Error, Result};
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Lifecycle of a WHIP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// OPTIONS preflight in flight
    OptionsPending,
    /// Offer created and set as local description
    OfferReady,
    /// POST in flight
    Posting,
    /// Answer received, resource URL stored
    Negotiated,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OptionsPending => "options-pending",
            SessionState::OfferReady => "offer-ready",
            SessionState::Posting => "posting",
            SessionState::Negotiated => "negotiated",
            SessionState::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Successful POST result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhipAnswer {
    /// Raw SDP answer text from the response body
    pub sdp: String,
    /// Absolute resource URL, if the endpoint sent a `Location` header
    pub resource_url: Option<String>,
}

struct Inner {
    config: WhipConfig,
    state: SessionState,
    resource_url: Option<String>,
    posting_started: bool,
    generation: u64,
    next_request: u64,
    cancellers: Vec<(u64, AbortHandle)>,
}

impl Inner {
    /// State to fall back to when an exchange fails
    fn settled_state(&self) -> SessionState {
        if self.resource_url.is_some() {
            SessionState::Negotiated
        } else {
            SessionState::Idle
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == SessionState::TornDown {
            Err(Error::TornDown)
        } else {
            Ok(())
        }
    }
}

/// Client side of one WHIP publishing session
pub struct WhipSession {
    inner: Mutex<Inner>,
    http: Arc<dyn HttpClient>,
    peer: Arc<dyn PeerConnection>,
}

impl WhipSession {
    /// Create a session, validating the configuration once
    pub fn new(
        config: WhipConfig,
        http: Arc<dyn HttpClient>,
        peer: Arc<dyn PeerConnection>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Mutex::new(Inner {
                config,
                state: SessionState::Idle,
                resource_url: None,
                posting_started: false,
                generation: 0,
                next_request: 0,
                cancellers: Vec::new(),
            }),
            http,
            peer,
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn endpoint(&self) -> String {
        self.inner.lock().config.whip_endpoint.clone()
    }

    /// Resource URL of the current negotiation, if any
    pub fn resource_url(&self) -> Option<String> {
        self.inner.lock().resource_url.clone()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> WhipConfig {
        self.inner.lock().config.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn is_torn_down(&self) -> bool {
        self.state() == SessionState::TornDown
    }

    /// Fail with `TornDown` if the session moved past `generation`
    pub fn check_generation(&self, generation: u64) -> Result<()> {
        let inner = self.inner.lock();
        inner.ensure_live()?;
        if inner.generation != generation {
            return Err(Error::TornDown);
        }
        Ok(())
    }

    /// Change the WHIP endpoint
    ///
    /// Refused once the first offer POST has started.
    pub fn set_endpoint(&self, whip_endpoint: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        if inner.posting_started {
            return Err(Error::InvalidConfig(
                "whip_endpoint cannot change after the offer was sent".to_string(),
            ));
        }

        let mut config = inner.config.clone();
        config.whip_endpoint = whip_endpoint.to_string();
        config.validate()?;
        inner.config = config;
        Ok(())
    }

    pub fn set_use_link_headers(&self, use_link_headers: bool) {
        self.inner.lock().config.use_link_headers = use_link_headers;
    }

    pub fn set_auth_token(&self, auth_token: Option<&str>) {
        self.inner.lock().config.auth_token = auth_token.map(str::to_string);
    }

    /// Record peer-connection settings in the configuration snapshot
    ///
    /// The session itself never reads `stun_server`, `turn_server` or
    /// `bundle_policy`; they are kept for `config()` readers.
    pub(crate) fn update_config(&self, update: impl FnOnce(&mut WhipConfig)) {
        update(&mut self.inner.lock().config);
    }

    /// Record that an offer was created and set as local description
    pub(crate) fn mark_offer_ready(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_live()?;
        inner.state = SessionState::OfferReady;
        Ok(())
    }

    /// OPTIONS preflight, then apply any `rel="ice-server"` links
    ///
    /// A 200 or 204 answer succeeds even without a `Link` header. Any other
    /// status fails with `UnexpectedStatus` and nothing is applied.
    #[instrument(skip(self))]
    pub async fn discover_ice_servers(&self) -> Result<AppliedIceServers> {
        let (endpoint, token) = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;
            let endpoint = inner.config.endpoint_url()?;
            inner.state = SessionState::OptionsPending;
            (endpoint, inner.config.auth_token.clone())
        };

        let request = HttpRequest::options(endpoint.as_str()).with_bearer_token(token.as_deref());
        let (generation, response) = match self.exchange(request).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                self.settle();
                return Err(e);
            }
        };
        self.settle();

        debug!("OPTIONS {} returned {}", endpoint, response.status);
        if !matches!(response.status, 200 | 204) {
            error!(
                "Could not discover ICE servers, OPTIONS {} returned {}",
                endpoint, response.status
            );
            return Err(Error::UnexpectedStatus(response.status));
        }

        let Some(link) = response.header_all("link") else {
            debug!("No Link header in OPTIONS response");
            return Ok(AppliedIceServers::default());
        };

        let servers = link_header::parse(&link);
        if servers.is_empty() {
            let err = Error::MalformedLinkHeader(format!("no usable ice-server entry in '{}'", link));
            warn!("{}", err);
            return Ok(AppliedIceServers::default());
        }

        self.check_generation(generation)?;
        Ok(apply_ice_servers(&servers, self.peer.as_ref()).await)
    }

    /// POST the offer and take the answer and resource URL from a 201 reply
    ///
    /// Refuses to run while another POST is in flight and refuses to
    /// overwrite the resource URL of a live negotiation.
    #[instrument(skip(self, offer))]
    pub async fn send_offer(&self, offer: &SdpOffer) -> Result<WhipAnswer> {
        let (endpoint, token) = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;
            if inner.state == SessionState::Posting {
                return Err(Error::InProgress);
            }
            if let Some(existing) = &inner.resource_url {
                return Err(Error::ResourceExists(existing.clone()));
            }
            let endpoint = inner.config.endpoint_url()?;
            inner.posting_started = true;
            inner.state = SessionState::Posting;
            (endpoint, inner.config.auth_token.clone())
        };

        let request = HttpRequest::post_sdp(endpoint.as_str(), offer.as_text())
            .with_bearer_token(token.as_deref());
        let (generation, response) = match self.exchange_unchecked(request).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                self.settle();
                return Err(e);
            }
        };

        if response.status != 201 {
            self.settle();
            self.check_generation(generation)?;
            error!("POST {} returned {}", endpoint, response.status);
            return Err(Error::UnexpectedStatus(response.status));
        }

        let resource_url = match response.header("location") {
            Some(location) => match resolve_location(&endpoint, location) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("{}, teardown will not DELETE", e);
                    None
                }
            },
            None => {
                warn!("201 response carried no Location header, teardown will not DELETE");
                None
            }
        };

        let rejected = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::TornDown || inner.generation != generation {
                Some(Error::TornDown)
            } else if let Some(existing) = &inner.resource_url {
                Some(Error::ResourceExists(existing.clone()))
            } else {
                inner.resource_url = resource_url.clone();
                inner.state = SessionState::Negotiated;
                None
            }
        };

        if let Some(e) = rejected {
            self.settle();
            if let Some(url) = &resource_url {
                self.delete_unclaimed(url, token.as_deref()).await;
            }
            return Err(e);
        }

        if let Some(url) = &resource_url {
            info!("WHIP resource created at {}", url);
        }

        Ok(WhipAnswer {
            sdp: response.body,
            resource_url,
        })
    }

    /// DELETE the current resource so a new offer can be POSTed
    ///
    /// Returns the DELETE status, or `None` when there was nothing to release.
    #[instrument(skip(self))]
    pub async fn release_resource(&self) -> Result<Option<u16>> {
        let (resource_url, token) = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;
            let Some(resource_url) = inner.resource_url.take() else {
                return Ok(None);
            };
            inner.state = SessionState::Idle;
            (resource_url, inner.config.auth_token.clone())
        };

        let request = HttpRequest::delete(&resource_url).with_bearer_token(token.as_deref());
        let (_, response) = self.exchange(request).await?;
        debug!("DELETE {} returned {}", resource_url, response.status);
        Ok(Some(response.status))
    }

    /// End the session
    ///
    /// Aborts in-flight exchanges, then sends one best-effort DELETE to the
    /// resource URL. Later calls do nothing and return `None`.
    #[instrument(skip(self))]
    pub async fn teardown(&self) -> Option<u16> {
        let (resource_url, token) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::TornDown {
                return None;
            }
            inner.state = SessionState::TornDown;
            inner.generation += 1;
            for (_, canceller) in inner.cancellers.drain(..) {
                canceller.abort();
            }
            (inner.resource_url.take(), inner.config.auth_token.clone())
        };

        let Some(resource_url) = resource_url else {
            debug!("Session torn down without a resource");
            return None;
        };

        let request = HttpRequest::delete(&resource_url).with_bearer_token(token.as_deref());
        match self.http.execute(request).await {
            Ok(response) => {
                info!("DELETE {} returned {}", resource_url, response.status);
                Some(response.status)
            }
            Err(e) => {
                warn!("DELETE {} failed: {}", resource_url, e);
                None
            }
        }
    }

    /// Run one abortable HTTP exchange
    ///
    /// Returns the generation the request was issued under. A response that
    /// lands after `teardown()` is discarded.
    async fn exchange(&self, request: HttpRequest) -> Result<(u64, HttpResponse)> {
        let (generation, response) = self.exchange_unchecked(request).await?;
        if self.generation() != generation {
            debug!("Discarding response for torn down session");
            return Err(Error::TornDown);
        }
        Ok((generation, response))
    }

    /// Same as [`exchange`](Self::exchange), but a response is returned even
    /// if the session was torn down meanwhile
    ///
    /// For replies that create server-side state the caller must clean up.
    async fn exchange_unchecked(&self, request: HttpRequest) -> Result<(u64, HttpResponse)> {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let (id, generation) = {
            let mut inner = self.inner.lock();
            inner.ensure_live()?;
            let id = inner.next_request;
            inner.next_request += 1;
            inner.cancellers.push((id, abort_handle));
            (id, inner.generation)
        };

        debug!("{} {}", request.method, request.url);
        let result = Abortable::new(self.http.execute(request), abort_registration).await;

        let current = {
            let mut inner = self.inner.lock();
            inner.cancellers.retain(|(other, _)| *other != id);
            inner.generation
        };

        match result {
            Ok(Ok(response)) => Ok((generation, response)),
            _ if current != generation => {
                debug!("Discarding failed exchange for torn down session");
                Err(Error::TornDown)
            }
            Ok(Err(e)) => Err(e),
            Err(_aborted) => Err(Error::Cancelled),
        }
    }

    /// Best-effort DELETE of a resource the session did not keep
    async fn delete_unclaimed(&self, resource_url: &str, token: Option<&str>) {
        let request = HttpRequest::delete(resource_url).with_bearer_token(token);
        match self.http.execute(request).await {
            Ok(response) => info!(
                "DELETE {} (resource not kept) returned {}",
                resource_url, response.status
            ),
            Err(e) => warn!("DELETE {} (resource not kept) failed: {}", resource_url, e),
        }
    }

    fn settle(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::TornDown {
            let settled = inner.settled_state();
            inner.state = settled;
        }
    }
}

impl fmt::Debug for WhipSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WhipSession")
            .field("endpoint", &inner.config.whip_endpoint)
            .field("state", &inner.state)
            .field("resource_url", &inner.resource_url)
            .field("generation", &inner.generation)
            .finish()
    }
}

/// Resolve a `Location` header value against the endpoint
///
/// Root-relative paths take the endpoint's scheme and authority; absolute
/// URLs are kept as they are.
pub fn resolve_location(endpoint: &Url, location: &str) -> Result<String> {
    let resolved = endpoint.join(location.trim()).map_err(|e| {
        Error::InvalidUrl(format!(
            "Location '{}' could not be resolved against {}: {}",
            location, endpoint, e
        ))
    })?;
    Ok(resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Url {
        Url::parse("http://localhost:7080/whip/endpoint/abc123").unwrap()
    }

    #[test]
    fn test_root_relative_location() {
        assert_eq!(
            resolve_location(&endpoint(), "/resource/abc").unwrap(),
            "http://localhost:7080/resource/abc"
        );
    }

    #[test]
    fn test_absolute_location_kept() {
        assert_eq!(
            resolve_location(&endpoint(), "https://media.example.com/whip/resource/1").unwrap(),
            "https://media.example.com/whip/resource/1"
        );
    }

    #[test]
    fn test_path_relative_location() {
        assert_eq!(
            resolve_location(&endpoint(), "abc123/session").unwrap(),
            "http://localhost:7080/whip/endpoint/abc123/session"
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::OptionsPending.to_string(), "options-pending");
        assert_eq!(SessionState::TornDown.to_string(), "torn-down");
    }
}
