//! Test doubles for the WHIP integration tests
//!
//! - `MockHttpClient` records every request and replays scripted replies per
//!   HTTP method.
//! - `MockPeer` records calls made on the peer connection and lets a test fire
//!   negotiation-needed.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use whipsink::{
    BundlePolicy, Error, HttpClient, HttpRequest, HttpResponse, MediaKind, MediaPad, Method,
    NegotiationNeededHandler, PeerConnection, Result, SdpAnswer, SdpOffer, SessionDescription,
};

pub const ENDPOINT: &str = "http://localhost:7080/whip/endpoint/abc123";

pub const OFFER: &str = "v=0\r\n\
    o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=sendonly\r\n\
    a=rtpmap:111 opus/48000/2\r\n";

pub const ANSWER: &str = "v=0\r\n\
    o=- 1657793490019 1 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=mid:0\r\n\
    a=recvonly\r\n\
    a=rtpmap:111 opus/48000/2\r\n";

/// Install a test subscriber once, honouring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 201 Created carrying the standard answer
pub fn created(location: &str) -> HttpResponse {
    HttpResponse::new(201)
        .with_header("Content-Type", "application/sdp")
        .with_header("Location", location)
        .with_body(ANSWER)
}

/// Scripted reply
pub enum Reply {
    Respond(HttpResponse),
    /// Transport failure
    Fail(String),
    /// Never completes
    Hang,
    /// Completes once the gate is notified
    Gated(Arc<Notify>, HttpResponse),
    /// Runs the hook while the request is in flight, then answers
    Then(HttpResponse, Box<dyn FnOnce() + Send>),
}

/// Recording HTTP client with per-method reply queues
///
/// An empty queue answers OPTIONS with 204, POST with 500 and DELETE with 200.
#[derive(Default)]
pub struct MockHttpClient {
    replies: Mutex<HashMap<Method, VecDeque<Reply>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, method: Method, reply: Reply) {
        self.replies
            .lock()
            .entry(method)
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, method: Method, response: HttpResponse) {
        self.push(method, Reply::Respond(response));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, method: Method) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.method == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests_for(method).len()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.requests.lock().iter().map(|request| request.method).collect()
    }

    /// Wait until at least `count` requests of `method` were issued
    pub async fn wait_for(&self, method: Method, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(method) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} {} request(s)", count, method));
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = request.method;
        self.requests.lock().push(request);

        let reply = self
            .replies
            .lock()
            .get_mut(&method)
            .and_then(|queue| queue.pop_front());

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(message)) => Err(Error::Transport(message)),
            Some(Reply::Hang) => futures::future::pending().await,
            Some(Reply::Gated(gate, response)) => {
                gate.notified().await;
                Ok(response)
            }
            Some(Reply::Then(response, hook)) => {
                hook();
                Ok(response)
            }
            None => Ok(match method {
                Method::Options => HttpResponse::new(204),
                Method::Post => HttpResponse::new(500),
                Method::Delete => HttpResponse::new(200),
            }),
        }
    }
}

/// Recording peer connection
pub struct MockPeer {
    calls: Mutex<Vec<String>>,
    stun_server: Mutex<Option<String>>,
    turn_servers: Mutex<Vec<String>>,
    local_description: Mutex<Option<SdpOffer>>,
    remote_description: Mutex<Option<SdpAnswer>>,
    reject_turn: AtomicBool,
    handler: Mutex<Option<NegotiationNeededHandler>>,
    next_pad: AtomicU32,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            stun_server: Mutex::new(None),
            turn_servers: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            reject_turn: AtomicBool::new(false),
            handler: Mutex::new(None),
            next_pad: AtomicU32::new(0),
        })
    }

    /// Make `add_turn_server` report rejection
    pub fn reject_turn_servers(&self) {
        self.reject_turn.store(true, Ordering::SeqCst);
    }

    /// Invoke the registered negotiation-needed handler
    pub fn fire_negotiation_needed(&self) {
        let handler = self.handler.lock();
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Position of the first call starting with `prefix`
    pub fn call_index(&self, prefix: &str) -> Option<usize> {
        self.calls.lock().iter().position(|call| call.starts_with(prefix))
    }

    pub fn stun_server(&self) -> Option<String> {
        self.stun_server.lock().clone()
    }

    pub fn turn_servers(&self) -> Vec<String> {
        self.turn_servers.lock().clone()
    }

    pub fn local_description(&self) -> Option<SdpOffer> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SdpAnswer> {
        self.remote_description.lock().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<SdpOffer> {
        self.record("create_offer".to_string());
        SessionDescription::offer(OFFER)
    }

    async fn set_local_description(&self, offer: &SdpOffer) -> Result<()> {
        self.record("set_local_description".to_string());
        *self.local_description.lock() = Some(offer.clone());
        Ok(())
    }

    async fn set_remote_description(&self, answer: &SdpAnswer) -> Result<()> {
        self.record("set_remote_description".to_string());
        *self.remote_description.lock() = Some(answer.clone());
        Ok(())
    }

    async fn set_stun_server(&self, url: &str) -> Result<()> {
        self.record(format!("set_stun_server:{}", url));
        *self.stun_server.lock() = Some(url.to_string());
        Ok(())
    }

    async fn set_turn_server(&self, url: &str) -> Result<()> {
        self.record(format!("set_turn_server:{}", url));
        Ok(())
    }

    async fn add_turn_server(&self, url: &str) -> bool {
        self.record(format!("add_turn_server:{}", url));
        if self.reject_turn.load(Ordering::SeqCst) {
            return false;
        }
        self.turn_servers.lock().push(url.to_string());
        true
    }

    async fn set_bundle_policy(&self, policy: BundlePolicy) -> Result<()> {
        self.record(format!("set_bundle_policy:{}", policy));
        Ok(())
    }

    async fn request_pad(&self, kind: MediaKind) -> Result<MediaPad> {
        self.record(format!("request_pad:{}", kind));
        Ok(MediaPad::new(self.next_pad.fetch_add(1, Ordering::SeqCst), kind))
    }

    async fn release_pad(&self, pad: &MediaPad) -> Result<()> {
        self.record(format!("release_pad:{}", pad.name()));
        Ok(())
    }

    fn on_negotiation_needed(&self, handler: NegotiationNeededHandler) {
        *self.handler.lock() = Some(handler);
    }
}
