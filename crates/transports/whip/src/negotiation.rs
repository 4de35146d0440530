//! Negotiation cycle: offer, POST, answer
//!
//! One cycle per negotiation-needed trigger, strictly ordered:
//! OPTIONS (optional) -> create offer -> set local -> POST -> set remote.
//! Cycles never overlap. A trigger that arrives while a cycle runs is dropped.

use crate::config::NegotiationMode;
use crate::peer::PeerConnection;
use crate::sdp::SdpAnswer;
use crate::session::WhipSession;
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Runs negotiation cycles in the configured mode
#[derive(Debug, Clone)]
pub struct Dispatcher {
    mode: NegotiationMode,
    runtime: Handle,
}

impl Dispatcher {
    pub fn new(mode: NegotiationMode, runtime: Handle) -> Self {
        Self { mode, runtime }
    }

    /// Dispatcher bound to the runtime of the calling task
    pub fn current(mode: NegotiationMode) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidConfig(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::new(mode, runtime))
    }

    pub fn mode(&self) -> NegotiationMode {
        self.mode
    }

    /// Run a cycle
    ///
    /// `Callback` spawns it and returns at once. `Blocking` drives it to
    /// completion on the calling thread, which must not be a runtime worker;
    /// network I/O then relies on the workers of a multi-thread runtime.
    pub fn run<F>(&self, cycle: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.mode {
            NegotiationMode::Callback => {
                self.runtime.spawn(cycle);
            }
            NegotiationMode::Blocking => {
                let _guard = self.runtime.enter();
                futures::executor::block_on(cycle);
            }
        }
    }
}

/// Summary of finished cycles, published after each one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Cycles that ran to the end, successfully or not
    pub completed: u64,
    /// Error of the most recent cycle, `None` if it succeeded
    pub last_error: Option<String>,
}

/// Clears the in-progress flag when a cycle ends, however it ends
struct CycleGuard(Arc<AtomicBool>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives the WHIP exchange whenever the peer connection needs negotiation
pub struct NegotiationOrchestrator {
    session: Arc<WhipSession>,
    peer: Arc<dyn PeerConnection>,
    dispatcher: Dispatcher,
    in_progress: Arc<AtomicBool>,
    report: watch::Sender<CycleReport>,
}

impl NegotiationOrchestrator {
    pub fn new(
        session: Arc<WhipSession>,
        peer: Arc<dyn PeerConnection>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (report, _) = watch::channel(CycleReport::default());
        Self {
            session,
            peer,
            dispatcher,
            in_progress: Arc::new(AtomicBool::new(false)),
            report,
        }
    }

    pub fn session(&self) -> &Arc<WhipSession> {
        &self.session
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Watch finished cycles
    pub fn subscribe(&self) -> watch::Receiver<CycleReport> {
        self.report.subscribe()
    }

    /// Handle a negotiation-needed signal
    ///
    /// Returns false if the trigger was dropped because a cycle is already
    /// running or the session is torn down.
    pub fn on_negotiation_needed(self: &Arc<Self>) -> bool {
        if self.session.is_torn_down() {
            debug!("Ignoring negotiation-needed on torn down session");
            return false;
        }

        let guard = match self.begin_cycle() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Negotiation already in progress, dropping trigger");
                return false;
            }
        };

        let this = Arc::clone(self);
        self.dispatcher.run(async move {
            let _cycle = guard;
            let result = this.run_cycle().await;
            this.finish_cycle(result.map(|_| ()));
        });

        true
    }

    /// Run one cycle and wait for it
    ///
    /// Fails with `InProgress` if another cycle is running.
    pub async fn negotiate(&self) -> Result<SdpAnswer> {
        let _cycle = self.begin_cycle()?;
        let result = self.run_cycle().await;
        self.finish_cycle(result.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        result
    }

    fn begin_cycle(&self) -> Result<CycleGuard> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::InProgress)?;
        Ok(CycleGuard(Arc::clone(&self.in_progress)))
    }

    fn finish_cycle<E: ToString>(&self, result: std::result::Result<(), E>) {
        let last_error = match result {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        self.report.send_modify(|report| {
            report.completed += 1;
            report.last_error = last_error;
        });
    }

    #[instrument(skip(self))]
    async fn run_cycle(&self) -> Result<SdpAnswer> {
        let generation = self.session.generation();
        self.session.check_generation(generation)?;

        let result = self.exchange(generation).await;
        match &result {
            Ok(_) => {}
            Err(Error::TornDown) | Err(Error::Cancelled) => {
                debug!("Negotiation stopped, session torn down")
            }
            Err(e) => error!("Negotiation failed: {}", e),
        }
        result
    }

    async fn exchange(&self, generation: u64) -> Result<SdpAnswer> {
        if self.session.resource_url().is_some() {
            info!("Renegotiating, releasing the previous WHIP resource first");
            match self.session.release_resource().await {
                Ok(status) => debug!("Previous resource released: {:?}", status),
                Err(e @ (Error::TornDown | Error::Cancelled)) => return Err(e),
                Err(e) => warn!("Could not release previous resource: {}", e),
            }
        }

        if self.session.config().use_link_headers {
            self.session.discover_ice_servers().await?;
        }

        let offer = self.peer.create_offer().await?;
        self.session.check_generation(generation)?;
        debug!("Offer created: {}", offer.origin());

        self.peer.set_local_description(&offer).await?;
        self.session.mark_offer_ready()?;

        let answer = self.session.send_offer(&offer).await?;
        let answer = SdpAnswer::answer(answer.sdp)?;
        self.session.check_generation(generation)?;

        self.peer.set_remote_description(&answer).await?;
        info!(
            "Negotiated with {} media section(s)",
            answer.media().len()
        );

        Ok(answer)
    }
}

impl std::fmt::Debug for NegotiationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationOrchestrator")
            .field("session", &self.session)
            .field("mode", &self.dispatcher.mode())
            .field("in_progress", &self.is_in_progress())
            .finish()
    }
}
