//! The client state machine.
//!
//! [`OtaClient::handle`] is the only entry point. It matches the incoming
//! event against the current phase, lets the owning engine react, and then
//! applies the resulting [`Transition`]. Entering a phase refills that
//! phase's retry budget and issues its first request; a retry re-issues the
//! request without refilling.
//!
//! At most one network request or storage operation is outstanding, and at
//! most one timer is armed. Responses and completions that no longer match
//! what the client waits for are discarded.

use std::mem;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::{debug, info, trace, warn};

use crate::adapters::{Adapters, StorageCompletion, StorageOutcome, StorageTicket, TimerToken};
use crate::address::ShortAddress;
use crate::config::ClientConfig;
use crate::discovery;
use crate::error::{OtaError, OtaResult};
use crate::event::{AbortReason, ClientEvent, ClientNotification, NotificationCallback};
use crate::finalize;
use crate::negotiation;
use crate::phase::ClientPhase;
use crate::protocol::{Destination, Request, Response};
use crate::retry::RetryKind;
use crate::session::{ArmedTimer, Pending, Session, StorageRequest, TimerPurpose};
use crate::transfer;

/// What the machine does after an engine has reacted to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Remain in the current phase.
    Stay,
    /// Enter a phase.
    Enter(ClientPhase),
    /// Wait for the next discovery window, opening after the given delay.
    Window(Duration),
}

/// Everything an engine may touch while handling one event.
pub(crate) struct Ctx<'a> {
    pub(crate) config: &'a ClientConfig,
    pub(crate) session: &'a mut Session,
    pub(crate) adapters: &'a mut Adapters,
    pub(crate) rng: &'a mut SmallRng,
    outbox: &'a mut Vec<ClientNotification>,
}

impl Ctx<'_> {
    /// Send a request and wait for its response for `timeout`.
    ///
    /// A send the stack refuses is treated like a request that was never
    /// answered: the timeout still runs and charges the retry budget.
    pub(crate) fn request(&mut self, destination: Destination, request: Request, timeout: Duration) {
        trace!(request = request.name(), ?destination, "Sending request");
        if let Err(e) = self.transmit(destination, request) {
            debug!("Send failed, awaiting timeout: {e}");
        }
        self.session.pending = Pending::Response;
        self.arm(TimerPurpose::ResponseTimeout, timeout);
    }

    /// Send a request nobody waits for.
    pub(crate) fn post(&mut self, destination: Destination, request: Request) {
        trace!(request = request.name(), ?destination, "Posting request");
        if let Err(e) = self.transmit(destination, request) {
            debug!("Unacknowledged send failed: {e}");
        }
    }

    fn transmit(&mut self, destination: Destination, request: Request) -> OtaResult<()> {
        self.adapters
            .transport
            .send(destination, request)
            .map_err(OtaError::from)
    }

    /// Start a storage operation with a fresh busy-poll budget.
    pub(crate) fn storage(&mut self, request: StorageRequest) {
        self.session.retries.get_mut(RetryKind::Flash).reset();
        let ticket = self.session.take_ticket();
        trace!(op = %request.op(), ?ticket, "Starting storage operation");
        issue_storage(self.adapters, ticket, &request);
        self.session.pending = Pending::Storage { ticket, request };
    }

    /// Issue the pending storage operation again under a new ticket.
    fn reissue_storage(&mut self) {
        let ticket = self.session.take_ticket();
        if let Pending::Storage {
            ticket: pending,
            request,
        } = &mut self.session.pending
        {
            *pending = ticket;
            issue_storage(self.adapters, ticket, request);
        }
    }

    /// Arm the client's timer, replacing any armed one.
    pub(crate) fn arm(&mut self, purpose: TimerPurpose, after: Duration) {
        self.disarm();
        let token = self.session.take_token();
        self.adapters.timer.arm(token, after);
        self.session.timer = Some(ArmedTimer { token, purpose });
    }

    /// Cancel the armed timer, if any.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.session.timer.take() {
            self.adapters.timer.disarm(timer.token);
        }
    }

    /// Stop waiting for a response.
    pub(crate) fn settle(&mut self) {
        self.disarm();
        self.session.pending = Pending::Idle;
    }

    /// Queue a notification for the application.
    pub(crate) fn notify(&mut self, notification: ClientNotification) {
        self.outbox.push(notification);
    }

    /// Persist the current download position, if a download is running.
    pub(crate) fn save_checkpoint(&mut self) {
        let Some(checkpoint) = self.session.checkpoint() else {
            return;
        };
        match self.adapters.recovery.save_checkpoint(&checkpoint) {
            Ok(()) => {
                debug!(offset = checkpoint.offset, "Checkpoint saved");
                self.session.resume_hint = Some(checkpoint);
                if let Some(progress) = self.session.progress.as_mut() {
                    progress.mark_checkpointed();
                }
            }
            Err(e) => warn!("Failed to save checkpoint: {e}"),
        }
    }

    /// Remove the persisted download position.
    pub(crate) fn clear_checkpoint(&mut self) {
        self.session.resume_hint = None;
        if let Err(e) = self.adapters.recovery.clear_checkpoint() {
            warn!("Failed to clear checkpoint: {e}");
        }
    }
}

fn issue_storage(adapters: &mut Adapters, ticket: StorageTicket, request: &StorageRequest) {
    let storage = &mut adapters.storage;
    match request {
        StorageRequest::Init => storage.init(ticket),
        StorageRequest::Erase { slot, len } => storage.erase_slot(ticket, *slot, *len),
        StorageRequest::Write {
            slot,
            offset,
            bytes,
        } => storage.write_chunk(ticket, *slot, *offset, bytes),
        StorageRequest::Checksum { slot, len } => storage.checksum(ticket, *slot, *len),
        StorageRequest::Verify {
            slot,
            len,
            expected,
        } => storage.verify_checksum(ticket, *slot, *len, *expected),
        StorageRequest::Switch { from, to } => storage.switch_active(ticket, *from, *to),
    }
}

/// The OTA client engine.
///
/// ```text
/// Stopped ─start─▶ InitializingStorage ─ready─▶ AwaitingDiscoveryWindow ◀──────────┐
///                                                 │ window                          │
///                        ┌────────────────────────┴──────────┐                      │
///                        ▼                                   ▼                      │
///               BroadcastingLocate                   ResolvingAddress               │
///                        │                                   │                      │
///                        ▼                                   │                      │
///               ResolvingIdentity ──▶ ResolvingEndpoint ◀────┘                      │
///                                           │                                       │
///                                           ▼                                       │
///                                   EstablishingKey ──▶ Negotiating                 │
///                                                           │ offer                 │
///                                                           ▼                       │
///                        TransferringBlocks | TransferringPages ⇄ BackfillingGaps   │
///                                                           │                       │
///                                                           ▼                       │
///                                                       Finalizing ─────────────────┘
/// ```
pub struct OtaClient {
    config: ClientConfig,
    phase: ClientPhase,
    session: Session,
    adapters: Adapters,
    rng: SmallRng,
    callback: Option<NotificationCallback>,
}

impl std::fmt::Debug for OtaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaClient")
            .field("phase", &self.phase)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl OtaClient {
    /// Build a stopped client over `adapters`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ClientConfig, adapters: Adapters) -> OtaResult<Self> {
        config.validate()?;
        Ok(Self {
            session: Session::new(&config),
            rng: SmallRng::seed_from_u64(config.rng_seed),
            config,
            phase: ClientPhase::Stopped,
            adapters,
            callback: None,
        })
    }

    /// Register the callback receiving notifications.
    pub fn on_notification(&mut self, callback: impl FnMut(&ClientNotification) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Session state, for inspection.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Configuration the client runs with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handle one event.
    ///
    /// Never fails: every problem is absorbed into retries and fallbacks and
    /// reported through the notification callback.
    pub fn handle(&mut self, event: ClientEvent) {
        let mut outbox = Vec::new();
        let mut ctx = Ctx {
            config: &self.config,
            session: &mut self.session,
            adapters: &mut self.adapters,
            rng: &mut self.rng,
            outbox: &mut outbox,
        };
        dispatch(&mut self.phase, &mut ctx, event);

        if let Some(callback) = self.callback.as_mut() {
            for notification in &outbox {
                callback(notification);
            }
        }
    }
}

fn dispatch(phase: &mut ClientPhase, ctx: &mut Ctx<'_>, event: ClientEvent) {
    let current = *phase;
    let transition = match event {
        ClientEvent::Start => start(current, ctx),
        ClientEvent::Stop => stop(current, ctx),
        ClientEvent::Response { source, response } => on_response(current, ctx, source, response),
        ClientEvent::ImageNotify {
            source,
            endpoint,
            notify,
        } => discovery::on_image_notify(current, ctx, source, endpoint, notify),
        ClientEvent::TimerFired(token) => on_timer(current, ctx, token),
        ClientEvent::StorageDone(completion) => on_storage(current, ctx, completion),
    };
    apply(phase, ctx, transition);
}

fn apply(phase: &mut ClientPhase, ctx: &mut Ctx<'_>, mut transition: Transition) {
    loop {
        let mut next = match transition {
            Transition::Stay => return,
            Transition::Enter(next) => next,
            Transition::Window(after) => {
                ctx.session.next_window = after;
                ClientPhase::AwaitingDiscoveryWindow
            }
        };

        // An announced server takes over once the current discovery step is done.
        if phase.is_discovery() && redirectable(next) && ctx.session.registry.has_priority() {
            ctx.session.registry.requeue_active();
            ctx.session.known_target = None;
            if let Some(candidate) = ctx.session.registry.promote_next() {
                info!(address = %candidate.short_address, "Switching to announced server");
            }
            next = ClientPhase::ResolvingIdentity;
        }

        debug!(from = %phase, to = %next, "Phase transition");
        *phase = next;
        transition = enter(next, ctx);
    }
}

fn redirectable(next: ClientPhase) -> bool {
    next.is_discovery()
        || matches!(
            next,
            ClientPhase::Negotiating | ClientPhase::AwaitingDiscoveryWindow
        )
}

fn enter(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    if let Some(kind) = budget_of(phase) {
        ctx.session.retries.get_mut(kind).reset();
    }
    match phase {
        ClientPhase::Stopped => Transition::Stay,
        ClientPhase::InitializingStorage => {
            ctx.storage(StorageRequest::Init);
            Transition::Stay
        }
        ClientPhase::AwaitingDiscoveryWindow => {
            ctx.session.end_cycle();
            let after = mem::replace(&mut ctx.session.next_window, ctx.config.discovery_period);
            debug!(?after, "Next discovery window scheduled");
            ctx.arm(TimerPurpose::DiscoveryWindow, after);
            Transition::Stay
        }
        ClientPhase::Finalizing => finalize::begin(ctx),
        _ => issue(phase, ctx),
    }
}

/// Send (or re-send) the request the phase waits on.
pub(crate) fn issue(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    match phase {
        ClientPhase::BroadcastingLocate => discovery::broadcast_locate(ctx),
        ClientPhase::ResolvingAddress => discovery::request_address(ctx),
        ClientPhase::ResolvingIdentity => discovery::request_identity(ctx),
        ClientPhase::ResolvingEndpoint => discovery::request_endpoint(ctx),
        ClientPhase::EstablishingKey => discovery::request_key(ctx),
        ClientPhase::Negotiating => negotiation::query(ctx),
        ClientPhase::TransferringBlocks => transfer::request_block(ctx),
        ClientPhase::TransferringPages => transfer::request_page(ctx),
        ClientPhase::BackfillingGaps => transfer::request_gap(ctx),
        ClientPhase::Finalizing => finalize::issue(ctx),
        ClientPhase::Stopped
        | ClientPhase::InitializingStorage
        | ClientPhase::AwaitingDiscoveryWindow => Transition::Stay,
    }
}

fn budget_of(phase: ClientPhase) -> Option<RetryKind> {
    match phase {
        ClientPhase::ResolvingAddress | ClientPhase::ResolvingIdentity => Some(RetryKind::Address),
        ClientPhase::ResolvingEndpoint => Some(RetryKind::Endpoint),
        ClientPhase::EstablishingKey => Some(RetryKind::Key),
        ClientPhase::Negotiating
        | ClientPhase::TransferringBlocks
        | ClientPhase::TransferringPages
        | ClientPhase::BackfillingGaps
        | ClientPhase::Finalizing => Some(RetryKind::Request),
        ClientPhase::Stopped
        | ClientPhase::InitializingStorage
        | ClientPhase::AwaitingDiscoveryWindow
        | ClientPhase::BroadcastingLocate => None,
    }
}

/// Charge one failure to the phase's budget, then re-send or give up.
pub(crate) fn retry(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    let Some(kind) = budget_of(phase) else {
        return Transition::Stay;
    };
    ctx.settle();
    if ctx.session.retries.get_mut(kind).record_failure() {
        warn!(%phase, "Retries exhausted");
        exhausted(phase, ctx)
    } else {
        debug!(
            %phase,
            remaining = ctx.session.retries.get(kind).remaining(),
            "Retrying"
        );
        issue(phase, ctx)
    }
}

fn exhausted(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    match phase {
        ClientPhase::ResolvingAddress => discovery::address_exhausted(ctx),
        ClientPhase::ResolvingIdentity | ClientPhase::ResolvingEndpoint => {
            discovery::drop_candidate(ctx)
        }
        ClientPhase::EstablishingKey => discovery::key_exhausted(ctx),
        ClientPhase::Negotiating => negotiation::exhausted(ctx),
        ClientPhase::TransferringBlocks
        | ClientPhase::TransferringPages
        | ClientPhase::BackfillingGaps => transfer::abort(ctx, AbortReason::ServerUnreachable),
        ClientPhase::Finalizing => finalize::exhausted(ctx),
        ClientPhase::Stopped
        | ClientPhase::InitializingStorage
        | ClientPhase::AwaitingDiscoveryWindow
        | ClientPhase::BroadcastingLocate => Transition::Stay,
    }
}

fn start(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    if phase != ClientPhase::Stopped {
        debug!(%phase, "Start ignored, already running");
        return Transition::Stay;
    }
    info!("OTA client starting");
    ctx.session.resume_hint = match ctx.adapters.recovery.load_checkpoint() {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!("Discarding unreadable checkpoint: {e}");
            ctx.clear_checkpoint();
            None
        }
    };
    if let Some(checkpoint) = ctx.session.resume_hint {
        info!(
            offset = checkpoint.offset,
            image = %checkpoint.image,
            "Found download checkpoint"
        );
        if ctx.adapters.settings.known_server().is_none() {
            ctx.adapters
                .settings
                .store_known_server(Some(checkpoint.server.into()));
        }
    }
    ctx.session.next_window = ctx.config.startup_delay;
    Transition::Enter(ClientPhase::InitializingStorage)
}

fn stop(phase: ClientPhase, ctx: &mut Ctx<'_>) -> Transition {
    if phase == ClientPhase::Stopped {
        return Transition::Stay;
    }
    if phase == ClientPhase::Finalizing {
        finalize::interrupt(ctx);
    } else if phase.is_download() {
        ctx.save_checkpoint();
    }
    ctx.settle();
    ctx.session.end_cycle();
    ctx.session.registry.clear();
    info!(%phase, "OTA client stopped");
    ctx.notify(ClientNotification::Stopped);
    Transition::Enter(ClientPhase::Stopped)
}

fn on_response(
    phase: ClientPhase,
    ctx: &mut Ctx<'_>,
    source: ShortAddress,
    response: Response,
) -> Transition {
    if !ctx.session.awaiting_response() {
        debug!(%phase, %source, "Discarding unexpected response");
        return Transition::Stay;
    }
    match phase {
        ClientPhase::BroadcastingLocate => discovery::on_locate_response(ctx, response),
        ClientPhase::ResolvingAddress => discovery::on_address_response(ctx, response),
        ClientPhase::ResolvingIdentity => discovery::on_identity_response(ctx, response),
        ClientPhase::ResolvingEndpoint => discovery::on_endpoint_response(ctx, response),
        ClientPhase::EstablishingKey => discovery::on_key_response(ctx, response),
        ClientPhase::Negotiating => negotiation::on_response(ctx, source, response),
        ClientPhase::TransferringBlocks
        | ClientPhase::TransferringPages
        | ClientPhase::BackfillingGaps => transfer::on_response(phase, ctx, source, response),
        ClientPhase::Finalizing => finalize::on_response(ctx, source, response),
        ClientPhase::Stopped
        | ClientPhase::InitializingStorage
        | ClientPhase::AwaitingDiscoveryWindow => Transition::Stay,
    }
}

fn on_timer(phase: ClientPhase, ctx: &mut Ctx<'_>, token: TimerToken) -> Transition {
    let Some(timer) = ctx.session.timer.filter(|t| t.token == token) else {
        trace!(?token, "Ignoring stale timer");
        return Transition::Stay;
    };
    ctx.session.timer = None;

    match timer.purpose {
        TimerPurpose::DiscoveryWindow => discovery::on_window(ctx),
        TimerPurpose::ResponseTimeout => match phase {
            ClientPhase::BroadcastingLocate => discovery::on_search_complete(ctx),
            ClientPhase::TransferringPages => transfer::on_page_timeout(ctx),
            _ => {
                debug!(%phase, "Response timeout");
                retry(phase, ctx)
            }
        },
        TimerPurpose::StorageBusy => {
            ctx.reissue_storage();
            Transition::Stay
        }
        TimerPurpose::PeerDeferral => issue(phase, ctx),
    }
}

fn on_storage(phase: ClientPhase, ctx: &mut Ctx<'_>, completion: StorageCompletion) -> Transition {
    let current = match &ctx.session.pending {
        Pending::Storage { ticket, .. } => Some(*ticket),
        _ => None,
    };
    if current != Some(completion.ticket) {
        debug!(ticket = ?completion.ticket, "Discarding stale storage completion");
        return Transition::Stay;
    }

    let mut outcome = completion.outcome;
    if outcome == StorageOutcome::Busy {
        if !ctx.session.retries.get_mut(RetryKind::Flash).record_failure() {
            trace!("Storage busy, polling again");
            ctx.arm(TimerPurpose::StorageBusy, ctx.config.busy_poll_interval);
            return Transition::Stay;
        }
        warn!("Storage stayed busy, giving up on operation");
        outcome = StorageOutcome::Failed;
    }

    let Pending::Storage { request, .. } = mem::take(&mut ctx.session.pending) else {
        return Transition::Stay;
    };
    if outcome == StorageOutcome::Failed {
        warn!(op = %request.op(), %phase, "Storage operation failed");
    }

    match phase {
        ClientPhase::InitializingStorage => on_storage_ready(ctx, outcome),
        ClientPhase::Negotiating => negotiation::on_storage(ctx, request, outcome),
        ClientPhase::TransferringBlocks
        | ClientPhase::TransferringPages
        | ClientPhase::BackfillingGaps => transfer::on_storage(phase, ctx, request, outcome),
        ClientPhase::Finalizing => finalize::on_storage(ctx, request, outcome),
        _ => Transition::Stay,
    }
}

fn on_storage_ready(ctx: &mut Ctx<'_>, outcome: StorageOutcome) -> Transition {
    if outcome == StorageOutcome::Failed {
        warn!("Storage initialization failed");
        ctx.notify(ClientNotification::HardwareFault);
        return Transition::Enter(ClientPhase::Stopped);
    }
    info!(active = %ctx.adapters.storage.active_slot(), "Storage ready");
    if ctx.session.registry.has_priority() {
        ctx.session.registry.begin_cycle();
        ctx.session.registry.promote_next();
        return Transition::Enter(ClientPhase::ResolvingIdentity);
    }
    Transition::Window(ctx.config.startup_delay)
}
