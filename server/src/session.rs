//! One authenticated connection's state machine: the inbound packet queue,
//! the status/thread-class/rate gates every envelope passes through, the
//! logout and idle timers, and the teardown grace machine that lets an
//! in-flight save finish after the socket dies.

use crate::connection::Connection;
use crate::dispatch::DispatchFilter;
use crate::hooks::{BanPrincipal, WorldContext};
use crate::opcode::StatusRequirement;
use crate::rate_limit::{RateDecision, RateLimitPolicy, RateLimiter};
use log::{debug, error, warn};
use shared::{PacketEnvelope, ServerNotice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Upper bound on envelopes dispatched per session per tick. Remainder
/// stays queued so one chatty session cannot starve the others sharing the
/// serial pass.
pub const MAX_PACKETS_PER_TICK: usize = 100;

/// Idle sessions are disconnected once nothing has arrived for this long.
pub const SESSION_IDLE_TIMEOUT_MS: u64 = 60_000;

/// How long a session with a dead socket is retained so an in-flight
/// logout-and-save can finish.
pub const TEARDOWN_GRACE_MS: u64 = 60_000;

/// Bound on the post-logout grace window during which stale in-world
/// packets are tolerated (silently dropped) instead of flagged.
pub const RECENT_LOGOUT_WINDOW_MS: u64 = 20_000;

/// Delay between a logout request and the actual world removal.
pub const LOGOUT_DELAY_MS: u64 = 20_000;

/// Hard cap on undispatched envelopes for one session; producers drop past
/// this point rather than grow without bound.
pub const MAX_QUEUED_PACKETS: usize = 10_000;

/// The session's world entity, while one is bound. `in_world` is owned by
/// the simulation and only read here.
#[derive(Debug, Clone, Copy)]
pub struct PlayerBinding {
    pub entity_id: u64,
    pub in_world: bool,
}

enum LinkState {
    Open,
    Closing { grace_ms: i64 },
}

/// Completion callback delivered from asynchronous DB/query work, applied
/// to the session at the drain point of the serial pass.
pub type SessionCallback = Box<dyn FnOnce(&mut Session) + Send>;

/// Producer handle for the network-decode layer. Cloneable across I/O
/// threads; pushing never blocks and never fails while the session lives,
/// except by dropping once the hard queue cap is hit.
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::UnboundedSender<PacketEnvelope>,
    depth: Arc<AtomicUsize>,
    account_id: u32,
}

impl PacketSink {
    pub fn queue_packet(&self, envelope: PacketEnvelope) {
        if envelope.payload_len() > shared::MAX_PAYLOAD_BYTES {
            warn!(
                "Oversized payload ({} bytes) for opcode {:#06x} from account {}, dropping",
                envelope.payload_len(),
                envelope.opcode,
                self.account_id
            );
            return;
        }
        // Reserve the slot before sending; the consumer decrements only
        // after a successful pop, so the counter never undercounts
        // in-flight envelopes.
        if self.depth.fetch_add(1, Ordering::Relaxed) >= MAX_QUEUED_PACKETS {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            warn!(
                "Inbound queue cap reached for account {}, dropping opcode {:#06x}",
                self.account_id, envelope.opcode
            );
            return;
        }
        if self.tx.send(envelope).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Producer handle for async completion callbacks.
#[derive(Clone)]
pub struct CallbackSink {
    tx: mpsc::UnboundedSender<SessionCallback>,
}

impl CallbackSink {
    pub fn submit(&self, callback: SessionCallback) {
        let _ = self.tx.send(callback);
    }
}

/// Verdict for one popped envelope after the context filter has passed.
enum Gate {
    Dispatch,
    Defer,
    SilentDrop,
    Violation(&'static str),
}

pub struct Session {
    account_id: u32,
    addr: SocketAddr,
    connection: Box<dyn Connection>,
    secondary: Option<Box<dyn Connection>>,

    player: Option<PlayerBinding>,
    loading: bool,
    logging_out: bool,
    recently_logged_out: bool,
    queued: bool,
    capacity_bypass: bool,
    forced_exit: bool,

    inbound_tx: mpsc::UnboundedSender<PacketEnvelope>,
    inbound_rx: mpsc::UnboundedReceiver<PacketEnvelope>,
    queue_depth: Arc<AtomicUsize>,

    callback_tx: mpsc::UnboundedSender<SessionCallback>,
    callback_rx: mpsc::UnboundedReceiver<SessionCallback>,

    rate_limiter: RateLimiter,

    idle_ms: i64,
    logout_ms: Option<i64>,
    recent_logout_ms: i64,
    link: LinkState,
}

impl Session {
    pub fn new(account_id: u32, connection: Box<dyn Connection>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let addr = connection.peer_addr();

        Self {
            account_id,
            addr,
            connection,
            secondary: None,
            player: None,
            loading: false,
            logging_out: false,
            recently_logged_out: false,
            queued: false,
            capacity_bypass: false,
            forced_exit: false,
            inbound_tx,
            inbound_rx,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            callback_tx,
            callback_rx,
            rate_limiter: RateLimiter::new(),
            idle_ms: SESSION_IDLE_TIMEOUT_MS as i64,
            logout_ms: None,
            recent_logout_ms: 0,
            link: LinkState::Open,
        }
    }

    pub fn account_id(&self) -> u32 {
        self.account_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle the network-decode layer uses to push envelopes.
    pub fn packet_sink(&self) -> PacketSink {
        PacketSink {
            tx: self.inbound_tx.clone(),
            depth: Arc::clone(&self.queue_depth),
            account_id: self.account_id,
        }
    }

    /// Handle async DB work uses to deliver completions.
    pub fn callback_sink(&self) -> CallbackSink {
        CallbackSink {
            tx: self.callback_tx.clone(),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub(crate) fn set_queued(&mut self, queued: bool) {
        self.queued = queued;
    }

    pub fn capacity_bypass(&self) -> bool {
        self.capacity_bypass
    }

    /// Grants the privilege to skip the login queue at capacity.
    pub fn set_capacity_bypass(&mut self, bypass: bool) {
        self.capacity_bypass = bypass;
    }

    pub fn player(&self) -> Option<&PlayerBinding> {
        self.player.as_ref()
    }

    pub fn player_in_world(&self) -> bool {
        matches!(self.player, Some(binding) if binding.in_world)
    }

    pub fn recently_logged_out(&self) -> bool {
        self.recently_logged_out
    }

    pub fn is_logging_out(&self) -> bool {
        self.logging_out
    }

    pub fn connection_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Marks a login transaction as started. The entity is bound
    /// immediately but enters the world only once the simulation confirms.
    pub fn begin_login(&mut self, entity_id: u64) {
        if self.player.is_some() {
            warn!(
                "Account {} requested login while already bound",
                self.account_id
            );
            return;
        }
        self.loading = true;
        self.bind_player(entity_id);
    }

    /// Binds the world entity. Must only be called from the scheduler
    /// thread; never concurrent with this session's own dispatch.
    pub fn bind_player(&mut self, entity_id: u64) {
        self.player = Some(PlayerBinding {
            entity_id,
            in_world: false,
        });
        self.recently_logged_out = false;
        self.recent_logout_ms = 0;
    }

    /// Called once the simulation has placed the entity in its region.
    pub fn confirm_world_entry(&mut self) {
        if let Some(binding) = self.player.as_mut() {
            binding.in_world = true;
        }
        self.loading = false;
    }

    pub fn request_logout(&mut self, delay_ms: u64) {
        if self.player.is_none() {
            return;
        }
        self.logging_out = true;
        self.logout_ms = Some(delay_ms as i64);
    }

    pub fn cancel_logout(&mut self) {
        self.logging_out = false;
        self.logout_ms = None;
    }

    /// Skip the teardown grace period on the next serial pass.
    pub fn force_exit(&mut self) {
        self.forced_exit = true;
    }

    /// Attaches the secondary channel delivered through a link token.
    pub fn attach_secondary(&mut self, connection: Box<dyn Connection>) {
        self.secondary = Some(connection);
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn send_notice(&mut self, notice: &ServerNotice) {
        self.connection.send(&notice.encode());
    }

    /// Forcible disconnect (duplicate login, administrative kick). The
    /// session object survives until the registry drops it.
    pub fn kick(&mut self, reason: &str) {
        self.send_notice(&ServerNotice::Disconnected {
            reason: reason.to_string(),
        });
        self.connection.close();
        self.forced_exit = true;
    }

    /// Discards everything still queued. Called when the registry drops the
    /// session; envelopes never outlive their session.
    pub fn dissolve(&mut self) {
        let mut discarded = 0usize;
        while self.inbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        self.queue_depth.store(0, Ordering::Relaxed);
        if discarded > 0 {
            debug!(
                "Discarded {} undispatched packets for account {}",
                discarded, self.account_id
            );
        }
    }

    /// Drives the session once from the calling execution context. Returns
    /// false when the caller should unlink and drop the session; only the
    /// serial pass ever receives false.
    pub fn update(&mut self, delta_ms: u64, filter: &dyn DispatchFilter, ctx: &WorldContext) -> bool {
        self.update_at(delta_ms, filter, ctx, unix_now_seconds())
    }

    /// [`Session::update`] with the wall-clock second supplied by the
    /// caller, for deterministic rate-window behavior in tests.
    pub fn update_at(
        &mut self,
        delta_ms: u64,
        filter: &dyn DispatchFilter,
        ctx: &WorldContext,
        now_second: u64,
    ) -> bool {
        let serial = filter.permits_logout_processing();

        if serial {
            // Drain point for completed async DB work; applied before
            // dispatch so packets racing a login completion find the
            // binding in place.
            self.process_ready_callbacks();

            if self.recently_logged_out {
                self.recent_logout_ms -= delta_ms as i64;
                if self.recent_logout_ms <= 0 {
                    self.recently_logged_out = false;
                }
            }
        }

        self.idle_ms -= delta_ms as i64;
        if serial && !self.queued && self.idle_ms <= 0 && self.connection.is_open() {
            warn!(
                "Account {} idle past timeout, closing connection",
                self.account_id
            );
            self.connection.close();
        }

        self.dispatch_queued(filter, ctx, now_second);

        if !serial {
            return true;
        }

        // Deferred logout: fires only here, never during a region update.
        if self.logging_out {
            if let Some(remaining) = self.logout_ms.as_mut() {
                *remaining -= delta_ms as i64;
                if *remaining <= 0 {
                    self.perform_logout(ctx, true);
                }
            }
        }

        self.evaluate_teardown(delta_ms, ctx)
    }

    fn dispatch_queued(&mut self, filter: &dyn DispatchFilter, ctx: &WorldContext, now_second: u64) {
        let catalog = Arc::clone(&ctx.catalog);
        let mut deferred: Vec<PacketEnvelope> = Vec::new();
        let mut processed = 0usize;

        while processed < MAX_PACKETS_PER_TICK {
            let mut envelope = match self.inbound_rx.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            };
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            processed += 1;
            self.idle_ms = SESSION_IDLE_TIMEOUT_MS as i64;

            let descriptor = match catalog.get(envelope.opcode) {
                Some(descriptor) => descriptor,
                None => {
                    warn!(
                        "Unknown opcode {:#06x} from account {}",
                        envelope.opcode, self.account_id
                    );
                    continue;
                }
            };

            match descriptor.required_status {
                StatusRequirement::Never => {
                    warn!(
                        "Account {} sent server-side opcode {}",
                        self.account_id, descriptor.name
                    );
                    continue;
                }
                StatusRequirement::Unhandled => {
                    debug!(
                        "No handler for {} from account {}",
                        descriptor.name, self.account_id
                    );
                    continue;
                }
                _ => {}
            }

            if !filter.allow(descriptor, self) {
                if descriptor.required_status == StatusRequirement::LoggedIn
                    && self.recently_logged_out
                {
                    // Stale in-world traffic racing the logout; lag, not abuse.
                    continue;
                }
                // Wrong execution context, not a client error: the packet
                // belongs to the other pass and must survive until it runs.
                deferred.push(envelope);
                continue;
            }

            match self.evaluate_status(descriptor.required_status) {
                Gate::Dispatch => {}
                Gate::Defer => {
                    deferred.push(envelope);
                    continue;
                }
                Gate::SilentDrop => continue,
                Gate::Violation(why) => {
                    warn!(
                        "Protocol violation from account {}: {} ({})",
                        self.account_id, descriptor.name, why
                    );
                    continue;
                }
            }

            match self
                .rate_limiter
                .check(envelope.opcode, descriptor.rate_budget, now_second)
            {
                RateDecision::Allowed => {}
                RateDecision::OverBudget => {
                    warn!(
                        "Account {} exceeded budget of {}/s for {}",
                        self.account_id, descriptor.rate_budget, descriptor.name
                    );
                    match ctx.policy {
                        RateLimitPolicy::Log => continue,
                        RateLimitPolicy::Disconnect => {
                            self.send_notice(&ServerNotice::Disconnected {
                                reason: "Packet flooding".to_string(),
                            });
                            self.connection.close();
                            break;
                        }
                        RateLimitPolicy::Ban { scope, seconds } => {
                            let principal = match scope {
                                crate::rate_limit::BanScope::Account => {
                                    BanPrincipal::Account(self.account_id)
                                }
                                crate::rate_limit::BanScope::Address => {
                                    BanPrincipal::Address(self.addr)
                                }
                            };
                            ctx.bans.ban(principal, seconds, "packet flooding");
                            self.send_notice(&ServerNotice::BanNotice { seconds });
                            self.connection.close();
                            break;
                        }
                    }
                }
            }

            let handler = descriptor.handler();
            let name = descriptor.name;
            if let Err(fault) = handler(self, &mut envelope) {
                // Malformed payload: drop the packet, keep the session.
                error!(
                    "Parse fault in {} from account {}: {}",
                    name, self.account_id, fault
                );
            }
        }

        // Re-append in arrival order so deferred packets replay next tick
        // behind nothing but each other.
        for envelope in deferred {
            if self.inbound_tx.send(envelope).is_ok() {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn evaluate_status(&self, required: StatusRequirement) -> Gate {
        match required {
            StatusRequirement::LoggedIn => {
                if self.player.is_some() {
                    Gate::Dispatch
                } else if self.recently_logged_out {
                    Gate::SilentDrop
                } else {
                    // Likely racing a pending world-entry; replay later.
                    Gate::Defer
                }
            }
            StatusRequirement::LoggedInOrRecentlyLoggedOut => {
                if self.player.is_some() || self.recently_logged_out {
                    Gate::Dispatch
                } else {
                    Gate::Violation("no player bound and no recent logout")
                }
            }
            StatusRequirement::Transferring => match self.player {
                Some(binding) if !binding.in_world => Gate::Dispatch,
                Some(_) => Gate::Violation("entity already in world"),
                None => Gate::Violation("no entity bound for transfer"),
            },
            StatusRequirement::Authenticated => {
                if self.queued {
                    Gate::Violation("still waiting in the login queue")
                } else {
                    Gate::Dispatch
                }
            }
            // Filtered out before status evaluation.
            StatusRequirement::Never | StatusRequirement::Unhandled => {
                Gate::Violation("not dispatchable")
            }
        }
    }

    /// Applies completed async work. Invoked once per serial update.
    fn process_ready_callbacks(&mut self) {
        loop {
            let callback = match self.callback_rx.try_recv() {
                Ok(callback) => callback,
                Err(_) => break,
            };
            callback(self);
        }
    }

    fn perform_logout(&mut self, ctx: &WorldContext, persist: bool) {
        let hooks = Arc::clone(&ctx.hooks);
        hooks.logout_player(self, persist);

        self.player = None;
        self.loading = false;
        self.logging_out = false;
        self.logout_ms = None;
        self.recently_logged_out = true;
        self.recent_logout_ms = RECENT_LOGOUT_WINDOW_MS as i64;
    }

    /// Teardown state machine, polled each serial pass:
    /// Open -> Closing(grace) once the socket dies -> gone when the grace
    /// expires, the save finishes, or a forced exit skips the wait.
    fn evaluate_teardown(&mut self, delta_ms: u64, ctx: &WorldContext) -> bool {
        if self.forced_exit {
            self.finalize(ctx);
            return false;
        }

        if self.connection.is_open() {
            return true;
        }

        // Socket is dead. Start saving the player if nothing is in flight.
        if self.player.is_some() && !self.logging_out {
            self.request_logout(0);
        }

        match &mut self.link {
            LinkState::Open => {
                self.link = LinkState::Closing {
                    grace_ms: TEARDOWN_GRACE_MS as i64,
                };
            }
            LinkState::Closing { grace_ms } => {
                *grace_ms -= delta_ms as i64;
                if *grace_ms <= 0 {
                    self.finalize(ctx);
                    return false;
                }
            }
        }

        // Logout finished (or never needed): nothing left to wait for.
        if self.player.is_none() && !self.logging_out {
            self.finalize(ctx);
            return false;
        }

        true
    }

    fn finalize(&mut self, ctx: &WorldContext) {
        if self.player.is_some() || self.logging_out {
            self.perform_logout(ctx, true);
        }
        self.connection.close();
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.close();
        }
    }
}

fn unix_now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
