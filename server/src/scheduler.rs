//! The world tick: the single place where sessions are admitted, secondary
//! channels are attached, every session is driven under the serial filter,
//! and dead sessions are unlinked. Session removal is only safe here; the
//! region-parallel pass never overlaps the serial pass for the same session
//! because a session's world-presence transitions are themselves serialized
//! through this loop.

use crate::connection::Connection;
use crate::dispatch::GlobalSerial;
use crate::hooks::WorldContext;
use crate::registry::SessionRegistry;
use crate::session::Session;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Correlation tokens for secondary-channel attachment go stale after this.
pub const LINK_TOKEN_TTL: Duration = Duration::from_secs(15);

/// Ticks longer than this are clamped so a stall cannot fast-forward
/// every timer in one jump.
pub const MAX_TICK_DELTA_MS: u64 = 500;

/// An out-of-band secondary-channel attachment, keyed by a short-lived
/// token previously issued to the account.
pub struct LinkRequest {
    pub token: u32,
    pub connection: Box<dyn Connection>,
}

/// Producer handle the authentication layer uses to hand over freshly
/// authenticated sessions.
#[derive(Clone)]
pub struct SessionIntake {
    tx: mpsc::UnboundedSender<Session>,
}

impl SessionIntake {
    /// Never blocks; returns false only once the scheduler is gone.
    pub fn submit(&self, session: Session) -> bool {
        self.tx.send(session).is_ok()
    }
}

/// Producer handle for secondary-channel link requests.
#[derive(Clone)]
pub struct LinkIntake {
    tx: mpsc::UnboundedSender<LinkRequest>,
}

impl LinkIntake {
    pub fn submit(&self, request: LinkRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

struct LinkToken {
    account_id: u32,
    issued: Instant,
}

pub struct Scheduler {
    registry: SessionRegistry,
    ctx: WorldContext,

    intake_tx: mpsc::UnboundedSender<Session>,
    intake_rx: mpsc::UnboundedReceiver<Session>,
    link_tx: mpsc::UnboundedSender<LinkRequest>,
    link_rx: mpsc::UnboundedReceiver<LinkRequest>,

    link_tokens: HashMap<u32, LinkToken>,
    link_ttl: Duration,
    tick_count: u64,
}

impl Scheduler {
    pub fn new(registry: SessionRegistry, ctx: WorldContext) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();

        Self {
            registry,
            ctx,
            intake_tx,
            intake_rx,
            link_tx,
            link_rx,
            link_tokens: HashMap::new(),
            link_ttl: LINK_TOKEN_TTL,
            tick_count: 0,
        }
    }

    pub fn session_intake(&self) -> SessionIntake {
        SessionIntake {
            tx: self.intake_tx.clone(),
        }
    }

    pub fn link_intake(&self) -> LinkIntake {
        LinkIntake {
            tx: self.link_tx.clone(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn context(&self) -> &WorldContext {
        &self.ctx
    }

    /// Token lifetime tuning (tests shorten it to force staleness).
    pub fn set_link_ttl(&mut self, ttl: Duration) {
        self.link_ttl = ttl;
    }

    /// Issues a fresh correlation token the client must echo when opening
    /// its secondary channel.
    pub fn issue_link_token(&mut self, account_id: u32) -> u32 {
        let mut token = rand::random::<u32>();
        while self.link_tokens.contains_key(&token) {
            token = rand::random();
        }
        self.link_tokens.insert(
            token,
            LinkToken {
                account_id,
                issued: Instant::now(),
            },
        );
        token
    }

    /// One world tick: admit, link, update, reap.
    pub fn tick(&mut self, delta_ms: u64) {
        while let Ok(session) = self.intake_rx.try_recv() {
            self.registry.add(session, &self.ctx);
        }

        while let Ok(mut request) = self.link_rx.try_recv() {
            match self.link_tokens.remove(&request.token) {
                Some(token) if token.issued.elapsed() <= self.link_ttl => {
                    match self.registry.get_mut(token.account_id) {
                        Some(session) => {
                            session.attach_secondary(request.connection);
                            debug!("Secondary channel attached for account {}", token.account_id);
                        }
                        None => {
                            warn!(
                                "Link token for departed account {}, closing",
                                token.account_id
                            );
                            request.connection.close();
                        }
                    }
                }
                _ => {
                    warn!("Stale or unknown link token {:#010x}, closing", request.token);
                    request.connection.close();
                }
            }
        }
        let ttl = self.link_ttl;
        self.link_tokens.retain(|_, token| token.issued.elapsed() <= ttl);

        for account_id in self.registry.account_ids() {
            let keep_alive = match self.registry.get_mut(account_id) {
                Some(session) => session.update(delta_ms, &GlobalSerial, &self.ctx),
                None => continue,
            };
            if !keep_alive {
                let was_queued = self.registry.remove(account_id);
                info!(
                    "Session for account {} unlinked ({})",
                    account_id,
                    if was_queued { "was queued" } else { "was serving" }
                );
            }
        }

        self.tick_count += 1;
        if self.tick_count % 600 == 0 {
            debug!(
                "Tick {}: {} serving, {} queued (peaks {}/{})",
                self.tick_count,
                self.registry.active_count(),
                self.registry.queued_count(),
                self.registry.peak_active(),
                self.registry.peak_queued()
            );
        }
    }

    /// Drives [`Scheduler::tick`] at a fixed cadence until the task is
    /// cancelled.
    pub async fn run(mut self, tick_duration: Duration) {
        let mut interval = tokio::time::interval(tick_duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_tick = Instant::now();

        // The first tick fires immediately; skip it so deltas start sane.
        interval.tick().await;

        loop {
            interval.tick().await;

            let now = Instant::now();
            let mut delta_ms = now.duration_since(last_tick).as_millis() as u64;
            last_tick = now;

            if delta_ms > MAX_TICK_DELTA_MS {
                warn!(
                    "Large tick delta {}ms, clamping to {}ms",
                    delta_ms, MAX_TICK_DELTA_MS
                );
                delta_ms = MAX_TICK_DELTA_MS;
            }

            self.tick(delta_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RecordingConnection;
    use crate::opcode::default_catalog;
    use crate::rate_limit::RateLimitPolicy;
    use std::sync::Arc;

    fn test_scheduler(player_limit: usize) -> Scheduler {
        let ctx = WorldContext::new(Arc::new(default_catalog()), RateLimitPolicy::Log);
        Scheduler::new(SessionRegistry::new(player_limit), ctx)
    }

    fn session(account_id: u32) -> (Session, crate::connection::RecordingHandle) {
        let connection = RecordingConnection::new();
        let handle = connection.handle();
        (Session::new(account_id, Box::new(connection)), handle)
    }

    #[test]
    fn test_intake_is_admitted_on_tick() {
        let mut scheduler = test_scheduler(10);
        let intake = scheduler.session_intake();

        let (s, _) = session(1);
        assert!(intake.submit(s));
        assert_eq!(scheduler.registry().session_count(), 0);

        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 1);
        assert_eq!(scheduler.registry().active_count(), 1);
    }

    #[test]
    fn test_dead_session_is_reaped() {
        let mut scheduler = test_scheduler(10);
        let intake = scheduler.session_intake();

        let (s, handle) = session(1);
        intake.submit(s);
        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 1);

        handle.sever();
        // One tick to schedule the logout/teardown, one to complete it.
        scheduler.tick(50);
        scheduler.tick(50);
        assert_eq!(scheduler.registry().session_count(), 0);
    }

    #[test]
    fn test_link_token_attaches_secondary() {
        let mut scheduler = test_scheduler(10);
        let intake = scheduler.session_intake();
        let links = scheduler.link_intake();

        let (s, _) = session(1);
        intake.submit(s);
        scheduler.tick(50);

        let token = scheduler.issue_link_token(1);
        links.submit(LinkRequest {
            token,
            connection: Box::new(RecordingConnection::new()),
        });
        scheduler.tick(50);

        assert!(scheduler.registry().get(1).unwrap().has_secondary());
    }

    #[test]
    fn test_stale_link_token_is_rejected() {
        let mut scheduler = test_scheduler(10);
        let intake = scheduler.session_intake();
        let links = scheduler.link_intake();

        let (s, _) = session(1);
        intake.submit(s);
        scheduler.tick(50);

        scheduler.set_link_ttl(Duration::from_millis(0));
        let token = scheduler.issue_link_token(1);

        let link_conn = RecordingConnection::new();
        let link_handle = link_conn.handle();
        links.submit(LinkRequest {
            token,
            connection: Box::new(link_conn),
        });
        scheduler.tick(50);

        assert!(!scheduler.registry().get(1).unwrap().has_secondary());
        assert!(!link_handle.is_open());
    }

    #[test]
    fn test_unknown_link_token_is_rejected() {
        let mut scheduler = test_scheduler(10);
        let links = scheduler.link_intake();

        let link_conn = RecordingConnection::new();
        let link_handle = link_conn.handle();
        links.submit(LinkRequest {
            token: 0xBAD_F00D,
            connection: Box::new(link_conn),
        });
        scheduler.tick(50);

        assert!(!link_handle.is_open());
    }

    #[test]
    fn test_tokens_are_unique_while_outstanding() {
        let mut scheduler = test_scheduler(10);
        let mut tokens = std::collections::HashSet::new();
        for account_id in 0..64 {
            assert!(tokens.insert(scheduler.issue_link_token(account_id)));
        }
    }
}
