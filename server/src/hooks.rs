//! Seams to the collaborators the core consumes but does not implement:
//! world removal on logout and the account ban store. Callers receive a
//! [`WorldContext`] handle bundling these with the opcode catalog and the
//! flood policy; nothing in the core is reached through a hidden global.

use crate::opcode::OpcodeCatalog;
use crate::rate_limit::RateLimitPolicy;
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// World-simulation operations the core triggers but does not own.
pub trait WorldHooks: Send + Sync {
    /// Removes the session's entity from the world, optionally persisting
    /// it. May pump pending transfer completions before returning.
    fn logout_player(&self, session: &mut Session, persist: bool);
}

/// Principal a flood ban is issued against, per deployment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanPrincipal {
    Account(u32),
    Address(SocketAddr),
}

/// Timed-ban writer backed by the external account store.
pub trait AccountBanStore: Send + Sync {
    fn ban(&self, principal: BanPrincipal, seconds: u64, reason: &str);
}

/// Hooks that do nothing; the default for tests and the binary skeleton.
pub struct NoopHooks;

impl WorldHooks for NoopHooks {
    fn logout_player(&self, session: &mut Session, persist: bool) {
        log::debug!(
            "Logout for account {} (persist: {})",
            session.account_id(),
            persist
        );
    }
}

impl AccountBanStore for NoopHooks {
    fn ban(&self, principal: BanPrincipal, seconds: u64, reason: &str) {
        log::warn!("Ban requested for {:?} ({}s): {}", principal, seconds, reason);
    }
}

/// Ban store that records issued bans for assertions.
#[derive(Default)]
pub struct RecordingBanStore {
    bans: Mutex<Vec<(BanPrincipal, u64, String)>>,
}

impl RecordingBanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> Vec<(BanPrincipal, u64, String)> {
        self.bans.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl AccountBanStore for RecordingBanStore {
    fn ban(&self, principal: BanPrincipal, seconds: u64, reason: &str) {
        if let Ok(mut bans) = self.bans.lock() {
            bans.push((principal, seconds, reason.to_string()));
        }
    }
}

/// Everything a dispatch pass needs besides the session itself. Cheap to
/// clone; the catalog and collaborator hooks are shared read-only.
#[derive(Clone)]
pub struct WorldContext {
    pub catalog: Arc<OpcodeCatalog>,
    pub policy: RateLimitPolicy,
    pub hooks: Arc<dyn WorldHooks>,
    pub bans: Arc<dyn AccountBanStore>,
}

impl WorldContext {
    pub fn new(catalog: Arc<OpcodeCatalog>, policy: RateLimitPolicy) -> Self {
        Self {
            catalog,
            policy,
            hooks: Arc::new(NoopHooks),
            bans: Arc::new(NoopHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WorldHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_ban_store(mut self, bans: Arc<dyn AccountBanStore>) -> Self {
        self.bans = bans;
        self
    }
}
