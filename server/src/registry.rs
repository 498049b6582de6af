//! Process-wide session bookkeeping: the account -> session map, the FIFO
//! login queue used when the server is at player capacity, and the
//! reconnect grace that lets a dropped player slip back in without queuing.
//! Mutated only from the scheduler thread.

use crate::hooks::WorldContext;
use crate::session::Session;
use log::{info, warn};
use shared::ServerNotice;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Window after a disconnect during which the same account may reconnect
/// past a full queue.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(120);

pub struct SessionRegistry {
    sessions: HashMap<u32, Session>,
    /// Account ids waiting for a capacity slot, front first.
    queue: VecDeque<u32>,
    player_limit: usize,
    recent_disconnects: HashMap<u32, Instant>,
    reconnect_grace: Duration,
    peak_active: usize,
    peak_queued: usize,
}

impl SessionRegistry {
    pub fn new(player_limit: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            queue: VecDeque::new(),
            player_limit,
            recent_disconnects: HashMap::new(),
            reconnect_grace: RECONNECT_GRACE,
            peak_active: 0,
            peak_queued: 0,
        }
    }

    /// Shortens (or lengthens) the reconnect grace; deployment tuning.
    pub fn set_reconnect_grace(&mut self, grace: Duration) {
        self.reconnect_grace = grace;
    }

    pub fn player_limit(&self) -> usize {
        self.player_limit
    }

    /// Sessions actually being served (not waiting in the queue).
    pub fn active_count(&self) -> usize {
        self.sessions.len() - self.queue.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active
    }

    pub fn peak_queued(&self) -> usize {
        self.peak_queued
    }

    pub fn get(&self, account_id: u32) -> Option<&Session> {
        self.sessions.get(&account_id)
    }

    pub fn get_mut(&mut self, account_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&account_id)
    }

    pub fn account_ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// 1-based position in the login queue, or None if not queued.
    pub fn queue_position(&self, account_id: u32) -> Option<u32> {
        self.queue
            .iter()
            .position(|&id| id == account_id)
            .map(|index| index as u32 + 1)
    }

    /// Admits a session: replaces any prior session for the same account,
    /// then either activates it or parks it in the login queue with a
    /// position notice, depending on capacity, privilege and the reconnect
    /// grace.
    pub fn add(&mut self, mut session: Session, ctx: &WorldContext) {
        let account_id = session.account_id();

        // One session per account. The old one is fully evicted (queue
        // slot released, player saved, packets drained) before the new
        // one is installed, so capacity is never double-counted.
        if let Some(mut old) = self.sessions.remove(&account_id) {
            warn!(
                "Account {} logged in again, evicting previous session",
                account_id
            );
            let was_queued = self.unqueue(account_id);
            if old.player().is_some() || old.is_logging_out() {
                let hooks = Arc::clone(&ctx.hooks);
                hooks.logout_player(&mut old, true);
            }
            old.kick("Logged in from another location");
            old.dissolve();
            if was_queued {
                self.renumber();
            }
        }

        let at_capacity = self.active_count() >= self.player_limit;
        let graced = self.recently_disconnected(account_id);
        self.recent_disconnects.remove(&account_id);

        if at_capacity && !session.capacity_bypass() && !graced {
            session.set_queued(true);
            self.queue.push_back(account_id);
            let position = self.queue.len() as u32;
            session.send_notice(&ServerNotice::QueuePosition { position });
            info!(
                "Account {} queued at position {} ({} serving, limit {})",
                account_id,
                position,
                self.active_count(),
                self.player_limit
            );
            self.sessions.insert(account_id, session);
        } else {
            session.set_queued(false);
            session.send_notice(&ServerNotice::LoginProceed);
            info!("Account {} admitted ({} serving)", account_id, self.active_count() + 1);
            self.sessions.insert(account_id, session);
        }

        self.update_peaks();
    }

    /// Unlinks a session. Returns whether it had been waiting in the queue
    /// (in which case no serving slot was freed). Freed capacity promotes
    /// the queue front and every remaining queued session is re-notified
    /// with its new position.
    pub fn remove(&mut self, account_id: u32) -> bool {
        let mut session = match self.sessions.remove(&account_id) {
            Some(session) => session,
            None => return false,
        };
        session.dissolve();

        let was_queued = self.unqueue(account_id);
        self.recent_disconnects.insert(account_id, Instant::now());
        self.prune_disconnects();

        if !was_queued {
            self.promote();
        }
        self.renumber();
        was_queued
    }

    fn recently_disconnected(&self, account_id: u32) -> bool {
        self.recent_disconnects
            .get(&account_id)
            .map(|at| at.elapsed() < self.reconnect_grace)
            .unwrap_or(false)
    }

    fn unqueue(&mut self, account_id: u32) -> bool {
        match self.queue.iter().position(|&id| id == account_id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Activates queue-front sessions while capacity allows.
    fn promote(&mut self) {
        while self.active_count() < self.player_limit {
            let next = match self.queue.pop_front() {
                Some(next) => next,
                None => break,
            };
            if let Some(session) = self.sessions.get_mut(&next) {
                session.set_queued(false);
                session.send_notice(&ServerNotice::LoginProceed);
                info!("Account {} promoted from login queue", next);
            }
        }
    }

    fn renumber(&mut self) {
        for index in 0..self.queue.len() {
            let account_id = self.queue[index];
            if let Some(session) = self.sessions.get_mut(&account_id) {
                session.send_notice(&ServerNotice::QueuePosition {
                    position: index as u32 + 1,
                });
            }
        }
    }

    fn prune_disconnects(&mut self) {
        let grace = self.reconnect_grace;
        self.recent_disconnects.retain(|_, at| at.elapsed() < grace);
    }

    fn update_peaks(&mut self) {
        self.peak_active = self.peak_active.max(self.active_count());
        self.peak_queued = self.peak_queued.max(self.queue.len());
    }
}
