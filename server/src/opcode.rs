//! Static opcode metadata: for every client opcode, the session status it
//! requires, which execution context may run it, its per-second rate budget
//! and the handler to invoke. The catalog is built once at startup and
//! shared read-only; dispatch is an O(1) table lookup, not a match arm per
//! gameplay message.

use crate::session::Session;
use serde::{Deserialize, Serialize};
use shared::{PacketEnvelope, ParseFault};
use std::collections::HashMap;
use std::sync::Arc;

pub type Opcode = u16;

/// Built-in connection-management opcodes. Gameplay opcodes are registered
/// by the world layer on top of these.
pub mod opcodes {
    pub const CMSG_PING: u16 = 0x0001;
    pub const CMSG_ENUM_CHARACTERS: u16 = 0x0037;
    pub const CMSG_PLAYER_LOGIN: u16 = 0x003D;
    pub const CMSG_LOGOUT_REQUEST: u16 = 0x004B;
    pub const CMSG_LOGOUT_CANCEL: u16 = 0x004E;
    pub const CMSG_MOVE_HEARTBEAT: u16 = 0x00EE;
    pub const CMSG_TIME_QUERY: u16 = 0x01CE;
    pub const CMSG_TRANSFER_ACK: u16 = 0x03FC;
}

/// Session status an opcode demands before its handler may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequirement {
    /// A world entity must be bound to the session.
    LoggedIn,
    /// Valid both in-world and during the short grace window after logout.
    LoggedInOrRecentlyLoggedOut,
    /// Only while a map/realm transfer is in flight (entity bound, not in world).
    Transferring,
    /// Any authenticated session, including ones still on the character screen.
    Authenticated,
    /// Server-to-client only; receiving it from a client is a violation.
    Never,
    /// Known opcode with no server-side handling.
    Unhandled,
}

/// Which execution context may run an opcode's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadClass {
    /// Safe on whichever thread reaches it first.
    InPlace,
    /// Safe during concurrent region updates.
    ThreadSafe,
    /// Must only run on the serial scheduler pass.
    ThreadUnsafe,
}

/// Handler invoked once an envelope has passed status, thread-class and
/// rate gates. A `ParseFault` drops the packet but never the session.
pub type PacketHandler =
    Arc<dyn Fn(&mut Session, &mut PacketEnvelope) -> Result<(), ParseFault> + Send + Sync>;

pub struct OpcodeDescriptor {
    pub name: &'static str,
    pub required_status: StatusRequirement,
    pub thread_class: ThreadClass,
    /// Maximum invocations per session per wall-clock second; 0 = unlimited.
    pub rate_budget: u32,
    handler: PacketHandler,
}

impl OpcodeDescriptor {
    pub fn new(
        name: &'static str,
        required_status: StatusRequirement,
        thread_class: ThreadClass,
        rate_budget: u32,
        handler: PacketHandler,
    ) -> Self {
        Self {
            name,
            required_status,
            thread_class,
            rate_budget,
            handler,
        }
    }

    pub fn handler(&self) -> PacketHandler {
        Arc::clone(&self.handler)
    }
}

/// Per-second budgets shipped as data so the flood classification stays
/// auditable without reading handler code. Applied over a catalog after all
/// opcodes are registered.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RateBudgetTable {
    pub budgets: HashMap<Opcode, u32>,
}

/// Read-only opcode table. Built once at startup; no synchronization needed
/// afterwards.
#[derive(Default)]
pub struct OpcodeCatalog {
    table: HashMap<Opcode, OpcodeDescriptor>,
}

impl OpcodeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a descriptor, replacing any previous registration for the
    /// same opcode.
    pub fn register(&mut self, opcode: Opcode, descriptor: OpcodeDescriptor) {
        self.table.insert(opcode, descriptor);
    }

    pub fn get(&self, opcode: Opcode) -> Option<&OpcodeDescriptor> {
        self.table.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Overlays budgets from a data table onto registered opcodes. Unknown
    /// opcodes in the table are ignored.
    pub fn apply_budgets(&mut self, budgets: &RateBudgetTable) {
        for (opcode, budget) in &budgets.budgets {
            if let Some(descriptor) = self.table.get_mut(opcode) {
                descriptor.rate_budget = *budget;
            }
        }
    }
}

/// Catalog of the connection-management opcodes the core itself understands.
/// The world layer extends this with gameplay registrations before startup
/// completes.
pub fn default_catalog() -> OpcodeCatalog {
    use opcodes::*;

    let mut catalog = OpcodeCatalog::new();

    catalog.register(
        CMSG_PING,
        OpcodeDescriptor::new(
            "CMSG_PING",
            StatusRequirement::Authenticated,
            ThreadClass::InPlace,
            0,
            Arc::new(|session, envelope| {
                let sequence = envelope.read_u32()?;
                log::debug!(
                    "Ping {} from account {}",
                    sequence,
                    session.account_id()
                );
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_ENUM_CHARACTERS,
        OpcodeDescriptor::new(
            "CMSG_ENUM_CHARACTERS",
            StatusRequirement::Authenticated,
            ThreadClass::ThreadUnsafe,
            200,
            Arc::new(|session, _envelope| {
                log::debug!("Character enumeration for account {}", session.account_id());
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_PLAYER_LOGIN,
        OpcodeDescriptor::new(
            "CMSG_PLAYER_LOGIN",
            StatusRequirement::Authenticated,
            ThreadClass::ThreadUnsafe,
            10,
            Arc::new(|session, envelope| {
                let entity_id = envelope.read_u64()?;
                session.begin_login(entity_id);
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_LOGOUT_REQUEST,
        OpcodeDescriptor::new(
            "CMSG_LOGOUT_REQUEST",
            StatusRequirement::LoggedIn,
            ThreadClass::ThreadUnsafe,
            10,
            Arc::new(|session, _envelope| {
                session.request_logout(crate::session::LOGOUT_DELAY_MS);
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_LOGOUT_CANCEL,
        OpcodeDescriptor::new(
            "CMSG_LOGOUT_CANCEL",
            StatusRequirement::LoggedIn,
            ThreadClass::ThreadUnsafe,
            10,
            Arc::new(|session, _envelope| {
                session.cancel_logout();
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_MOVE_HEARTBEAT,
        OpcodeDescriptor::new(
            "CMSG_MOVE_HEARTBEAT",
            StatusRequirement::LoggedIn,
            ThreadClass::ThreadSafe,
            200,
            Arc::new(|_session, envelope| {
                // Position triple; consumed here, applied by the simulation.
                envelope.read_u32()?;
                envelope.read_u32()?;
                envelope.read_u32()?;
                Ok(())
            }),
        ),
    );

    catalog.register(
        CMSG_TIME_QUERY,
        OpcodeDescriptor::new(
            "CMSG_TIME_QUERY",
            StatusRequirement::LoggedInOrRecentlyLoggedOut,
            ThreadClass::InPlace,
            0,
            Arc::new(|_session, _envelope| Ok(())),
        ),
    );

    catalog.register(
        CMSG_TRANSFER_ACK,
        OpcodeDescriptor::new(
            "CMSG_TRANSFER_ACK",
            StatusRequirement::Transferring,
            ThreadClass::ThreadUnsafe,
            10,
            Arc::new(|session, _envelope| {
                session.confirm_world_entry();
                Ok(())
            }),
        ),
    );

    catalog
}
