//! Session and dispatch core for the worldgate game server.
//!
//! Envelopes decoded by the transport layer are queued onto per-account
//! [`session::Session`]s and drained once per tick, gated by the opcode
//! catalog's status requirements, thread classes, and per-opcode rate
//! budgets. The [`registry::SessionRegistry`] enforces the player cap with
//! a FIFO login queue, and the [`scheduler::Scheduler`] drives everything
//! from the world tick.

pub mod connection;
pub mod dispatch;
pub mod hooks;
pub mod opcode;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod session;
