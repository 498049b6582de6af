//! The thread-safety partition of packet dispatch. Sessions are driven from
//! two contexts: concurrently-executing world-region updates and the serial
//! scheduler pass. A filter decides, per opcode, which context may dispatch
//! it, so gameplay handlers never need to be generally thread-safe.

use crate::opcode::{OpcodeDescriptor, ThreadClass};
use crate::session::Session;

/// Strategy consulted for every popped envelope before dispatch.
pub trait DispatchFilter {
    /// May this opcode run now, in this context, for this session?
    fn allow(&self, descriptor: &OpcodeDescriptor, session: &Session) -> bool;

    /// Whether this context may run logout, teardown and idle-close logic.
    /// Only the serial pass may; logout must never race a region update.
    fn permits_logout_processing(&self) -> bool;
}

/// Filter for sessions driven from inside a concurrently-updating world
/// region. Thread-unsafe opcodes are categorically refused here; everything
/// else requires the session's entity to actually be present in the world
/// this region is simulating.
pub struct RegionParallel;

impl DispatchFilter for RegionParallel {
    fn allow(&self, descriptor: &OpcodeDescriptor, session: &Session) -> bool {
        match descriptor.thread_class {
            ThreadClass::InPlace => true,
            ThreadClass::ThreadUnsafe => false,
            ThreadClass::ThreadSafe => session.player_in_world(),
        }
    }

    fn permits_logout_processing(&self) -> bool {
        false
    }
}

/// Filter for the scheduler's serial pass. Runs thread-unsafe opcodes and
/// defers in-world traffic to the region pass: once the session's entity is
/// confirmed in the world, region workers own its thread-safe packets.
pub struct GlobalSerial;

impl DispatchFilter for GlobalSerial {
    fn allow(&self, descriptor: &OpcodeDescriptor, session: &Session) -> bool {
        match descriptor.thread_class {
            ThreadClass::InPlace | ThreadClass::ThreadUnsafe => true,
            ThreadClass::ThreadSafe => !session.player_in_world(),
        }
    }

    fn permits_logout_processing(&self) -> bool {
        true
    }
}
