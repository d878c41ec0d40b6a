// src/core/serializer/gate.rs

//! `suspended`/`joining` are not independent bits; together with the
//! "nothing in flight" baseline they form a small state machine:
//! `Idle -> Suspended -> Joining -> Idle`. Modeling it explicitly avoids
//! scattering the equivalent of `cpg_event_set/clear_*` calls across many
//! call sites (spec.md SS9).

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gate {
    /// No join protocol round is in flight on this node.
    Idle = 0,
    /// A join protocol round is in flight (this node's own, or it has not
    /// yet observed the committed outcome of one still pending elsewhere).
    /// `Notify` events with `state = Init` may not execute.
    Suspended = 1,
    /// Stronger form of `Suspended`: this node's *own* join is in flight.
    /// Direct client I/O requests must be completed with `NewNodeVer`
    /// rather than queued.
    Joining = 2,
}

impl Gate {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Suspended,
            2 => Self::Joining,
            _ => Self::Idle,
        }
    }
}

/// Atomic-backed holder for the gate, so I/O-path snapshot readers can
/// observe it without taking the FIFO lock.
#[derive(Debug)]
pub struct GateCell(AtomicU8);

impl GateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Gate::Idle as u8))
    }

    pub fn get(&self) -> Gate {
        Gate::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, gate: Gate) {
        self.0.store(gate as u8, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.get() == Gate::Idle
    }

    pub fn is_suspended_or_joining(&self) -> bool {
        !self.is_idle()
    }

    pub fn is_joining(&self) -> bool {
        self.get() == Gate::Joining
    }
}

impl Default for GateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let gate = GateCell::new();
        assert!(gate.is_idle());
        assert!(!gate.is_joining());
    }

    #[test]
    fn transitions_follow_the_small_state_machine() {
        let gate = GateCell::new();
        gate.set(Gate::Suspended);
        assert!(gate.is_suspended_or_joining());
        assert!(!gate.is_joining());

        gate.set(Gate::Joining);
        assert!(gate.is_joining());

        gate.set(Gate::Idle);
        assert!(gate.is_idle());
    }
}
