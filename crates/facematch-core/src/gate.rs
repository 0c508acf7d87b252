//! Single-writer gate for match operations.
//!
//! At most one match may be in flight per gallery. A query arriving while
//! another is running is dropped rather than queued: queries come from a
//! live frame stream and a stale frame has no value once a newer one exists.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Where the in-flight match currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MatchPhase {
    Idle = 0,
    Scoring = 1,
    Aggregating = 2,
    Deciding = 3,
}

impl MatchPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MatchPhase::Scoring,
            2 => MatchPhase::Aggregating,
            3 => MatchPhase::Deciding,
            _ => MatchPhase::Idle,
        }
    }
}

/// Shared gate; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MatchGate {
    state: Arc<AtomicU8>,
}

impl MatchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate for one match. Returns `None` if a match is already running.
    pub fn try_begin(&self) -> Option<MatchPermit> {
        self.state
            .compare_exchange(
                MatchPhase::Idle as u8,
                MatchPhase::Scoring as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| MatchPermit {
                state: Arc::clone(&self.state),
            })
    }

    pub fn phase(&self) -> MatchPhase {
        MatchPhase::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != MatchPhase::Idle
    }
}

/// Proof that the holder owns the in-flight match. Dropping it reopens the gate.
#[derive(Debug)]
pub struct MatchPermit {
    state: Arc<AtomicU8>,
}

impl MatchPermit {
    /// Record a phase transition. `Idle` is reserved for release and ignored.
    pub fn advance(&self, phase: MatchPhase) {
        if phase != MatchPhase::Idle {
            self.state.store(phase as u8, Ordering::Release);
        }
    }
}

impl Drop for MatchPermit {
    fn drop(&mut self) {
        self.state.store(MatchPhase::Idle as u8, Ordering::Release);
    }
}
