//! Per-session UI state, passed explicitly to whoever handles input.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    /// A turn has been submitted and not every provider has settled.
    AwaitingTurn,
    /// The credential screen is open, either on request or after a refusal.
    CredentialsRequired,
}

#[derive(Debug)]
pub struct ChatSession {
    phase: Mutex<SessionPhase>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self { phase: Mutex::new(SessionPhase::Idle) }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.lock()
    }

    pub fn is_awaiting_turn(&self) -> bool {
        self.phase() == SessionPhase::AwaitingTurn
    }

    /// Open the credential screen. Ignored while a turn is in flight.
    pub fn open_credentials(&self) {
        let mut phase = self.lock();
        if *phase != SessionPhase::AwaitingTurn {
            *phase = SessionPhase::CredentialsRequired;
        }
    }

    pub fn close_credentials(&self) {
        let mut phase = self.lock();
        if *phase == SessionPhase::CredentialsRequired {
            *phase = SessionPhase::Idle;
        }
    }

    /// Claim the session for one turn. `None` if a turn is already in flight.
    ///
    /// The phase returns to `Idle` when the guard drops, whether the turn
    /// settled or bailed out on an error.
    pub(crate) fn begin_turn(&self) -> Option<TurnGuard<'_>> {
        let mut phase = self.lock();
        if *phase == SessionPhase::AwaitingTurn {
            return None;
        }
        *phase = SessionPhase::AwaitingTurn;
        Some(TurnGuard { session: self, restore: SessionPhase::Idle })
    }

    /// Like [`begin_turn`](Self::begin_turn), but the phase seen before the
    /// claim is put back on drop. Used for short exclusive operations.
    pub(crate) fn claim(&self) -> Option<TurnGuard<'_>> {
        let mut phase = self.lock();
        if *phase == SessionPhase::AwaitingTurn {
            return None;
        }
        let restore = *phase;
        *phase = SessionPhase::AwaitingTurn;
        Some(TurnGuard { session: self, restore })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionPhase> {
        // The phase is a plain enum; a poisoned lock still holds a valid value.
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct TurnGuard<'a> {
    session: &'a ChatSession,
    restore: SessionPhase,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        *self.session.lock() = self.restore;
    }
}
