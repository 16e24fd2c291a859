//! In-memory connection lifecycle state.
//!
//! Read by the command gate on every inbound message and written from the
//! supervisor's recovery tasks, so every access goes through one mutex.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{errors::Error, Result};

/// Tag of the current lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Active,
    Inactive,
    Reconnecting,
    Error,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Inactive => "inactive",
            LifecycleState::Reconnecting => "reconnecting",
            LifecycleState::Error => "error",
        }
    }
}

/// Lifecycle state with its payload. Reasons only exist on the variants that
/// carry them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Inactive { reason: String },
    Reconnecting,
    Error { message: String },
}

impl ConnectionState {
    pub fn tag(&self) -> LifecycleState {
        match self {
            ConnectionState::Active => LifecycleState::Active,
            ConnectionState::Inactive { .. } => LifecycleState::Inactive,
            ConnectionState::Reconnecting => LifecycleState::Reconnecting,
            ConnectionState::Error { .. } => LifecycleState::Error,
        }
    }
}

/// Result of a setter call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied { from: LifecycleState },
    /// Same state and payload; `since` was left untouched.
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub since: DateTime<Utc>,
    /// Monotonic transition counter; totally orders transitions even when two
    /// land on the same clock tick.
    pub seq: u64,
}

impl StateSnapshot {
    pub fn inactive_reason(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Inactive { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Error { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusDetails {
    pub state: LifecycleState,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inactive_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub transitions: u64,
}

#[derive(Debug)]
struct StoreInner {
    state: ConnectionState,
    since: DateTime<Utc>,
    seq: u64,
    reconnect_attempts: u32,
}

#[derive(Debug)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Starts `Inactive` until the first session comes up.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                state: ConnectionState::Inactive {
                    reason: "not connected yet".to_string(),
                },
                since: Utc::now(),
                seq: 0,
                reconnect_attempts: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Every write leaves the record consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ConnectionState) -> Transition {
        let mut st = self.lock();
        if st.state == next {
            return Transition::Unchanged;
        }
        let from = st.state.tag();
        tracing::debug!(from = from.as_str(), to = next.tag().as_str(), "state transition");
        st.state = next;
        st.since = Utc::now();
        st.seq += 1;
        Transition::Applied { from }
    }

    /// Opens the gate. Leaves the attempt counter alone: only a successful
    /// connect resets it, see [`StateStore::reset_attempts`].
    pub fn set_active(&self) -> Transition {
        self.transition(ConnectionState::Active)
    }

    pub fn set_inactive(&self, reason: impl Into<String>) -> Transition {
        self.transition(ConnectionState::Inactive {
            reason: reason.into(),
        })
    }

    pub fn set_reconnecting(&self) -> Transition {
        self.transition(ConnectionState::Reconnecting)
    }

    pub fn set_error(&self, message: impl Into<String>) -> Transition {
        self.transition(ConnectionState::Error {
            message: message.into(),
        })
    }

    pub fn state(&self) -> StateSnapshot {
        let st = self.lock();
        StateSnapshot {
            state: st.state.clone(),
            since: st.since,
            seq: st.seq,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lock().state, ConnectionState::Active)
    }

    /// Full record for the status surface. Fails instead of recovering when the
    /// lock was poisoned so callers can report the fault.
    pub fn status_details(&self) -> Result<StatusDetails> {
        let st = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("state store lock poisoned".to_string()))?;
        let snapshot = StateSnapshot {
            state: st.state.clone(),
            since: st.since,
            seq: st.seq,
        };
        Ok(StatusDetails {
            state: snapshot.state.tag(),
            since: snapshot.since,
            inactive_reason: snapshot.inactive_reason().map(str::to_string),
            last_error: snapshot.last_error().map(str::to_string),
            reconnect_attempts: st.reconnect_attempts,
            transitions: st.seq,
        })
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Increments the attempt counter and returns the new value.
    pub fn bump_attempts(&self) -> u32 {
        let mut st = self.lock();
        st.reconnect_attempts = st.reconnect_attempts.saturating_add(1);
        st.reconnect_attempts
    }

    /// Resets the attempt counter and returns the previous value.
    pub fn reset_attempts(&self) -> u32 {
        std::mem::take(&mut self.lock().reconnect_attempts)
    }

    /// Panic while holding the lock, leaving it poisoned.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.inner.lock();
            panic!("state store writer panicked");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_active_round_trips_with_transition_time() {
        let store = StateStore::new();
        let before = Utc::now();
        assert_eq!(
            store.set_active(),
            Transition::Applied {
                from: LifecycleState::Inactive
            }
        );
        let after = Utc::now();

        let snap = store.state();
        assert_eq!(snap.state, ConnectionState::Active);
        assert!(snap.since >= before && snap.since <= after);
        assert_eq!(snap.inactive_reason(), None);
        assert!(store.is_active());
    }

    #[test]
    fn repeated_setter_is_unchanged_and_keeps_since() {
        let store = StateStore::new();
        store.set_active();
        let first = store.state();
        assert_eq!(store.set_active(), Transition::Unchanged);
        let second = store.state();
        assert_eq!(first.since, second.since);
        assert_eq!(first.seq, second.seq);
    }

    #[test]
    fn reasons_only_live_on_their_state() {
        let store = StateStore::new();
        store.set_inactive("maintenance");
        let details = store.status_details().unwrap();
        assert_eq!(details.state, LifecycleState::Inactive);
        assert_eq!(details.inactive_reason.as_deref(), Some("maintenance"));
        assert_eq!(details.last_error, None);

        store.set_error("login timed out");
        let details = store.status_details().unwrap();
        assert_eq!(details.state, LifecycleState::Error);
        assert_eq!(details.inactive_reason, None);
        assert_eq!(details.last_error.as_deref(), Some("login timed out"));
    }

    #[test]
    fn setters_are_unconditional_and_totally_ordered() {
        let store = StateStore::new();
        let mut last_seq = store.state().seq;
        store.set_reconnecting();
        store.set_error("boom");
        store.set_active();
        store.set_inactive("bye");
        store.set_reconnecting();
        let snap = store.state();
        assert_eq!(snap.state, ConnectionState::Reconnecting);
        assert!(snap.seq > last_seq);
        last_seq = snap.seq;
        store.set_error("again");
        assert_eq!(store.state().seq, last_seq + 1);
    }

    #[test]
    fn activation_does_not_clear_attempts() {
        let store = StateStore::new();
        store.bump_attempts();
        store.bump_attempts();
        store.set_active();
        assert_eq!(store.reconnect_attempts(), 2);
        assert_eq!(store.reset_attempts(), 2);
        assert_eq!(store.reconnect_attempts(), 0);
    }

    #[test]
    fn status_serialises_lowercase_state_without_empty_reasons() {
        let store = StateStore::new();
        store.set_active();
        let v = serde_json::to_value(store.status_details().unwrap()).unwrap();
        assert_eq!(v["state"], "active");
        assert!(v.get("inactive_reason").is_none());
        assert!(v.get("last_error").is_none());
    }
}
