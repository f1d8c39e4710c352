//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the orchestrator and the
//! components it drives. They hold no I/O handles.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque per-run key/value store owned by the orchestrator.
///
/// Components receive it by shared reference only; `%reset` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunState(BTreeMap<String, Value>);

impl RunState {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    AwaitingModel,
    ExecutingActions,
    Terminating,
}

/// Cooperative cancellation flag shared by every wait branch of a cycle.
///
/// Cloning yields another handle to the same flag. Cancellation never kills
/// anything by itself; waiters observe it by polling.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        assert!(token.take());
        assert!(!other.is_cancelled());
        assert!(!token.take());
    }

    #[test]
    fn run_state_serializes_as_plain_map() {
        let mut state = RunState::default();
        state.insert("step", Value::from(2));
        let json = serde_json::to_string(&state).expect("serialize");
        assert_eq!(json, "{\"step\":2}");
        state.clear();
        assert!(state.is_empty());
    }
}
