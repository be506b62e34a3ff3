//! Contract with the external room-version library.
//!
//! The core never interprets authorisation rules itself; it hands an event,
//! its resolved auth events and the state before it to `authorise`, and merges
//! forked state sets through `resolve`.

use std::collections::HashMap;

use crate::types::{Event, StateMap, StateTup};

/// Pure authorisation and state-resolution functions for one room version
/// family. Implementations must be side-effect free; they are called inside
/// storage transactions.
pub trait RoomAuthorizer: Send + Sync {
    /// Decide whether `event` is allowed given its auth events and the state
    /// in effect before it. A rejection carries a human-readable reason.
    fn authorise(
        &self,
        event: &Event,
        auth_events: &[Event],
        state_before: &StateMap,
    ) -> std::result::Result<(), String>;

    /// Merge forked state sets into one resolved state map.
    fn resolve(&self, state_sets: &[StateMap]) -> StateMap;
}

/// Accepts everything and resolves forks by last-writer-wins per slot. Used
/// by tests and development setups; production wires in a real room-version
/// library.
pub struct PermissiveAuthorizer;

impl RoomAuthorizer for PermissiveAuthorizer {
    fn authorise(
        &self,
        _event: &Event,
        _auth_events: &[Event],
        _state_before: &StateMap,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    fn resolve(&self, state_sets: &[StateMap]) -> StateMap {
        let mut out: HashMap<StateTup, _> = HashMap::new();
        for set in state_sets {
            for (tup, event_id) in set {
                out.insert(tup.clone(), event_id.clone());
            }
        }
        out
    }
}
