//! Parking brake: persistent, scoped, fail-closed kill switch.
//!
//! State machine `OFF ↔ ON(scopes)`. `engage` unions scopes, `disengage`
//! clears everything, and `global` dominates every other scope. The state
//! lives in the store's flags table so it survives restarts; the ingestion
//! pipeline writes the matching `safety.audit` record for each transition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::config::BrakeConfig;
use crate::db::Database;
use crate::error::Result;

/// Scopes the brake understands. Unknown names are rejected at the edge.
pub const KNOWN_SCOPES: &[&str] =
    &["global", "skills", "sight", "voice", "scheduler", "writes", "retrieval"];

const BRAKE_FLAG: &str = "brake";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrakeState {
    pub engaged: bool,
    pub scopes: BTreeSet<String>,
}

impl BrakeState {
    /// Does the brake block this scope right now?
    pub fn is_blocked(&self, scope: &str) -> bool {
        self.engaged && (self.scopes.contains("global") || self.scopes.contains(scope))
    }
}

pub struct ParkingBrake {
    db: Arc<Database>,
    state: RwLock<BrakeState>,
}

impl ParkingBrake {
    /// Load persisted state, falling back to the configured initial state.
    pub fn load(db: Arc<Database>, initial: &BrakeConfig) -> Result<Self> {
        let state = match db.get_flag(BRAKE_FLAG)? {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => {
                let mut state = BrakeState::default();
                if initial.engaged {
                    state.engaged = true;
                    state.scopes = filter_scopes(initial.scopes.iter().map(String::as_str));
                }
                state
            }
        };
        let brake = Self { db, state: RwLock::new(state) };
        brake.persist()?;
        Ok(brake)
    }

    /// Engage: union the given scopes into the current set.
    pub fn engage<'a>(&self, scopes: impl IntoIterator<Item = &'a str>) -> Result<BrakeState> {
        let mut state = self.state.write().expect("brake lock");
        state.engaged = true;
        state.scopes.extend(filter_scopes(scopes));
        if state.scopes.is_empty() {
            // Engaging with no recognized scope means "all of it".
            state.scopes.insert("global".into());
        }
        let snapshot = state.clone();
        drop(state);
        self.persist()?;
        Ok(snapshot)
    }

    /// Disengage: back to OFF, scopes cleared.
    pub fn disengage(&self) -> Result<BrakeState> {
        let mut state = self.state.write().expect("brake lock");
        state.engaged = false;
        state.scopes.clear();
        let snapshot = state.clone();
        drop(state);
        self.persist()?;
        Ok(snapshot)
    }

    pub fn status(&self) -> BrakeState {
        self.state.read().expect("brake lock").clone()
    }

    pub fn is_blocked(&self, scope: &str) -> bool {
        self.state.read().expect("brake lock").is_blocked(scope)
    }

    fn persist(&self) -> Result<()> {
        let state = self.state.read().expect("brake lock").clone();
        let json = serde_json::to_string(&state).expect("brake state serialization");
        self.db.set_flag(BRAKE_FLAG, &json)
    }
}

fn filter_scopes<'a>(scopes: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    scopes
        .into_iter()
        .filter(|s| {
            let known = KNOWN_SCOPES.contains(s);
            if !known {
                tracing::warn!(scope = *s, "unknown brake scope ignored");
            }
            known
        })
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Arc<Database> {
        Arc::new(Database::open(None, "porter").unwrap())
    }

    #[test]
    fn initial_state_is_off() {
        let brake = ParkingBrake::load(mem_db(), &BrakeConfig::default()).unwrap();
        let state = brake.status();
        assert!(!state.engaged);
        assert!(state.scopes.is_empty());
        assert!(!brake.is_blocked("writes"));
    }

    #[test]
    fn engage_unions_scopes() {
        let brake = ParkingBrake::load(mem_db(), &BrakeConfig::default()).unwrap();
        brake.engage(["writes"]).unwrap();
        brake.engage(["retrieval", "writes"]).unwrap();
        let state = brake.status();
        assert!(state.engaged);
        assert_eq!(state.scopes.len(), 2);
        assert!(brake.is_blocked("writes"));
        assert!(brake.is_blocked("retrieval"));
        assert!(!brake.is_blocked("voice"));
    }

    #[test]
    fn global_dominates() {
        let brake = ParkingBrake::load(mem_db(), &BrakeConfig::default()).unwrap();
        brake.engage(["global"]).unwrap();
        for scope in ["writes", "retrieval", "skills", "voice"] {
            assert!(brake.is_blocked(scope));
        }
    }

    #[test]
    fn disengage_clears_everything() {
        let brake = ParkingBrake::load(mem_db(), &BrakeConfig::default()).unwrap();
        brake.engage(["writes", "voice"]).unwrap();
        let state = brake.disengage().unwrap();
        assert!(!state.engaged);
        assert!(state.scopes.is_empty());
        assert!(!brake.is_blocked("writes"));
    }

    #[test]
    fn unknown_scopes_are_ignored_and_default_to_global() {
        let brake = ParkingBrake::load(mem_db(), &BrakeConfig::default()).unwrap();
        brake.engage(["warp-drive"]).unwrap();
        // Nothing recognized: fail closed on everything.
        assert!(brake.is_blocked("writes"));
        assert!(brake.status().scopes.contains("global"));
    }

    #[test]
    fn state_survives_reload_from_same_store() {
        let db = mem_db();
        {
            let brake = ParkingBrake::load(db.clone(), &BrakeConfig::default()).unwrap();
            brake.engage(["writes"]).unwrap();
        }
        let brake = ParkingBrake::load(db, &BrakeConfig::default()).unwrap();
        assert!(brake.is_blocked("writes"));
        assert_eq!(brake.status().scopes.iter().collect::<Vec<_>>(), vec!["writes"]);
    }

    #[test]
    fn configured_initial_state_applies_on_fresh_store() {
        let config = BrakeConfig { engaged: true, scopes: vec!["scheduler".into()] };
        let brake = ParkingBrake::load(mem_db(), &config).unwrap();
        assert!(brake.is_blocked("scheduler"));
        assert!(!brake.is_blocked("writes"));
    }
}
