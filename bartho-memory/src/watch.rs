//! Rule-set file watcher: hot reload as an atomic snapshot swap.
//!
//! Readers never see a partial rule set — the watcher parses the whole file
//! off to the side and swaps the `Arc` only on success. A file that fails to
//! parse leaves the last valid set in place. `BARTHO_EMBED_RELOAD=0`
//! disables the watcher entirely (tests/CI).

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::rules::{swap, RuleHandle, RuleSet, RuleSetDef};

pub struct RuleWatcher {
    _watcher: RecommendedWatcher,
}

impl RuleWatcher {
    /// Watch `path` (a TOML rule-set file) and swap the shared snapshot on
    /// every successful parse. Returns `None` when disabled by environment.
    pub fn spawn(path: PathBuf, handle: RuleHandle) -> Result<Option<Self>> {
        if !MemoryConfig::watcher_enabled() {
            tracing::debug!("rule watcher disabled by environment");
            return Ok(None);
        }

        // Initial load so the handle reflects the file before any event.
        reload(&path, &handle);

        let event_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload(&event_path, &handle);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "rule watcher event error"),
            }
        })
        .map_err(|e| MemoryError::Config(format!("rule watcher: {}", e)))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| MemoryError::Config(format!("rule watcher: {}", e)))?;
        Ok(Some(Self { _watcher: watcher }))
    }
}

/// Parse and swap; a broken file keeps the stale valid set.
fn reload(path: &Path, handle: &RuleHandle) {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "rule file unreadable; keeping current rules");
            return;
        }
    };
    let def: RuleSetDef = match toml::from_str(&text) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "rule file invalid; keeping current rules");
            return;
        }
    };
    swap(handle, RuleSet::compile(&def));
    tracing::info!("rule set reloaded");
}
