//! Persisted state snapshot (component H).
//!
//! A single JSON file, rewritten in full on every save (no append log).
//! Loading is best-effort: any failure is logged and the caller proceeds
//! with defaults.

use std::path::Path;

use tracing::warn;

use crate::error::PersistenceError;
use crate::model::Snapshot;

pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), PersistenceError> {
    let body = serde_json::to_string(snapshot)?;
    std::fs::write(path, body).map_err(|source| PersistenceError::Write {
        path: path.display().to_string(),
        source,
    })
}

pub fn load(path: &Path) -> Result<Snapshot, PersistenceError> {
    let body = std::fs::read_to_string(path).map_err(|source| PersistenceError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&body)?)
}

/// Best-effort load: returns `Snapshot::default()` and logs on any failure,
/// matching the original's bare `except: print "Failed to load
/// configuration"`.
pub fn load_or_default(path: &Path) -> Snapshot {
    match load(path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to load persisted state, starting fresh");
            Snapshot::default()
        }
    }
}
