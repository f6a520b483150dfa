//! Core data model (spec §3): display content, per-address buffer entries,
//! and the persisted snapshot shape.

use serde::{Deserialize, Serialize};

/// Sentinel address meaning "broadcast to all four physical displays".
/// Never a key in any of the controller's four-element arrays.
pub const BROADCAST: i32 = -1;

/// A display's desired content. Restricted to depth <= 2: a `Sequence`'s
/// `messages` may only contain `Text` or `Time`, never a nested `Sequence`
/// (enforced in `Controller::set_message`, not by the type itself, to keep
/// the JSON shape a plain three-armed tagged enum).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DisplayContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Time {
        format: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Sequence {
        messages: Vec<DisplayContent>,
        interval: f64,
    },
}

impl DisplayContent {
    /// The `duration` an inner sequence item carries, if any. `None` for a
    /// bare `Sequence` (which has no duration of its own, only `interval`).
    pub fn duration(&self) -> Option<f64> {
        match self {
            DisplayContent::Text { duration, .. } => *duration,
            DisplayContent::Time { duration, .. } => *duration,
            DisplayContent::Sequence { .. } => None,
        }
    }

    /// True if this content is a `Sequence` containing only `Text`/`Time`
    /// items (spec invariant: sequences never nest).
    pub fn is_valid_sequence(&self) -> bool {
        match self {
            DisplayContent::Sequence { messages, .. } => {
                !messages.is_empty()
                    && messages
                        .iter()
                        .all(|m| matches!(m, DisplayContent::Text { .. } | DisplayContent::Time { .. }))
            }
            _ => true,
        }
    }
}

/// Per-address content buffer (spec §3 `BufferEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEntry {
    pub content: Option<DisplayContent>,
    pub priority: i32,
    pub owner: Option<String>,
    pub cursor: i32,
    pub last_refresh: f64,
    pub last_update: f64,
}

impl Default for BufferEntry {
    fn default() -> Self {
        Self {
            content: None,
            priority: -1,
            owner: None,
            cursor: -1,
            last_refresh: 0.0,
            last_update: 0.0,
        }
    }
}

/// The full persisted snapshot (component H): a superset of live state
/// sufficient to restore buffer, enabled flags, and stop indicators.
/// `current_text` is included for operator visibility but is never
/// restored on load — the refresh loop recomputes it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub buffer: std::collections::BTreeMap<String, BufferEntry>,
    pub current_text: std::collections::BTreeMap<String, Option<String>>,
    pub enabled: std::collections::BTreeMap<String, bool>,
    pub stop_indicators: std::collections::BTreeMap<String, bool>,
}
