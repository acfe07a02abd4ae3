//! Tri-state settings and their precedence
//!
//! Layers are ordered highest precedence first: environment, instance,
//! global. An explicit disable anywhere beats an explicit enable anywhere;
//! with no explicit setting caching stays off.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One layer's opinion on whether caching is on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Setting {
    /// Explicitly on
    Enabled,
    /// Explicitly off
    Disabled,
    /// No opinion
    #[default]
    Unset,
}

impl Setting {
    /// `Some(true)` / `Some(false)` for explicit settings
    #[must_use]
    pub const fn as_bool(self) -> Option<bool> {
        match self {
            Self::Enabled => Some(true),
            Self::Disabled => Some(false),
            Self::Unset => None,
        }
    }
}

impl From<bool> for Setting {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }
}

impl From<Option<bool>> for Setting {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Self::Unset, Self::from)
    }
}

/// Where a setting came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// `MEMENTO_ENABLED` / `MEMENTO_DISABLED`
    Environment,
    /// A per-cache controller
    Instance,
    /// The process-wide controller
    Global,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => write!(f, "environment"),
            Self::Instance => write!(f, "instance"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// A resolved setting and the layer that decided it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Final answer
    pub enabled: bool,
    /// Layer whose explicit setting won; `None` when every layer was unset
    pub decided_by: Option<Layer>,
}

/// Collapse layered settings into one tri-state setting
#[must_use]
pub fn combine(settings: impl IntoIterator<Item = Setting>) -> Setting {
    let mut combined = Setting::Unset;
    for setting in settings {
        match setting {
            Setting::Disabled => return Setting::Disabled,
            Setting::Enabled => combined = Setting::Enabled,
            Setting::Unset => {}
        }
    }
    combined
}

/// Final on/off answer for layered settings
#[must_use]
pub fn resolve(settings: impl IntoIterator<Item = Setting>) -> bool {
    combine(settings) == Setting::Enabled
}

/// Like [`resolve`], also reporting which layer decided
///
/// Among several layers with the winning setting the highest-precedence
/// (earliest) one is reported.
#[must_use]
pub fn effective(layers: &[(Layer, Setting)]) -> Decision {
    let find = |wanted: Setting| {
        layers
            .iter()
            .find(|(_, setting)| *setting == wanted)
            .map(|(layer, _)| *layer)
    };
    if let Some(layer) = find(Setting::Disabled) {
        return Decision {
            enabled: false,
            decided_by: Some(layer),
        };
    }
    let decided_by = find(Setting::Enabled);
    Decision {
        enabled: decided_by.is_some(),
        decided_by,
    }
}
