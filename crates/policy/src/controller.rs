//! Runtime enable/disable switches
//!
//! A [`Controller`] holds one read/write [`Switch`]. `enable` and `disable`
//! return an [`OverrideGuard`] that puts the previous switch back when it is
//! dropped, so overrides nest like scopes.

use crate::setting::{Decision, Layer, Setting, combine, effective};
use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, PoisonError, RwLock};
use tracing::{trace, warn};

/// Environment variable that turns caching on when set to `true`
pub const ENABLED_ENV: &str = "MEMENTO_ENABLED";

/// Environment variable that turns caching off when set to `true`
pub const DISABLED_ENV: &str = "MEMENTO_DISABLED";

/// Independent settings for cache reads and cache writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    /// May cached outputs be returned
    pub read: Setting,
    /// May computed outputs be stored
    pub write: Setting,
}

impl Switch {
    /// Neither reads nor writes have an explicit setting
    pub const UNSET: Self = Self {
        read: Setting::Unset,
        write: Setting::Unset,
    };

    /// Explicit settings for both directions
    #[must_use]
    pub fn new(read: bool, write: bool) -> Self {
        Self {
            read: read.into(),
            write: write.into(),
        }
    }

    /// Same setting for reads and writes
    #[must_use]
    pub const fn uniform(setting: Setting) -> Self {
        Self {
            read: setting,
            write: setting,
        }
    }
}

/// Combined read setting over layered switches, highest precedence first
#[must_use]
pub fn resolve_read(switches: &[Switch]) -> bool {
    combine(switches.iter().map(|s| s.read)) == Setting::Enabled
}

/// Combined write setting over layered switches, highest precedence first
#[must_use]
pub fn resolve_write(switches: &[Switch]) -> bool {
    combine(switches.iter().map(|s| s.write)) == Setting::Enabled
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// The environment layer, from `MEMENTO_ENABLED` / `MEMENTO_DISABLED`
///
/// Only the value `true` (any case) counts. Both set is treated as disabled.
#[must_use]
pub fn env_setting() -> Setting {
    match (env_flag(ENABLED_ENV), env_flag(DISABLED_ENV)) {
        (true, true) => {
            warn!("{ENABLED_ENV} and {DISABLED_ENV} are both set to true, caching disabled");
            Setting::Disabled
        }
        (false, true) => Setting::Disabled,
        (true, false) => Setting::Enabled,
        (false, false) => Setting::Unset,
    }
}

/// A mutable switch with scoped overrides
#[derive(Debug, Default)]
pub struct Controller {
    switch: RwLock<Switch>,
}

impl Controller {
    /// A controller with nothing set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            switch: RwLock::new(Switch::UNSET),
        }
    }

    /// Current switch
    #[must_use]
    pub fn switch(&self) -> Switch {
        *self.switch.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the switch, returning the previous one
    pub fn set(&self, switch: Switch) -> Switch {
        let mut current = self.switch.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, switch)
    }

    /// Explicitly enable (or disable) reads and writes until the guard drops
    #[must_use = "the override ends as soon as the guard is dropped"]
    pub fn enable(&self, read: bool, write: bool) -> OverrideGuard<'_> {
        let previous = self.set(Switch::new(read, write));
        trace!(read, write, "Cache switch overridden");
        OverrideGuard {
            controller: self,
            previous,
        }
    }

    /// Explicitly disable reads and writes until the guard drops
    #[must_use = "the override ends as soon as the guard is dropped"]
    pub fn disable(&self) -> OverrideGuard<'_> {
        self.enable(false, false)
    }
}

/// Restores a [`Controller`]'s previous switch on drop
#[derive(Debug)]
pub struct OverrideGuard<'a> {
    controller: &'a Controller,
    previous: Switch,
}

impl Drop for OverrideGuard<'_> {
    fn drop(&mut self) {
        self.controller.set(self.previous);
    }
}

static GLOBAL: LazyLock<Controller> = LazyLock::new(Controller::new);

/// The process-wide controller
#[must_use]
pub fn global() -> &'static Controller {
    &GLOBAL
}

/// Layers for one cache instance: environment, instance, global
fn layers(instance: Option<&Controller>, pick: fn(Switch) -> Setting) -> Vec<(Layer, Setting)> {
    let mut layers = vec![(Layer::Environment, env_setting())];
    if let Some(instance) = instance {
        layers.push((Layer::Instance, pick(instance.switch())));
    }
    layers.push((Layer::Global, pick(global().switch())));
    layers
}

/// Whether a cache with the given instance controller may be read
#[must_use]
pub fn read_decision(instance: Option<&Controller>) -> Decision {
    effective(&layers(instance, |s| s.read))
}

/// Whether a cache with the given instance controller may be written
#[must_use]
pub fn write_decision(instance: Option<&Controller>) -> Decision {
    effective(&layers(instance, |s| s.write))
}
