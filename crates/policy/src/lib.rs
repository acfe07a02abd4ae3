//! Enable/disable policy for memento caches
//!
//! Whether a memoized call may read from or write to its cache is decided
//! outside the cache engine, from three layers in precedence order:
//!
//! 1. the environment (`MEMENTO_ENABLED` / `MEMENTO_DISABLED`)
//! 2. the cache instance's own [`Controller`]
//! 3. the process-wide [`global`] controller
//!
//! An explicit disable in any layer wins over an explicit enable in any
//! layer. When nothing is set, caching is off.
//!
//! ```
//! use memento_policy::{read_decision, Controller};
//!
//! let instance = Controller::new();
//! let _guard = instance.enable(true, true);
//! let decision = read_decision(Some(&instance));
//! # let _ = decision;
//! ```

mod controller;
mod setting;

pub use controller::{
    Controller, DISABLED_ENV, ENABLED_ENV, OverrideGuard, Switch, env_setting, global,
    read_decision, resolve_read, resolve_write, write_decision,
};
pub use setting::{Decision, Layer, Setting, combine, effective, resolve};
