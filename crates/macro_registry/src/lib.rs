//! Named macro bodies that can be replaced while other callers are executing them.

mod registry;
mod syntax;
mod watcher;

pub use registry::{MacroRegistry, MacroRegistryConfig, MacroRun, MacroRunner, ReloadError};
pub use syntax::{parse, MacroBlock, MacroProgram, MacroStep, MacroSyntaxError};
pub use watcher::{MacroDirWatcher, WatchOutcome};
