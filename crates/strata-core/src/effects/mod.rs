//! Effect traits and their production handlers

pub mod runtime;
pub mod task_registry;

pub use runtime::{RuntimeEffects, SharedRuntime, Task, TimerHandle};
pub use task_registry::TaskRegistry;
