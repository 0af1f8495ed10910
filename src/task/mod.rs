//! Task Spec, Task Handle & Lifecycle (C4), Task Store (C3) — spec §3, §4.3,
//! §4.8.

pub mod exec;
pub mod handle;
pub mod spec;
pub mod state;
pub mod store;

pub use handle::{DriverNetwork, TaskHandle};
pub use spec::TaskSpec;
pub use state::{ExitResult, TaskState};
pub use store::TaskStore;
