//! Server-side job execution.
//!
//! ```text
//!   handler ──start(CommandSpec)──> CommandRunner ──spawn──> OS process
//!      │                               │ owns JobWriter (sole writer)
//!      │                               v
//!      └──read/subscribe/cancel──> JobRegistry ──> JobCell (per-job lock)
//! ```

pub mod registry;
pub mod runner;

pub use registry::{JobCell, JobRegistry, JobWriter, RetentionPolicy};
pub use runner::{CommandRunner, CommandSpec, RunnerSettings};
