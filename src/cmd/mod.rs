//! CLI command implementations.
//!
//! | Module   | Commands handled                                   |
//! |----------|----------------------------------------------------|
//! | `serve`  | `Serve`                                            |
//! | `client` | `Build`, `Rebuild`, `Test`, `Status`, `Cancel`, `Jobs` |
//! | `config` | `Config`                                           |

pub mod client;
pub mod config;
pub mod serve;

pub use client::{cmd_build, cmd_cancel, cmd_jobs, cmd_status, cmd_test};
pub use config::cmd_config;
pub use serve::cmd_serve;
