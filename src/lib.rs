pub mod client;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod server;
pub mod telemetry;
pub mod util;

pub use devjobs_common as common;
