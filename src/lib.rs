//! Poolgate - a process manager / request router
//!
//! Poolgate keeps a fixed-size pool of long-lived worker processes alive,
//! each hosting a pre-booted application, and splices incoming TCP
//! connections to the least-loaded idle worker. It provides:
//! - Worker supervision: spawn, register, bootstrap, ready, crash respawn
//! - A newline-delimited JSON control protocol on a private socket
//! - A byte-transparent front-end dispatcher with buffer-until-assigned
//! - Recycling of workers after a configurable number of requests
//! - A polling file watcher driving rolling restarts in debug mode
//! - Emergency mode: a failed bootstrap in debug holds the pool closed
//!   until a source file changes

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod slot;
pub mod supervisor;
pub mod watcher;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
