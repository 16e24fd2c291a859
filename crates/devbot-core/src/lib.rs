//! Connection lifecycle supervisor and command gate for the dev-helper bot.
//!
//! This crate is intentionally backend-agnostic. The messaging SDK lives behind
//! the `transport` ports (traits) implemented in adapter crates; the command
//! layer sits behind `dispatch::CommandDispatcher`.

pub mod backoff;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod gate;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use errors::{Error, Result};
