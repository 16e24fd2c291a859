//! Backend-agnostic transport abstractions. Adapter crates implement the ports.

pub mod port;
pub mod types;
