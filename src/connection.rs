// src/connection.rs
//
// Per-profile connection lifecycle: keep exactly one live transport link
// per profile and recover from every failure mode without manual help.

pub mod manager;

pub use manager::{ConnectionManager, EventHandler};
