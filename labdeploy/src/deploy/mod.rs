//! Lab deployment
//!
//! Packaging, the per-host lab lifecycle and the coordinator that runs it
//! across hosts.

pub mod coordinator;
pub mod driver;
pub mod fsm;
pub mod packager;
pub mod script;
pub mod watcher;
