//! labdeploy Library
//!
//! Packages rendered network lab configuration, ships it to remote emulation
//! hosts and starts the labs there.

pub mod app;
pub mod compile;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod notify;
pub mod shutdown;
pub mod transport;
pub mod utils;
