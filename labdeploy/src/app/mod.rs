//! Application entry points used by the binary

pub mod options;
pub mod run;
