//! Data model shared by the dispatcher, driver and coordinator

pub mod event;
pub mod result;
pub mod target;
