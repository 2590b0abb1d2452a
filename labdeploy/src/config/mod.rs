//! Settings file, workspace layout and SSH key discovery

pub mod layout;
pub mod settings;
pub mod ssh_keys;
