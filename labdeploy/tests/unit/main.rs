//! Integration tests for labdeploy

mod test_coordinator;
mod test_driver;
mod test_packager;
