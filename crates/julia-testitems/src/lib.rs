// lib.rs - Test item tracking and execution for Julia packages.
//
// The binary entry point lives in main.rs; everything else is exposed here
// so integration tests can drive the control loop directly.

pub mod config;
pub mod coordinator;
pub mod host;
pub mod julia_subprocess;
pub mod presentation;
pub mod protocol;
pub mod reconcile;
pub mod resource;
pub mod store;
// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
pub mod token;
