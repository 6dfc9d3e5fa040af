//! Shared fixtures and fakes for unit tests.
//!
//! Compiled for `cargo test` and when the `test-support` feature is enabled,
//! never into release builds.

pub mod fakes;
pub mod fixtures;

pub use fakes::{FakeExecutor, FakeOutcome, PresenterEvent, RecordingPresenter};
pub use fixtures::{item, publish, result, runnable_item, test_uri};
