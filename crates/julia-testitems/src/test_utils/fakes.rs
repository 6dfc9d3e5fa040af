//! In-memory stand-ins for the editor and the Julia process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::julia_subprocess::{RunnerError, TestExecutor};
use crate::presentation::{ErrorOverlay, Presenter, ResourceSnapshot, ViewState};
use crate::protocol::{RunTestitemRequest, TestRunResult};
use crate::resource::ResourceKey;

/// What a [`FakeExecutor`] run produces
#[derive(Debug, Clone)]
pub enum FakeOutcome {
    Result(TestRunResult),
    /// Same error as a process exiting with a non-zero status
    ExitFailure,
    /// Same error as unparsable stdout
    Malformed,
    Panic,
}

/// Test executor that never starts a process.
///
/// When created with [`FakeExecutor::gated`], every run waits for one permit
/// on the returned semaphore, which lets tests keep a run in flight.
pub struct FakeExecutor {
    outcome: Mutex<FakeOutcome>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<RunTestitemRequest>>,
}

impl FakeExecutor {
    pub fn new(outcome: FakeOutcome) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            gate: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn gated(outcome: FakeOutcome) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut executor = Self::new(outcome);
        executor.gate = Some(gate.clone());
        (executor, gate)
    }

    pub fn set_outcome(&self, outcome: FakeOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RunTestitemRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestExecutor for FakeExecutor {
    async fn run(&self, request: &RunTestitemRequest) -> Result<TestRunResult, RunnerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let outcome = self.outcome.lock().unwrap().clone();
        match outcome {
            FakeOutcome::Result(result) => Ok(result),
            FakeOutcome::ExitFailure => Err(RunnerError::Failed {
                status: exit_failure_status(),
                stderr: "ERROR: LoadError: boom".to_string(),
            }),
            FakeOutcome::Malformed => Err(crate::julia_subprocess::parse_run_output("garbage")
                .expect_err("garbage is not a test result")),
            FakeOutcome::Panic => panic!("test executor panicked"),
        }
    }
}

#[cfg(unix)]
fn exit_failure_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1 << 8)
}

#[cfg(windows)]
fn exit_failure_status() -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}

/// Calls received by a [`RecordingPresenter`]
#[derive(Debug, Clone, PartialEq)]
pub enum PresenterEvent {
    Render(ResourceSnapshot),
    Clear(ResourceKey),
    ShowOverlay(ResourceKey, ErrorOverlay),
    EraseOverlay(ResourceKey, String),
    Status(String),
    Open(ResourceKey, u32),
}

/// Presenter that records every call.
///
/// Resources are invisible until [`RecordingPresenter::show`] or
/// `open_at` is called for them.
pub struct RecordingPresenter {
    events: Mutex<Vec<PresenterEvent>>,
    visible: Mutex<HashSet<ResourceKey>>,
    open_state: Mutex<ViewState>,
}

impl Default for RecordingPresenter {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            visible: Mutex::new(HashSet::new()),
            open_state: Mutex::new(ViewState::Ready),
        }
    }
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&self, key: &ResourceKey) {
        self.visible.lock().unwrap().insert(key.clone());
    }

    /// View state returned by subsequent `open_at` calls
    pub fn set_open_state(&self, state: ViewState) {
        *self.open_state.lock().unwrap() = state;
    }

    pub fn events(&self) -> Vec<PresenterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take_events(&self) -> Vec<PresenterEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn renders(&self) -> Vec<ResourceSnapshot> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PresenterEvent::Render(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    pub fn status_messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PresenterEvent::Status(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: PresenterEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Presenter for RecordingPresenter {
    fn is_visible(&self, key: &ResourceKey) -> bool {
        self.visible.lock().unwrap().contains(key)
    }

    fn render(&self, snapshot: &ResourceSnapshot) {
        self.record(PresenterEvent::Render(snapshot.clone()));
    }

    fn clear(&self, key: &ResourceKey) {
        self.record(PresenterEvent::Clear(key.clone()));
    }

    fn show_error_overlay(&self, key: &ResourceKey, overlay: &ErrorOverlay) {
        self.record(PresenterEvent::ShowOverlay(key.clone(), overlay.clone()));
    }

    fn erase_overlay(&self, key: &ResourceKey, overlay_key: &str) {
        self.record(PresenterEvent::EraseOverlay(key.clone(), overlay_key.to_string()));
    }

    fn status_message(&self, message: &str) {
        self.record(PresenterEvent::Status(message.to_string()));
    }

    fn open_at(&self, key: &ResourceKey, line: u32) -> ViewState {
        self.record(PresenterEvent::Open(key.clone(), line));
        self.show(key);
        *self.open_state.lock().unwrap()
    }
}
