//
// coordinator.rs
//
// Control loop for test items: applies publish notifications, admits runs,
// and applies run results. The loop is the only mutator of the store;
// background runs report back through the control channel.
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::julia_subprocess::{RunnerError, TestExecutor};
use crate::presentation::{error_key_prefix, error_overlays, snapshot, Presenter, ViewState};
use crate::protocol::{PublishTestItemsParams, RunTestitemRequest, TestItemStatus, TestRunResult};
use crate::resource::ResourceKey;
use crate::store::{NotRunnable, PickerEntry, TestItemStore, UpdateOutcome};
use crate::token::{RunToken, TokenError};

pub const ALREADY_RUNNING_MESSAGE: &str = "Another testitem is already running";
pub const VERSION_MISMATCH_MESSAGE: &str = "Version mismatch for testitem params";

// ============================================================================
// Run lock
// ============================================================================

/// Single global permit: at most one test process runs at a time
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    held: Arc<AtomicBool>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                held: self.held.clone(),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the run lock when dropped
#[derive(Debug)]
pub struct RunPermit {
    held: Arc<AtomicBool>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Completion report of a background run
#[derive(Debug)]
pub struct RunFinished {
    pub key: ResourceKey,
    pub index: usize,
    pub version: i32,
    pub outcome: Result<TestRunResult, RunnerError>,
    permit: RunPermit,
}

/// Requests processed by the control loop, in arrival order
#[derive(Debug)]
pub enum ControlMessage {
    Publish(PublishTestItemsParams),
    Run {
        href: String,
        focus: bool,
    },
    RunFinished(RunFinished),
    /// Redraw a resource, used after a view finished loading
    Refresh(ResourceKey),
    ClearErrorAnnotations {
        key: ResourceKey,
        item_id: Option<String>,
    },
    HideAnnotation {
        key: ResourceKey,
        overlay_key: String,
    },
    Reconfigure {
        executor: Arc<dyn TestExecutor>,
        focus_delay: Duration,
    },
    ListItems(oneshot::Sender<PickerList>),
    Shutdown,
}

/// Picker rows plus whether a run could be started right now
#[derive(Debug, Clone, Serialize)]
pub struct PickerList {
    pub entries: Vec<PickerEntry>,
    pub enabled: bool,
}

/// Result of a run request
#[derive(Debug, Clone, PartialEq)]
pub enum RunAdmission {
    Started,
    AlreadyRunning,
    VersionMismatch,
    InvalidToken(TokenError),
    NotRunnable(NotRunnable),
}

// ============================================================================
// Controller
// ============================================================================

/// Cloneable sender side of the control loop
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    sender: mpsc::UnboundedSender<ControlMessage>,
}

impl ControllerHandle {
    fn send(&self, message: ControlMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn publish(&self, params: PublishTestItemsParams) -> bool {
        self.send(ControlMessage::Publish(params))
    }

    pub fn run(&self, href: impl Into<String>, focus: bool) -> bool {
        self.send(ControlMessage::Run {
            href: href.into(),
            focus,
        })
    }

    pub fn clear_error_annotations(&self, key: ResourceKey, item_id: Option<String>) -> bool {
        self.send(ControlMessage::ClearErrorAnnotations { key, item_id })
    }

    pub fn hide_annotation(&self, key: ResourceKey, overlay_key: String) -> bool {
        self.send(ControlMessage::HideAnnotation { key, overlay_key })
    }

    pub fn refresh(&self, key: ResourceKey) -> bool {
        self.send(ControlMessage::Refresh(key))
    }

    pub fn reconfigure(&self, executor: Arc<dyn TestExecutor>, focus_delay: Duration) -> bool {
        self.send(ControlMessage::Reconfigure {
            executor,
            focus_delay,
        })
    }

    pub async fn list_items(&self) -> Option<PickerList> {
        let (reply, receiver) = oneshot::channel();
        if !self.send(ControlMessage::ListItems(reply)) {
            return None;
        }
        receiver.await.ok()
    }

    pub fn shutdown(&self) -> bool {
        self.send(ControlMessage::Shutdown)
    }
}

/// Owner of all test item state
pub struct TestItemController {
    store: TestItemStore,
    run_lock: RunLock,
    presenter: Arc<dyn Presenter>,
    executor: Arc<dyn TestExecutor>,
    focus_delay: Duration,
    sender: mpsc::UnboundedSender<ControlMessage>,
}

impl TestItemController {
    /// Create a controller and the receiving end of its control channel.
    ///
    /// Pass the receiver to [`TestItemController::run`], or drain it
    /// manually with [`TestItemController::handle_message`].
    pub fn new(
        presenter: Arc<dyn Presenter>,
        executor: Arc<dyn TestExecutor>,
        focus_delay: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            store: TestItemStore::new(),
            run_lock: RunLock::new(),
            presenter,
            executor,
            focus_delay,
            sender,
        };
        (controller, receiver)
    }

    /// Start the control loop on the current runtime
    pub fn spawn(
        presenter: Arc<dyn Presenter>,
        executor: Arc<dyn TestExecutor>,
        focus_delay: Duration,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (controller, receiver) = Self::new(presenter, executor, focus_delay);
        let handle = controller.handle();
        let task = tokio::spawn(controller.run(receiver));
        (handle, task)
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn store(&self) -> &TestItemStore {
        &self.store
    }

    /// Whether a test item run is in flight
    pub fn is_running(&self) -> bool {
        self.run_lock.is_held()
    }

    /// Whether the run picker should be offered
    pub fn can_run_any(&self) -> bool {
        !self.is_running() && self.store.has_runnable_items()
    }

    /// Process messages until shutdown
    pub async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ControlMessage>) {
        log::info!("Test item control loop started");
        while let Some(message) = receiver.recv().await {
            if !self.handle_message(message) {
                break;
            }
        }
        log::info!("Test item control loop stopped");
    }

    /// Apply one control message. Returns `false` on shutdown.
    pub fn handle_message(&mut self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::Publish(params) => self.handle_publish(params),
            ControlMessage::Run { href, focus } => {
                let admission = self.run_href(&href, focus);
                log::trace!("Run request {} -> {:?}", href, admission);
            }
            ControlMessage::RunFinished(finished) => self.apply_result(finished),
            ControlMessage::Refresh(key) => self.render(&key, None),
            ControlMessage::ClearErrorAnnotations { key, item_id } => {
                self.clear_error_annotations(&key, item_id.as_deref())
            }
            ControlMessage::HideAnnotation { key, overlay_key } => {
                self.hide_annotation(&key, &overlay_key)
            }
            ControlMessage::Reconfigure {
                executor,
                focus_delay,
            } => {
                log::info!("Test item runner reconfigured");
                self.executor = executor;
                self.focus_delay = focus_delay;
            }
            ControlMessage::ListItems(reply) => {
                let _ = reply.send(PickerList {
                    entries: self.store.picker_entries(),
                    enabled: self.can_run_any(),
                });
            }
            ControlMessage::Shutdown => return false,
        }
        true
    }

    /// Handle a `julia/publishTestitems` notification
    pub fn handle_publish(&mut self, params: PublishTestItemsParams) {
        let key = ResourceKey::from_uri(&params.uri);
        match self.store.update(&key, params) {
            UpdateOutcome::Unchanged => {}
            UpdateOutcome::Removed => {
                if self.presenter.is_visible(&key) {
                    self.presenter.clear(&key);
                }
            }
            UpdateOutcome::Updated => self.render(&key, None),
        }
    }

    /// Parse a run token and start the run
    pub fn run_href(&mut self, href: &str, focus: bool) -> RunAdmission {
        match RunToken::parse(href) {
            Ok(token) => self.run_test_item(&token, focus),
            Err(err) => {
                log::warn!("Ignoring run request with invalid token {}: {}", href, err);
                RunAdmission::InvalidToken(err)
            }
        }
    }

    /// Admit and start a run for the test item identified by `token`.
    ///
    /// The permit is taken first; every refusal below drops it again.
    pub fn run_test_item(&mut self, token: &RunToken, focus: bool) -> RunAdmission {
        let Some(permit) = self.run_lock.try_acquire() else {
            self.presenter.status_message(ALREADY_RUNNING_MESSAGE);
            return RunAdmission::AlreadyRunning;
        };

        let key = ResourceKey::from_uri(&token.uri);
        if self.store.stored_version(&key) != Some(token.version) {
            self.presenter.status_message(VERSION_MISMATCH_MESSAGE);
            return RunAdmission::VersionMismatch;
        }

        let request = match self.store.run_request(&key, token.index) {
            Ok(request) => request,
            Err(reason) => {
                log::debug!(
                    "Not running test item {} of {}: {}",
                    token.index,
                    key,
                    reason
                );
                return RunAdmission::NotRunnable(reason);
            }
        };

        let item_id = self
            .store
            .get(&key)
            .and_then(|state| state.items.get(token.index))
            .map(|item| item.id.clone());
        self.store
            .set_status(&key, token.index, TestItemStatus::Pending);
        let line = request.line;

        log::info!("Running test item '{}' in {}", request.name, key);
        self.spawn_run(key.clone(), token.index, token.version, request, permit);

        if focus && self.presenter.open_at(&key, line) == ViewState::Loading {
            self.schedule_deferred_refresh(key, item_id);
            return RunAdmission::Started;
        }

        self.render(&key, None);
        self.clear_error_annotations(&key, item_id.as_deref());
        RunAdmission::Started
    }

    fn spawn_run(
        &self,
        key: ResourceKey,
        index: usize,
        version: i32,
        request: RunTestitemRequest,
        permit: RunPermit,
    ) {
        let executor = self.executor.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let name = request.name.clone();
            let worker = tokio::spawn(async move { executor.run(&request).await });
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(RunnerError::Aborted(join_error.to_string())),
            };
            let finished = RunFinished {
                key,
                index,
                version,
                outcome,
                permit,
            };
            if sender.send(ControlMessage::RunFinished(finished)).is_err() {
                log::warn!(
                    "Control loop closed before the result of test item '{}' arrived",
                    name
                );
            }
        });
    }

    fn schedule_deferred_refresh(&self, key: ResourceKey, item_id: Option<String>) {
        let handle = self.handle();
        let delay = self.focus_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.refresh(key.clone());
            handle.clear_error_annotations(key, item_id);
        });
    }

    /// Apply the outcome of a background run
    pub fn apply_result(&mut self, finished: RunFinished) {
        let RunFinished {
            key,
            index,
            version,
            outcome,
            permit,
        } = finished;
        drop(permit);

        if let Err(err) = &outcome {
            log::error!("Test item {} of {} failed to run: {}", index, key, err);
        }

        if !self.store.contains(&key) {
            log::debug!("Discarding test item result for removed resource {}", key);
            return;
        }

        if self.store.stored_version(&key) != Some(version) {
            // Indices may refer to different items after a republish
            let reset = self.store.reset_pending(&key);
            log::debug!(
                "Discarding stale test item result for {} (version {}), reset {} pending",
                key,
                version,
                reset
            );
            self.render(&key, None);
            return;
        }

        match outcome {
            Ok(result) => {
                log::info!(
                    "Test item {} of {} finished: {}",
                    index,
                    key,
                    result.status
                );
                self.store.set_result(&key, index, result);
                self.render(&key, Some(index));
            }
            Err(_) => {
                self.store.set_status(&key, index, TestItemStatus::Invalid);
                self.render(&key, None);
            }
        }
    }

    /// Draw a resource, adding error overlays for `highlight`.
    pub fn render(&mut self, key: &ResourceKey, highlight: Option<usize>) {
        if !self.presenter.is_visible(key) {
            return;
        }
        let Some(state) = self.store.get_mut(key) else {
            self.presenter.clear(key);
            return;
        };

        self.presenter.render(&snapshot(key, state));

        if let Some(index) = highlight {
            for overlay in error_overlays(state, index) {
                self.presenter.show_error_overlay(key, &overlay);
                state.error_keys.insert(overlay.key);
            }
        }
    }

    /// Erase a single error overlay after the user dismissed it
    pub fn hide_annotation(&mut self, key: &ResourceKey, overlay_key: &str) {
        if !self.presenter.is_visible(key) {
            return;
        }
        self.presenter.erase_overlay(key, overlay_key);
        if let Some(state) = self.store.get_mut(key) {
            state.error_keys.remove(overlay_key);
        }
    }

    /// Erase the error overlays of one item, or of all items when `item_id` is `None`
    pub fn clear_error_annotations(&mut self, key: &ResourceKey, item_id: Option<&str>) {
        if !self.presenter.is_visible(key) {
            return;
        }
        let Some(state) = self.store.get_mut(key) else {
            return;
        };
        let prefix = error_key_prefix(item_id);
        let mut cleared: Vec<String> = state
            .error_keys
            .iter()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        cleared.sort();
        for overlay_key in cleared {
            self.presenter.erase_overlay(key, &overlay_key);
            state.error_keys.remove(&overlay_key);
        }
    }
}
