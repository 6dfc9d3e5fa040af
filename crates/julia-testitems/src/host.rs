//
// host.rs
//
// JSON-RPC server bridging an editor to the test item control loop
//

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use crate::config::{parse_testitems_config, TestItemsConfig};
use crate::coordinator::{ControllerHandle, PickerList, TestItemController};
use crate::julia_subprocess::JuliaSubprocess;
use crate::presentation::{ErrorOverlay, Presenter, ResourceSnapshot, ViewState};
use crate::protocol::{PublishTestItemsParams, PUBLISH_TESTITEMS_METHOD};
use crate::resource::ResourceKey;

// ============================================================================
// Inbound parameters
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RunParams {
    pub href: String,
    #[serde(default)]
    pub focus: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HideAnnotationParams {
    pub uri: Url,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClearErrorAnnotationsParams {
    pub uri: Url,
    #[serde(default)]
    pub id: Option<String>,
}

/// Sent by the editor when a view is shown, hidden or finished loading
#[derive(Debug, Clone, Deserialize)]
pub struct VisibilityParams {
    pub uri: Url,
    pub visible: bool,
    #[serde(default)]
    pub loading: bool,
}

// ============================================================================
// Outbound notifications
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearParams {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowErrorParams {
    pub path: String,
    #[serde(flatten)]
    pub overlay: ErrorOverlay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraseErrorParams {
    pub path: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusParams {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAtParams {
    pub path: String,
    pub line: u32,
}

pub enum RenderTestItems {}

impl Notification for RenderTestItems {
    type Params = ResourceSnapshot;
    const METHOD: &'static str = "testitems/render";
}

pub enum ClearTestItems {}

impl Notification for ClearTestItems {
    type Params = ClearParams;
    const METHOD: &'static str = "testitems/clear";
}

pub enum ShowTestError {}

impl Notification for ShowTestError {
    type Params = ShowErrorParams;
    const METHOD: &'static str = "testitems/showError";
}

pub enum EraseTestError {}

impl Notification for EraseTestError {
    type Params = EraseErrorParams;
    const METHOD: &'static str = "testitems/eraseError";
}

pub enum StatusMessage {}

impl Notification for StatusMessage {
    type Params = StatusParams;
    const METHOD: &'static str = "testitems/statusMessage";
}

pub enum OpenAt {}

impl Notification for OpenAt {
    type Params = OpenAtParams;
    const METHOD: &'static str = "testitems/openAt";
}

/// Presenter call queued for delivery to the editor
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Render(ResourceSnapshot),
    Clear(ClearParams),
    ShowError(ShowErrorParams),
    EraseError(EraseErrorParams),
    Status(StatusParams),
    OpenAt(OpenAtParams),
}

impl OutboundEvent {
    async fn send(self, client: &Client) {
        match self {
            OutboundEvent::Render(params) => {
                client.send_notification::<RenderTestItems>(params).await
            }
            OutboundEvent::Clear(params) => client.send_notification::<ClearTestItems>(params).await,
            OutboundEvent::ShowError(params) => {
                client.send_notification::<ShowTestError>(params).await
            }
            OutboundEvent::EraseError(params) => {
                client.send_notification::<EraseTestError>(params).await
            }
            OutboundEvent::Status(params) => client.send_notification::<StatusMessage>(params).await,
            OutboundEvent::OpenAt(params) => client.send_notification::<OpenAt>(params).await,
        }
    }
}

// ============================================================================
// Presenter
// ============================================================================

/// Presenter backed by editor notifications.
///
/// Calls are queued in order and delivered by a single forwarding task, so
/// the control loop never waits on the editor.
pub struct ClientPresenter {
    views: DashMap<ResourceKey, ViewState>,
    events: mpsc::UnboundedSender<OutboundEvent>,
}

impl ClientPresenter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let presenter = Self {
            views: DashMap::new(),
            events,
        };
        (presenter, receiver)
    }

    pub fn set_visibility(&self, key: ResourceKey, visible: bool, loading: bool) {
        if visible {
            let state = if loading {
                ViewState::Loading
            } else {
                ViewState::Ready
            };
            self.views.insert(key, state);
        } else {
            self.views.remove(&key);
        }
    }

    fn emit(&self, event: OutboundEvent) {
        if self.events.send(event).is_err() {
            log::trace!("Dropping editor notification, client connection closed");
        }
    }
}

impl Presenter for ClientPresenter {
    fn is_visible(&self, key: &ResourceKey) -> bool {
        self.views.contains_key(key)
    }

    fn render(&self, snapshot: &ResourceSnapshot) {
        self.emit(OutboundEvent::Render(snapshot.clone()));
    }

    fn clear(&self, key: &ResourceKey) {
        self.emit(OutboundEvent::Clear(ClearParams {
            path: key.to_string(),
        }));
    }

    fn show_error_overlay(&self, key: &ResourceKey, overlay: &ErrorOverlay) {
        self.emit(OutboundEvent::ShowError(ShowErrorParams {
            path: key.to_string(),
            overlay: overlay.clone(),
        }));
    }

    fn erase_overlay(&self, key: &ResourceKey, overlay_key: &str) {
        self.emit(OutboundEvent::EraseError(EraseErrorParams {
            path: key.to_string(),
            key: overlay_key.to_string(),
        }));
    }

    fn status_message(&self, message: &str) {
        self.emit(OutboundEvent::Status(StatusParams {
            message: message.to_string(),
        }));
    }

    /// A view the editor has not reported as ready is treated as loading
    fn open_at(&self, key: &ResourceKey, line: u32) -> ViewState {
        self.emit(OutboundEvent::OpenAt(OpenAtParams {
            path: key.to_string(),
            line,
        }));
        let previous = self.views.insert(key.clone(), ViewState::Ready);
        match previous {
            Some(ViewState::Ready) => ViewState::Ready,
            Some(ViewState::Loading) | None => ViewState::Loading,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct TestItemsServer {
    client: Client,
    config: RwLock<TestItemsConfig>,
    presenter: Arc<ClientPresenter>,
    controller: ControllerHandle,
}

impl TestItemsServer {
    pub fn new(client: Client, config: TestItemsConfig) -> Self {
        let (presenter, events) = ClientPresenter::new();
        let presenter = Arc::new(presenter);
        let executor = Arc::new(JuliaSubprocess::from_config(&config));
        let (controller, _task) =
            TestItemController::spawn(presenter.clone(), executor, config.focus_delay);

        let forward_client = client.clone();
        tokio::spawn(forward_events(forward_client, events));

        Self {
            client,
            config: RwLock::new(config),
            presenter,
            controller,
        }
    }

    /// Apply editor settings; restarts the runner when its settings changed
    async fn apply_settings(&self, settings: &serde_json::Value) {
        let mut config = self.config.write().await;
        let updated = parse_testitems_config(settings, config.clone());
        if updated == *config {
            return;
        }
        if config.runner_settings_changed(&updated) {
            log::info!("Test runner settings changed, new runs use the updated runner");
        }
        self.controller.reconfigure(
            Arc::new(JuliaSubprocess::from_config(&updated)),
            updated.focus_delay,
        );
        *config = updated;
    }

    async fn handle_publish(&self, params: PublishTestItemsParams) {
        log::trace!(
            "Received {} for {} ({} items, {} errors)",
            PUBLISH_TESTITEMS_METHOD,
            params.uri,
            params.testitemdetails.len(),
            params.testerrordetails.len()
        );
        self.controller.publish(params);
    }

    async fn handle_run(&self, params: RunParams) {
        self.controller.run(params.href, params.focus);
    }

    async fn handle_hide_annotation(&self, params: HideAnnotationParams) {
        self.controller
            .hide_annotation(ResourceKey::from_uri(&params.uri), params.key);
    }

    async fn handle_clear_error_annotations(&self, params: ClearErrorAnnotationsParams) {
        self.controller
            .clear_error_annotations(ResourceKey::from_uri(&params.uri), params.id);
    }

    async fn handle_visibility(&self, params: VisibilityParams) {
        let key = ResourceKey::from_uri(&params.uri);
        let became_ready = params.visible && !params.loading;
        self.presenter
            .set_visibility(key.clone(), params.visible, params.loading);
        if became_ready {
            self.controller.refresh(key);
        }
    }

    async fn handle_list(&self) -> Result<PickerList> {
        self.controller
            .list_items()
            .await
            .ok_or_else(tower_lsp::jsonrpc::Error::internal_error)
    }
}

async fn forward_events(client: Client, mut events: mpsc::UnboundedReceiver<OutboundEvent>) {
    while let Some(event) = events.recv().await {
        event.send(&client).await;
    }
    log::trace!("Editor notification forwarding stopped");
}

#[tower_lsp::async_trait]
impl LanguageServer for TestItemsServer {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing julia-testitems");

        if let Some(options) = params.initialization_options {
            self.apply_settings(&options).await;
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::NONE),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "julia-testitems".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "julia-testitems initialized")
            .await;
    }

    async fn shutdown(&self) -> Result<()> {
        self.controller.shutdown();
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let key = ResourceKey::from_uri(&params.text_document.uri);
        self.presenter.set_visibility(key.clone(), true, false);
        self.controller.refresh(key);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let key = ResourceKey::from_uri(&params.text_document.uri);
        self.presenter.set_visibility(key, false, false);
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        log::trace!("Configuration changed");
        self.apply_settings(&params.settings).await;
    }
}

pub async fn start_lsp(config: TestItemsConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(|client| TestItemsServer::new(client, config))
        .custom_method(PUBLISH_TESTITEMS_METHOD, TestItemsServer::handle_publish)
        .custom_method("testitems/run", TestItemsServer::handle_run)
        .custom_method(
            "testitems/hideAnnotation",
            TestItemsServer::handle_hide_annotation,
        )
        .custom_method(
            "testitems/clearErrorAnnotations",
            TestItemsServer::handle_clear_error_annotations,
        )
        .custom_method("testitems/visibility", TestItemsServer::handle_visibility)
        .custom_method("testitems/list", TestItemsServer::handle_list)
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
