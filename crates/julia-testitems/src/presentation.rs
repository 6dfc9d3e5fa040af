//
// presentation.rs
//
// Contract between the test item core and the editor that draws annotations
//

use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::{Position, Range, Url};

use crate::protocol::TestItemStatus;
use crate::resource::ResourceKey;
use crate::store::ResourceTestState;
use crate::token::RunToken;

pub const RUN_TEST_LABEL: &str = "Run Test";
pub const RUNNING_LABEL: &str = "Running…";
pub const CRASHED_NOTICE: &str = "The test process crashed while running this testitem.\n\
Please check the console and consider to create an issue report in the LSP-julia GitHub repo.";

const ERROR_KEY_PREFIX: &str = "lsp_julia_testitem_error_";

/// Whether a view for a resource can be drawn into right away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Ready,
    Loading,
}

/// A single line annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    pub position: Position,
    pub text: String,
    /// Present when clicking the annotation should start a run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RunToken>,
}

/// Annotations sharing one status (and thus one icon and scope)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationGroup {
    pub status: TestItemStatus,
    pub navigable: bool,
    pub entries: Vec<AnnotationEntry>,
}

/// Everything an editor needs to draw the test items of one resource.
///
/// Groups are always present for every status, in [`TestItemStatus::ALL`]
/// order, so an empty group tells the renderer to erase what it drew before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub path: String,
    pub uri: Url,
    pub version: i32,
    pub groups: Vec<AnnotationGroup>,
}

impl ResourceSnapshot {
    pub fn group(&self, status: TestItemStatus) -> &AnnotationGroup {
        // Every status has a group, see `snapshot`.
        &self.groups[TestItemStatus::ALL
            .iter()
            .position(|s| *s == status)
            .unwrap_or_default()]
    }
}

/// A dismissable inline message at the location of a failed assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOverlay {
    pub key: String,
    pub range: Range,
    pub message: String,
}

/// Editor-side collaborator that draws test item state.
///
/// Implementations are called from the control loop only.
pub trait Presenter: Send + Sync {
    /// Whether the resource is open and its annotations should be drawn
    fn is_visible(&self, key: &ResourceKey) -> bool;

    fn render(&self, snapshot: &ResourceSnapshot);

    /// Erase every test item annotation of a resource
    fn clear(&self, key: &ResourceKey);

    fn show_error_overlay(&self, key: &ResourceKey, overlay: &ErrorOverlay);

    fn erase_overlay(&self, key: &ResourceKey, overlay_key: &str);

    /// Transient message for the user (status bar)
    fn status_message(&self, message: &str);

    /// Open (or focus) the resource scrolled to a zero-based line
    fn open_at(&self, key: &ResourceKey, line: u32) -> ViewState;
}

/// Elapsed-time suffix for an annotation: `(42ms)` or `(1.50s)`.
pub fn format_duration(duration: Option<f64>) -> Option<String> {
    let duration = duration?;
    if duration < 100.0 {
        Some(format!("({}ms)", duration.round()))
    } else {
        Some(format!("({:.2}s)", duration / 1000.0))
    }
}

fn run_annotation(duration: Option<f64>) -> String {
    match format_duration(duration) {
        Some(suffix) => format!("{RUN_TEST_LABEL} {suffix}"),
        None => RUN_TEST_LABEL.to_string(),
    }
}

/// Build the render snapshot of a resource.
pub fn snapshot(key: &ResourceKey, state: &ResourceTestState) -> ResourceSnapshot {
    let mut groups: Vec<AnnotationGroup> = TestItemStatus::ALL
        .into_iter()
        .map(|status| AnnotationGroup {
            status,
            navigable: status.is_navigable(),
            entries: Vec::new(),
        })
        .collect();

    let group_index = |status: TestItemStatus| {
        TestItemStatus::ALL
            .iter()
            .position(|s| *s == status)
            .unwrap_or_default()
    };

    for (idx, (item, result)) in state.items.iter().zip(&state.status).enumerate() {
        if let Some(error) = item.error_message() {
            groups[group_index(TestItemStatus::Invalid)]
                .entries
                .push(AnnotationEntry {
                    position: item.range.start,
                    text: error.to_string(),
                    token: None,
                });
            continue;
        }
        let text = match result.status {
            TestItemStatus::Pending => RUNNING_LABEL.to_string(),
            TestItemStatus::Invalid => CRASHED_NOTICE.to_string(),
            _ => run_annotation(result.duration),
        };
        let token = result.status.is_navigable().then(|| state.token(idx));
        groups[group_index(result.status)].entries.push(AnnotationEntry {
            position: item.range.start,
            text,
            token,
        });
    }

    for error in &state.errors {
        groups[group_index(TestItemStatus::Invalid)]
            .entries
            .push(AnnotationEntry {
                position: error.range.start,
                text: error.error.clone(),
                token: None,
            });
    }

    ResourceSnapshot {
        path: key.to_string(),
        uri: state.uri.clone(),
        version: state.version,
        groups,
    }
}

pub fn error_key(item_id: &str, message_idx: usize) -> String {
    format!("{ERROR_KEY_PREFIX}{item_id}_{message_idx}")
}

/// Prefix matching the overlay keys of one item, or of all items when `None`
pub fn error_key_prefix(item_id: Option<&str>) -> String {
    match item_id {
        Some(id) => format!("{ERROR_KEY_PREFIX}{id}_"),
        None => ERROR_KEY_PREFIX.to_string(),
    }
}

/// Overlays for the result at `index`, one per message that has a location.
pub fn error_overlays(state: &ResourceTestState, index: usize) -> Vec<ErrorOverlay> {
    let (Some(item), Some(result)) = (state.items.get(index), state.status.get(index)) else {
        return Vec::new();
    };
    if !result.status.is_failure() {
        return Vec::new();
    }
    let Some(messages) = &result.message else {
        return Vec::new();
    };

    messages
        .iter()
        .enumerate()
        .filter_map(|(message_idx, message)| {
            let location = message.location.as_ref()?;
            Some(ErrorOverlay {
                key: error_key(&item.id, message_idx),
                range: location.range,
                message: message.message.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TestErrorDetail, TestMessage, TestRunResult};
    use crate::store::TestItemStore;
    use crate::test_utils::{item, publish, result};
    use tower_lsp::lsp_types::Location;

    fn key() -> ResourceKey {
        ResourceKey::from_uri(&Url::parse("file:///pkg/test/runtests.jl").unwrap())
    }

    fn location(line: u32) -> Location {
        Location::new(
            Url::parse("file:///pkg/test/runtests.jl").unwrap(),
            Range::new(Position::new(line, 4), Position::new(line, 20)),
        )
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Some(42.0)), Some("(42ms)".to_string()));
        assert_eq!(format_duration(Some(1500.0)), Some("(1.50s)".to_string()));
        assert_eq!(format_duration(Some(99.4)), Some("(99ms)".to_string()));
        assert_eq!(format_duration(Some(100.0)), Some("(0.10s)".to_string()));
        assert_eq!(format_duration(None), None);
    }

    #[test]
    fn test_run_annotation_suffix() {
        assert_eq!(run_annotation(Some(42.0)), "Run Test (42ms)");
        assert_eq!(run_annotation(None), "Run Test");
    }

    #[test]
    fn test_snapshot_groups_by_status() {
        let mut store = TestItemStore::new();
        store.update(
            &key(),
            publish(Some(4), vec![item("1", 0), item("2", 5), item("3", 9), item("4", 12)]),
        );
        let mut passed = result(TestItemStatus::Passed);
        passed.duration = Some(1500.0);
        store.set_result(&key(), 0, passed);
        store.set_status(&key(), 1, TestItemStatus::Pending);
        store.set_status(&key(), 2, TestItemStatus::Invalid);

        let snap = snapshot(&key(), store.get(&key()).unwrap());
        assert_eq!(snap.version, 4);
        assert_eq!(snap.groups.len(), 6);

        let passed = snap.group(TestItemStatus::Passed);
        assert!(passed.navigable);
        assert_eq!(passed.entries.len(), 1);
        assert_eq!(passed.entries[0].text, "Run Test (1.50s)");
        assert_eq!(passed.entries[0].position, Position::new(0, 0));
        assert_eq!(
            passed.entries[0].token.as_ref().unwrap().to_string(),
            "file:///pkg/test/runtests.jl#idx=0&version=4"
        );

        let pending = snap.group(TestItemStatus::Pending);
        assert!(!pending.navigable);
        assert_eq!(pending.entries[0].text, RUNNING_LABEL);
        assert!(pending.entries[0].token.is_none());

        let invalid = snap.group(TestItemStatus::Invalid);
        assert!(!invalid.navigable);
        assert_eq!(invalid.entries[0].text, CRASHED_NOTICE);

        let undetermined = snap.group(TestItemStatus::Undetermined);
        assert_eq!(undetermined.entries.len(), 1);
        assert_eq!(undetermined.entries[0].token.as_ref().unwrap().index, 3);
        assert!(snap.group(TestItemStatus::Failed).entries.is_empty());
    }

    #[test]
    fn test_snapshot_includes_test_errors() {
        let mut store = TestItemStore::new();
        let mut params = publish(Some(1), vec![]);
        params.testerrordetails.push(TestErrorDetail {
            id: String::new(),
            label: String::new(),
            range: Range::new(Position::new(7, 0), Position::new(7, 9)),
            error: "Your @testitem must have a name.".to_string(),
        });
        store.update(&key(), params);

        let snap = snapshot(&key(), store.get(&key()).unwrap());
        let invalid = snap.group(TestItemStatus::Invalid);
        assert_eq!(invalid.entries.len(), 1);
        assert_eq!(invalid.entries[0].text, "Your @testitem must have a name.");
        assert_eq!(invalid.entries[0].position, Position::new(7, 0));
    }

    #[test]
    fn test_snapshot_draws_broken_item_as_invalid() {
        let mut store = TestItemStore::new();
        let mut broken = item("a", 3);
        broken.error = Some("Your @testitem must have a name.".to_string());
        store.update(&key(), publish(Some(1), vec![broken, item("b", 8)]));

        let snap = snapshot(&key(), store.get(&key()).unwrap());
        let invalid = snap.group(TestItemStatus::Invalid);
        assert_eq!(invalid.entries.len(), 1);
        assert_eq!(invalid.entries[0].text, "Your @testitem must have a name.");
        assert_eq!(invalid.entries[0].position, Position::new(3, 0));
        assert!(invalid.entries[0].token.is_none());

        let undetermined = snap.group(TestItemStatus::Undetermined);
        assert_eq!(undetermined.entries.len(), 1);
        assert_eq!(undetermined.entries[0].token.as_ref().unwrap().index, 1);
    }

    #[test]
    fn test_error_overlays_only_for_located_failures() {
        let mut store = TestItemStore::new();
        store.update(&key(), publish(Some(1), vec![item("adds", 0), item("subs", 6)]));
        store.set_result(
            &key(),
            0,
            TestRunResult {
                status: TestItemStatus::Failed,
                message: Some(vec![
                    TestMessage {
                        message: "Test Failed\n  Expression: 1 == 2".to_string(),
                        location: Some(location(2)),
                    },
                    TestMessage {
                        message: "no location".to_string(),
                        location: None,
                    },
                    TestMessage {
                        message: "second".to_string(),
                        location: Some(location(3)),
                    },
                ]),
                duration: Some(3.0),
            },
        );
        store.set_result(&key(), 1, result(TestItemStatus::Passed));

        let state = store.get(&key()).unwrap();
        let overlays = error_overlays(state, 0);
        assert_eq!(overlays.len(), 2);
        assert_eq!(overlays[0].key, "lsp_julia_testitem_error_adds_0");
        assert_eq!(overlays[0].range.start, Position::new(2, 4));
        assert_eq!(overlays[1].key, "lsp_julia_testitem_error_adds_2");
        assert!(error_overlays(state, 1).is_empty());
        assert!(error_overlays(state, 5).is_empty());
    }

    #[test]
    fn test_error_key_prefix() {
        assert!(error_key("adds", 0).starts_with(&error_key_prefix(Some("adds"))));
        assert!(!error_key("adds2", 0).starts_with(&error_key_prefix(Some("adds"))));
        assert!(error_key("adds2", 0).starts_with(&error_key_prefix(None)));
    }
}
