//
// store.rs
//
// Version-scoped store of published test items and their run status
//

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;
use tower_lsp::lsp_types::Url;

use crate::protocol::{
    PublishTestItemsParams, RunTestitemRequest, TestErrorDetail, TestItemDetail, TestItemStatus,
    TestRunResult,
};
use crate::reconcile::carry_over_status;
use crate::resource::ResourceKey;
use crate::token::RunToken;

/// Test item state of a single resource
#[derive(Debug, Clone)]
pub struct ResourceTestState {
    /// URI as last reported by the language server
    pub uri: Url,
    /// Published (or synthesized) version of the item list
    pub version: i32,
    pub project_path: String,
    pub package_path: String,
    pub package_name: String,
    pub items: Vec<TestItemDetail>,
    pub errors: Vec<TestErrorDetail>,
    /// Parallel to `items`
    pub status: Vec<TestRunResult>,
    /// Keys of error overlays currently drawn in the editor
    pub error_keys: HashSet<String>,
}

impl ResourceTestState {
    fn same_project(&self, params: &PublishTestItemsParams) -> bool {
        self.project_path == params.project_path
            && self.package_path == params.package_path
            && self.package_name == params.package_name
    }

    fn has_environment(&self) -> bool {
        !(self.project_path.is_empty()
            && self.package_path.is_empty()
            && self.package_name.is_empty())
    }

    pub fn token(&self, index: usize) -> RunToken {
        RunToken::new(self.uri.clone(), index, self.version)
    }
}

/// Result of applying a publish notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing was stored before and nothing was published
    Unchanged,
    /// The resource no longer has test items; its annotations must be cleared
    Removed,
    /// New items were stored; the resource must be re-rendered
    Updated,
}

/// Reasons a run request cannot be built for a test item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotRunnable {
    UnknownResource,
    IndexOutOfRange(usize),
    MissingCodeRange,
    MissingCode,
    MissingEnvironment,
    /// The item was published with an error and cannot run
    Broken(String),
}

impl std::fmt::Display for NotRunnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotRunnable::UnknownResource => write!(f, "no test items stored for resource"),
            NotRunnable::IndexOutOfRange(idx) => write!(f, "no test item at index {idx}"),
            NotRunnable::MissingCodeRange => write!(f, "test item has no code range"),
            NotRunnable::MissingCode => write!(f, "test item has no code"),
            NotRunnable::MissingEnvironment => {
                write!(f, "no project path, package path or package name")
            }
            NotRunnable::Broken(error) => write!(f, "test item has an error: {error}"),
        }
    }
}

/// One row of the "Run Testitem" picker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickerEntry {
    pub label: String,
    /// Tags joined with ", "
    pub details: String,
    /// `<path>:<line>` with a 1-based line
    pub location: String,
    pub status: TestItemStatus,
    pub token: RunToken,
}

/// All test item state, keyed by canonical resource path
#[derive(Debug, Default)]
pub struct TestItemStore {
    resources: IndexMap<ResourceKey, ResourceTestState>,
}

impl TestItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a `julia/publishTestitems` notification into the store.
    pub fn update(&mut self, key: &ResourceKey, params: PublishTestItemsParams) -> UpdateOutcome {
        if params.testitemdetails.is_empty() && params.testerrordetails.is_empty() {
            return match self.resources.shift_remove(key) {
                Some(_) => {
                    log::trace!("Removed test items for {}", key);
                    UpdateOutcome::Removed
                }
                None => UpdateOutcome::Unchanged,
            };
        }

        let mut status: Vec<TestRunResult> = params
            .testitemdetails
            .iter()
            .map(|item| {
                let mut result = TestRunResult::undetermined();
                if !item.is_runnable() {
                    result.status = TestItemStatus::Invalid;
                }
                result
            })
            .collect();

        let previous = self.resources.get(key);
        let (version, error_keys) = match previous {
            Some(old) if old.same_project(&params) => {
                let version = params.version.unwrap_or_else(|| old.version.saturating_add(1));
                carry_over_status(&old.items, &old.status, &params.testitemdetails, &mut status);
                (version, old.error_keys.clone())
            }
            Some(old) => {
                log::trace!(
                    "Project identity changed for {}, discarding previous status",
                    key
                );
                (params.version.unwrap_or(0), old.error_keys.clone())
            }
            None => (params.version.unwrap_or(0), HashSet::new()),
        };

        log::trace!(
            "Stored {} test items and {} errors for {} (version {})",
            params.testitemdetails.len(),
            params.testerrordetails.len(),
            key,
            version
        );

        let state = ResourceTestState {
            uri: params.uri,
            version,
            project_path: params.project_path,
            package_path: params.package_path,
            package_name: params.package_name,
            items: params.testitemdetails,
            errors: params.testerrordetails,
            status,
            error_keys,
        };
        self.resources.insert(key.clone(), state);
        UpdateOutcome::Updated
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceTestState> {
        self.resources.get(key)
    }

    pub fn get_mut(&mut self, key: &ResourceKey) -> Option<&mut ResourceTestState> {
        self.resources.get_mut(key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    pub fn stored_version(&self, key: &ResourceKey) -> Option<i32> {
        self.resources.get(key).map(|state| state.version)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.keys()
    }

    /// Build the runtestitem.jl argument for the item at `index`.
    pub fn run_request(
        &self,
        key: &ResourceKey,
        index: usize,
    ) -> Result<RunTestitemRequest, NotRunnable> {
        let state = self.resources.get(key).ok_or(NotRunnable::UnknownResource)?;
        let item = state
            .items
            .get(index)
            .ok_or(NotRunnable::IndexOutOfRange(index))?;
        if let Some(error) = item.error_message() {
            return Err(NotRunnable::Broken(error.to_string()));
        }
        let code_range = item.code_range.ok_or(NotRunnable::MissingCodeRange)?;
        let code = item
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or(NotRunnable::MissingCode)?;
        if !state.has_environment() {
            return Err(NotRunnable::MissingEnvironment);
        }

        // The server reports a code start at column 0 one line too far
        // down after the first notification for a file.
        let column = code_range.start.character;
        let line = if column == 0 {
            code_range.start.line.saturating_sub(1)
        } else {
            code_range.start.line
        };

        Ok(RunTestitemRequest {
            uri: state.uri.clone(),
            name: item.label.clone(),
            package_name: state.package_name.clone(),
            use_default_usings: item.option_default_imports != Some(false),
            line,
            column,
            code: code.to_string(),
            project_path: state.project_path.clone(),
            package_path: state.package_path.clone(),
        })
    }

    /// Overwrite only the status field of one entry, keeping message and duration.
    pub fn set_status(&mut self, key: &ResourceKey, index: usize, status: TestItemStatus) -> bool {
        match self
            .resources
            .get_mut(key)
            .and_then(|state| state.status.get_mut(index))
        {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Replace the full result of one entry.
    pub fn set_result(&mut self, key: &ResourceKey, index: usize, result: TestRunResult) -> bool {
        match self
            .resources
            .get_mut(key)
            .and_then(|state| state.status.get_mut(index))
        {
            Some(entry) => {
                *entry = result;
                true
            }
            None => false,
        }
    }

    /// Reset every `Pending` entry of a resource to `Undetermined`.
    ///
    /// Returns the number of entries that were reset.
    pub fn reset_pending(&mut self, key: &ResourceKey) -> usize {
        let Some(state) = self.resources.get_mut(key) else {
            return 0;
        };
        let mut reset = 0;
        for entry in state
            .status
            .iter_mut()
            .filter(|entry| entry.status == TestItemStatus::Pending)
        {
            entry.status = TestItemStatus::Undetermined;
            reset += 1;
        }
        reset
    }

    /// True when at least one stored item can be offered for a run
    pub fn has_runnable_items(&self) -> bool {
        self.resources
            .values()
            .any(|state| state.items.iter().any(TestItemDetail::is_runnable))
    }

    /// Every runnable test item, in store order, for the run picker
    pub fn picker_entries(&self) -> Vec<PickerEntry> {
        let mut entries = Vec::new();
        for (key, state) in &self.resources {
            for (idx, (item, result)) in state.items.iter().zip(&state.status).enumerate() {
                if !item.is_runnable() {
                    continue;
                }
                entries.push(PickerEntry {
                    label: item.label.clone(),
                    details: item.option_tags.as_deref().unwrap_or_default().join(", "),
                    location: format!("{}:{}", key, item.range.start.line + 1),
                    status: result.status,
                    token: state.token(idx),
                });
            }
        }
        entries
    }
}
