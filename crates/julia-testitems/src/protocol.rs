//
// protocol.rs
//
// Wire types for the julia/publishTestitems notification and the
// runtestitem.jl request/response exchange
//

use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::{Location, Range, Url};

/// Method name of the test item notification sent by LanguageServer.jl
pub const PUBLISH_TESTITEMS_METHOD: &str = "julia/publishTestitems";

/// A single `@testitem` reported by the language server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItemDetail {
    /// Best-effort identifier, NOT unique within a file
    pub id: String,
    pub label: String,
    /// Range of the `@testitem` declaration
    pub range: Range,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "codeRange")]
    pub code_range: Option<Range>,
    #[serde(default, alias = "optionDefaultImports")]
    pub option_default_imports: Option<bool>,
    #[serde(default, alias = "optionTags")]
    pub option_tags: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TestItemDetail {
    /// Error reported for a structurally broken item; an empty string counts as none
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|error| !error.is_empty())
    }

    /// An item without an error marker can be offered for execution
    pub fn is_runnable(&self) -> bool {
        self.error_message().is_none()
    }
}

/// A structurally broken test item that cannot be run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestErrorDetail {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub range: Range,
    pub error: String,
}

/// Parameters of the `julia/publishTestitems` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTestItemsParams {
    pub uri: Url,
    /// Absent in older LanguageServer.jl revisions
    #[serde(default)]
    pub version: Option<i32>,
    #[serde(alias = "projectPath")]
    pub project_path: String,
    #[serde(alias = "packagePath")]
    pub package_path: String,
    #[serde(alias = "packageName")]
    pub package_name: String,
    #[serde(alias = "testItemDetails")]
    pub testitemdetails: Vec<TestItemDetail>,
    #[serde(default, alias = "testErrorDetails")]
    pub testerrordetails: Vec<TestErrorDetail>,
}

/// Run status of a test item.
///
/// The first three values are reported by the test server; the others are
/// assigned locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestItemStatus {
    Passed,
    Failed,
    Errored,
    Undetermined,
    Pending,
    Invalid,
}

impl TestItemStatus {
    /// Render order of the annotation groups
    pub const ALL: [TestItemStatus; 6] = [
        TestItemStatus::Passed,
        TestItemStatus::Failed,
        TestItemStatus::Errored,
        TestItemStatus::Undetermined,
        TestItemStatus::Pending,
        TestItemStatus::Invalid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestItemStatus::Passed => "passed",
            TestItemStatus::Failed => "failed",
            TestItemStatus::Errored => "errored",
            TestItemStatus::Undetermined => "undetermined",
            TestItemStatus::Pending => "pending",
            TestItemStatus::Invalid => "invalid",
        }
    }

    /// Whether clicking an annotation of this status should start a run
    pub fn is_navigable(self) -> bool {
        !matches!(self, TestItemStatus::Pending | TestItemStatus::Invalid)
    }

    /// Failures carry messages that can be drawn as inline overlays
    pub fn is_failure(self) -> bool {
        matches!(self, TestItemStatus::Failed | TestItemStatus::Errored)
    }
}

impl std::fmt::Display for TestItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message attached to a test result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMessage {
    pub message: String,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Outcome of one execution, as printed by runtestitem.jl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub status: TestItemStatus,
    #[serde(default)]
    pub message: Option<Vec<TestMessage>>,
    /// Milliseconds
    #[serde(default)]
    pub duration: Option<f64>,
}

impl TestRunResult {
    pub fn undetermined() -> Self {
        Self {
            status: TestItemStatus::Undetermined,
            message: None,
            duration: None,
        }
    }
}

impl Default for TestRunResult {
    fn default() -> Self {
        Self::undetermined()
    }
}

/// Argument passed to runtestitem.jl.
///
/// Mirrors the test server's `TestserverRunTestitemRequestParams` and adds
/// the two environment paths the script needs to activate the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTestitemRequest {
    pub uri: Url,
    pub name: String,
    #[serde(rename = "packageName")]
    pub package_name: String,
    #[serde(rename = "useDefaultUsings")]
    pub use_default_usings: bool,
    pub line: u32,
    pub column: u32,
    pub code: String,
    pub project_path: String,
    pub package_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_params_snake_case() {
        let params: PublishTestItemsParams = serde_json::from_value(json!({
            "uri": "file:///pkg/test/runtests.jl",
            "version": 3,
            "project_path": "/pkg",
            "package_path": "/pkg",
            "package_name": "Pkg",
            "testitemdetails": [{
                "id": "a",
                "label": "first",
                "range": {"start": {"line": 1, "character": 0}, "end": {"line": 4, "character": 3}},
                "code": "@test true",
                "code_range": {"start": {"line": 2, "character": 4}, "end": {"line": 2, "character": 14}},
                "option_default_imports": true,
                "option_tags": ["fast"]
            }],
            "testerrordetails": []
        }))
        .unwrap();

        assert_eq!(params.version, Some(3));
        assert_eq!(params.package_name, "Pkg");
        assert_eq!(params.testitemdetails.len(), 1);
        let item = &params.testitemdetails[0];
        assert_eq!(item.code_range.unwrap().start.character, 4);
        assert_eq!(item.option_tags.as_deref(), Some(&["fast".to_string()][..]));
        assert!(item.is_runnable());
    }

    #[test]
    fn test_error_marks_item_broken() {
        let mut item: TestItemDetail = serde_json::from_value(json!({
            "id": "",
            "label": "",
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 9}},
            "error": "Your @testitem must have a name."
        }))
        .unwrap();
        assert_eq!(item.error_message(), Some("Your @testitem must have a name."));
        assert!(!item.is_runnable());

        item.error = Some(String::new());
        assert_eq!(item.error_message(), None);
        assert!(item.is_runnable());
    }

    #[test]
    fn test_publish_params_camel_case_without_version_or_errors() {
        let params: PublishTestItemsParams = serde_json::from_value(json!({
            "uri": "file:///pkg/test/runtests.jl",
            "projectPath": "",
            "packagePath": "/pkg",
            "packageName": "Pkg",
            "testItemDetails": []
        }))
        .unwrap();

        assert_eq!(params.version, None);
        assert!(params.testitemdetails.is_empty());
        assert!(params.testerrordetails.is_empty());
    }

    #[test]
    fn test_publish_params_missing_metadata_is_rejected() {
        let result: Result<PublishTestItemsParams, _> = serde_json::from_value(json!({
            "uri": "file:///pkg/test/runtests.jl",
            "testitemdetails": []
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_status_lowercase_wire_format() {
        assert_eq!(
            serde_json::to_value(TestItemStatus::Undetermined).unwrap(),
            json!("undetermined")
        );
        let status: TestItemStatus = serde_json::from_value(json!("errored")).unwrap();
        assert_eq!(status, TestItemStatus::Errored);
        assert_eq!(TestItemStatus::Pending.to_string(), "pending");
    }

    #[test]
    fn test_navigable_statuses() {
        let navigable: Vec<_> = TestItemStatus::ALL
            .into_iter()
            .filter(|s| s.is_navigable())
            .collect();
        assert_eq!(
            navigable,
            vec![
                TestItemStatus::Passed,
                TestItemStatus::Failed,
                TestItemStatus::Errored,
                TestItemStatus::Undetermined,
            ]
        );
    }

    #[test]
    fn test_run_result_with_messages() {
        let result: TestRunResult = serde_json::from_str(
            r#"{"status":"failed","message":[{"message":"Test Failed","location":{"uri":"file:///pkg/test/a.jl","range":{"start":{"line":3,"character":4},"end":{"line":3,"character":20}}}},{"message":"no location","location":null}],"duration":12.5}"#,
        )
        .unwrap();
        assert_eq!(result.status, TestItemStatus::Failed);
        let messages = result.message.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].location.is_some());
        assert!(messages[1].location.is_none());
        assert_eq!(result.duration, Some(12.5));
    }

    #[test]
    fn test_run_request_field_names() {
        let request = RunTestitemRequest {
            uri: Url::parse("file:///pkg/test/a.jl").unwrap(),
            name: "adds".to_string(),
            package_name: "Pkg".to_string(),
            use_default_usings: true,
            line: 2,
            column: 4,
            code: "@test 1 + 1 == 2".to_string(),
            project_path: "/pkg".to_string(),
            package_path: "/pkg".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(
            keys,
            vec![
                "uri",
                "name",
                "packageName",
                "useDefaultUsings",
                "line",
                "column",
                "code",
                "project_path",
                "package_path"
            ]
        );
    }
}
