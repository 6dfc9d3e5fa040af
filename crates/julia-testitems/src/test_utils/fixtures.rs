//! Deterministic test item fixtures.
//!
//! Every fixture lives in `file:///pkg/test/runtests.jl` of a package `Pkg`
//! at `/pkg`, unless a test changes the returned value.

use tower_lsp::lsp_types::{Position, Range, Url};

use crate::protocol::{PublishTestItemsParams, TestItemDetail, TestItemStatus, TestRunResult};

pub fn test_uri() -> Url {
    Url::parse("file:///pkg/test/runtests.jl").unwrap()
}

/// A placeholder item declared at `line`, without code
pub fn item(id: &str, line: u32) -> TestItemDetail {
    TestItemDetail {
        id: id.to_string(),
        label: id.to_string(),
        range: Range::new(Position::new(line, 0), Position::new(line + 3, 3)),
        code: None,
        code_range: None,
        option_default_imports: None,
        option_tags: None,
        error: None,
    }
}

/// A runnable item whose code starts at `code_line:code_column`.
///
/// The declaration is placed on the line before the code.
pub fn runnable_item(id: &str, label: &str, code_line: u32, code_column: u32) -> TestItemDetail {
    let start = code_line.saturating_sub(1);
    TestItemDetail {
        id: id.to_string(),
        label: label.to_string(),
        range: Range::new(Position::new(start, 0), Position::new(code_line + 1, 3)),
        code: Some("@test 1 + 1 == 2".to_string()),
        code_range: Some(Range::new(
            Position::new(code_line, code_column),
            Position::new(code_line, code_column + 16),
        )),
        option_default_imports: None,
        option_tags: None,
        error: None,
    }
}

pub fn publish(version: Option<i32>, items: Vec<TestItemDetail>) -> PublishTestItemsParams {
    PublishTestItemsParams {
        uri: test_uri(),
        version,
        project_path: "/pkg".to_string(),
        package_path: "/pkg".to_string(),
        package_name: "Pkg".to_string(),
        testitemdetails: items,
        testerrordetails: Vec::new(),
    }
}

pub fn result(status: TestItemStatus) -> TestRunResult {
    TestRunResult {
        status,
        message: None,
        duration: None,
    }
}
