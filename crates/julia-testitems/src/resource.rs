//
// resource.rs
//
// Canonical store keys for test item resources
//
// The language server may refer to the same file with URIs that differ only
// in the case of the drive letter (file:///c:/... vs file:///C:/...). All
// state is therefore keyed by a normalised filesystem path instead of the
// raw URI.
//

use std::fmt;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tower_lsp::lsp_types::Url;

/// Canonical identifier of a resource in the test item store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(PathBuf);

impl ResourceKey {
    /// Build the key for a document URI.
    ///
    /// `file:` URIs are converted to a filesystem path with the drive letter
    /// upper-cased. Other schemes (e.g. `untitled:`) keep their URI text.
    pub fn from_uri(uri: &Url) -> Self {
        if uri.scheme() == "file" {
            if let Some(path) = windows_drive_path(uri) {
                return Self(PathBuf::from(path));
            }
            if let Ok(path) = uri.to_file_path() {
                return Self(path);
            }
        }
        Self(PathBuf::from(uri.as_str()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Directory containing the resource, used as working directory for runs
    pub fn parent_dir(&self) -> Option<&Path> {
        self.0.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Convert `file:///c:/dir/file.jl` (or `file:///c%3A/...`) into `C:/dir/file.jl`.
///
/// Done by hand instead of relying on `Url::to_file_path`, which only
/// understands drive letters when compiled for Windows.
fn windows_drive_path(uri: &Url) -> Option<String> {
    let mut segments = uri.path_segments()?;
    let first = segments.next()?;
    let drive = first
        .strip_suffix(':')
        .or_else(|| first.strip_suffix("%3A"))
        .or_else(|| first.strip_suffix("%3a"))?;
    let mut chars = drive.chars();
    let letter = chars.next().filter(|c| c.is_ascii_alphabetic())?;
    if chars.next().is_some() {
        return None;
    }

    let mut path = format!("{}:", letter.to_ascii_uppercase());
    for segment in segments {
        path.push('/');
        path.push_str(&percent_decode_str(segment).decode_utf8_lossy());
    }
    if path.len() == 2 {
        path.push('/');
    }
    Some(path)
}
