//
// token.rs
//
// Run tokens: `<resourceUri>#idx=<index>&version=<version>`
//

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tower_lsp::lsp_types::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid resource URI in run token: {0}")]
    InvalidUri(String),
    #[error("run token has no fragment")]
    MissingFragment,
    #[error("run token is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("run token field `{field}` is not a number: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Identifies exactly which test item instance to execute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunToken {
    pub uri: Url,
    pub index: usize,
    pub version: i32,
}

impl RunToken {
    pub fn new(uri: Url, index: usize, version: i32) -> Self {
        Self {
            uri,
            index,
            version,
        }
    }

    /// Parse a token produced by [`RunToken::to_string`].
    ///
    /// Editors that render annotations as HTML may hand back the separator
    /// escaped as `&amp;`, which is accepted as well.
    pub fn parse(href: &str) -> Result<Self, TokenError> {
        let href = href.replace("&amp;", "&");
        let mut uri = Url::parse(&href).map_err(|_| TokenError::InvalidUri(href.clone()))?;
        let fragment = uri.fragment().ok_or(TokenError::MissingFragment)?.to_string();
        uri.set_fragment(None);

        let mut index = None;
        let mut version = None;
        for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
            match key.as_ref() {
                "idx" if index.is_none() => index = Some(value.into_owned()),
                "version" if version.is_none() => version = Some(value.into_owned()),
                _ => {}
            }
        }

        let index = index.ok_or(TokenError::MissingField("idx"))?;
        let version = version.ok_or(TokenError::MissingField("version"))?;
        Ok(Self {
            uri,
            index: index.parse().map_err(|_| TokenError::InvalidNumber {
                field: "idx",
                value: index.clone(),
            })?,
            version: version.parse().map_err(|_| TokenError::InvalidNumber {
                field: "version",
                value: version.clone(),
            })?,
        })
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#idx={}&version={}",
            self.uri, self.index, self.version
        )
    }
}

/// Serialised as the href string so hosts can hand it back verbatim
impl Serialize for RunToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let href = String::deserialize(deserializer)?;
        RunToken::parse(&href).map_err(serde::de::Error::custom)
    }
}
