//! `User-Agent` header value, as described in RFC 7231 section 5.5.3.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Product token, version and optional comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    pub token: String,
    pub version: String,
    #[serde(default)]
    pub comment: Vec<String>,
}

impl UserAgent {
    pub fn new(token: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            version: version.into(),
            comment: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment.push(comment.into());
        self
    }
}

/// `httpx/<version> (reqwest)`.
impl Default for UserAgent {
    fn default() -> Self {
        Self::new(crate::NAME, crate::VERSION).with_comment("reqwest")
    }
}

/// Renders `token/version (comment; comment)`.
///
/// Renders nothing when the token or version is empty. Parentheses inside
/// comments are dropped so they cannot unbalance the header.
impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token.is_empty() || self.version.is_empty() {
            return Ok(());
        }

        write!(f, "{}/{}", self.token, self.version)?;

        if !self.comment.is_empty() {
            f.write_str(" (")?;
            for (i, comment) in self.comment.iter().enumerate() {
                if i > 0 {
                    f.write_str("; ")?;
                }
                let cleaned: String = comment.chars().filter(|c| *c != '(' && *c != ')').collect();
                f.write_str(&cleaned)?;
            }
            f.write_str(")")?;
        }

        Ok(())
    }
}
