//! Case-insensitive database names.

use crate::error::{ServerError, ServerResult};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reserved name that older deployments used for the server-wide database.
const RESERVED: &str = "<system>";

const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// A validated database name.
///
/// Names compare and hash case-insensitively; the original spelling is kept
/// for display.
#[derive(Clone)]
pub struct DatabaseName {
    display: String,
    key: String,
}

impl DatabaseName {
    /// Validates `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidName`] for empty or whitespace names,
    /// the reserved `<system>` name, and names containing path or wildcard
    /// characters.
    pub fn new(name: &str) -> ServerResult<Self> {
        let invalid = |reason| ServerError::InvalidName {
            name: name.to_string(),
            reason,
        };
        if name.trim().is_empty() {
            return Err(invalid("database name cannot be empty"));
        }
        if name.eq_ignore_ascii_case(RESERVED) {
            return Err(invalid("<system> is reserved"));
        }
        if name.contains(FORBIDDEN) || name == "." || name == ".." {
            return Err(invalid("contains a forbidden character"));
        }
        Ok(Self {
            display: name.to_string(),
            key: name.to_lowercase(),
        })
    }

    /// Returns the name as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Returns the lower-cased lookup key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for DatabaseName {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DatabaseName {}

impl Hash for DatabaseName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseName({:?})", self.display)
    }
}

impl TryFrom<&str> for DatabaseName {
    type Error = ServerError;

    fn try_from(value: &str) -> ServerResult<Self> {
        Self::new(value)
    }
}
