//! Folder names: the join key between a task record and its stage location.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TaskId;

/// Name of a task folder inside a Stage Directory.
///
/// Always derived from the task id for new tasks. Names read back from a
/// directory listing go through [`FolderName::parse`], which rejects anything
/// that could escape the stage directory or that is a staging leftover.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FolderName(String);

impl FolderName {
    pub fn for_task(id: TaskId) -> Self {
        Self(id.to_string())
    }

    /// Accept a directory entry name as a task folder name.
    ///
    /// Returns `None` for empty names, dotfiles (`.staging`, temp files) and
    /// anything containing a path separator.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty()
            || raw.starts_with('.')
            || raw.contains('/')
            || raw.contains('\\')
            || raw.contains('\0')
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FolderName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid folder name '{value}'"))
    }
}

impl From<FolderName> for String {
    fn from(value: FolderName) -> Self {
        value.0
    }
}

impl AsRef<std::path::Path> for FolderName {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}
