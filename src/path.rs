//! Slash-separated paths into the filesystem tree.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::dirent::MAX_NAME_LEN;

/// A path in the filesystem. Paths are always interpreted from the root;
/// a leading `/` is accepted and redundant separators are collapsed.
#[derive(Debug, Clone)]
pub(crate) struct FilePath {
    /// Components of the path, none of which are empty or contain `/`.
    components: Vec<String>,
}

impl FilePath {
    pub(crate) fn parse(s: &str) -> Result<Self, &'static str> {
        let mut components = Vec::new();
        for component in s.split('/').filter(|c| !c.is_empty()) {
            validate_name(component)?;
            components.push(component.to_string());
        }
        Ok(Self { components })
    }

    pub(crate) fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    pub(crate) fn components(&self) -> &[String] {
        &self.components
    }

    /// Split into the parent path and the final component.
    pub(crate) fn split_dirname_filename(&self) -> Option<(Self, &str)> {
        let (filename, parent) = self.components.split_last()?;
        let parent_path = Self {
            components: parent.to_vec(),
        };
        Some((parent_path, filename))
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{component}")?;
        }
        Ok(())
    }
}

/// Check that a string is usable as the name of a directory entry.
pub(crate) fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name == "." || name == ".." {
        return Err("dot entries cannot be addressed by name");
    }
    if name.chars().any(|c| c == '/' || c == '\0') {
        return Err("name contains a path separator or NUL");
    }
    if name.encode_utf16().count() > MAX_NAME_LEN {
        return Err("name longer than 255 characters");
    }
    Ok(())
}
