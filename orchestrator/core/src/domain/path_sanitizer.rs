// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Confines file paths named in `ReadFile` / `EditFile` actions to the
//! session's workspace. Runtimes resolve every agent-supplied path through
//! [`PathSanitizer::resolve`] before touching the filesystem.
//!
//! # Guarantees
//! - Rejects paths containing `..` components or NUL bytes
//! - Relative paths are joined onto the workspace root
//! - Absolute paths are accepted only when already under the workspace root
//! - Symlinks are not followed here; backends that care must check the
//!   resolved target themselves

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path outside workspace: {0}")]
    OutsideWorkspace(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

#[derive(Debug, Clone)]
pub struct PathSanitizer {
    max_path_len: usize,
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_path_len: 4096 }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Resolve `path` against `workspace_root` and make sure the result
    /// stays inside it.
    ///
    /// ```
    /// use conductor_core::domain::path_sanitizer::PathSanitizer;
    /// use std::path::{Path, PathBuf};
    ///
    /// let sanitizer = PathSanitizer::new();
    /// let root = Path::new("/workspace");
    ///
    /// assert_eq!(
    ///     sanitizer.resolve("src/main.rs", root).unwrap(),
    ///     PathBuf::from("/workspace/src/main.rs")
    /// );
    /// assert!(sanitizer.resolve("../etc/passwd", root).is_err());
    /// assert!(sanitizer.resolve("/etc/passwd", root).is_err());
    /// ```
    pub fn resolve(&self, path: &str, workspace_root: &Path) -> Result<PathBuf, PathSanitizerError> {
        self.validate(path)?;

        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Prefix(_) | Component::RootDir => normalized.push(component),
                Component::CurDir => {}
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => {
                    tracing::warn!(path = %path, "Path traversal attempt detected: contains '..' component");
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
            }
        }

        let resolved = if normalized.is_absolute() {
            normalized
        } else {
            workspace_root.join(normalized)
        };

        if !resolved.starts_with(workspace_root) {
            tracing::warn!(
                path = %path,
                root = %workspace_root.display(),
                "Path outside workspace detected"
            );
            return Err(PathSanitizerError::OutsideWorkspace(path.to_string()));
        }
        Ok(resolved)
    }

    /// Cheap checks that need no workspace: length and NUL bytes.
    pub fn validate(&self, path: &str) -> Result<(), PathSanitizerError> {
        if path.is_empty() {
            return Err(PathSanitizerError::InvalidPath("path is empty".to_string()));
        }
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }
        if path.contains('\0') {
            tracing::warn!(path = %path, "Path contains null byte");
            return Err(PathSanitizerError::InvalidPath("path contains null byte".to_string()));
        }
        Ok(())
    }

    /// Workspace-relative form of a resolved path, for observations.
    pub fn relative_to_workspace(
        &self,
        resolved: &Path,
        workspace_root: &Path,
    ) -> Result<PathBuf, PathSanitizerError> {
        resolved
            .strip_prefix(workspace_root)
            .map(Path::to_path_buf)
            .map_err(|_| PathSanitizerError::OutsideWorkspace(resolved.display().to_string()))
    }
}
