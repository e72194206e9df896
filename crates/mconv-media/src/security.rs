//! Input validation for untrusted job requests.
//!
//! Job parameters come from chat users, so paths, containers and metadata
//! keys are checked before anything reaches the engine's argument list.

use std::collections::HashSet;
use std::path::{Component, Path};

use crate::error::{MediaError, MediaResult};

/// Characters replaced in user-supplied names before they become file names.
const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '(', ')'];

/// Longest file name stem produced by [`sanitize_filename`].
const MAX_FILENAME_CHARS: usize = 50;

/// Security context for job validation.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    allowed_containers: HashSet<String>,
}

impl SecurityContext {
    /// Create a new security context with the default container allow-list.
    pub fn new() -> Self {
        let mut allowed_containers = HashSet::new();
        for ext in [
            "mp4", "mkv", "mov", "webm", "gif", "mp3", "m4a", "aac", "ogg", "opus", "flac", "wav",
        ] {
            allowed_containers.insert(ext.to_string());
        }

        Self { allowed_containers }
    }

    /// Allow an additional output container.
    pub fn allow_container(mut self, ext: impl Into<String>) -> Self {
        self.allowed_containers.insert(ext.into().to_lowercase());
        self
    }

    /// Reject paths with NUL bytes or parent-directory components.
    pub fn validate_path(&self, path: &Path) -> MediaResult<()> {
        if path.to_string_lossy().contains('\0') {
            return Err(MediaError::SecurityViolation(
                "Path contains null bytes".to_string(),
            ));
        }

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(MediaError::SecurityViolation(format!(
                "Path traversal attempt detected: {}",
                path.display()
            )));
        }

        Ok(())
    }

    /// Check the output container against the allow-list.
    pub fn validate_container(&self, container: &str) -> MediaResult<()> {
        let ext = container.to_lowercase();
        if !self.allowed_containers.contains(&ext) {
            return Err(MediaError::UnsupportedFormat(container.to_string()));
        }
        Ok(())
    }

    /// Validate file size is within limits.
    pub fn validate_file_size(&self, size_bytes: u64, limit: Option<u64>) -> MediaResult<()> {
        if let Some(limit) = limit {
            if size_bytes > limit {
                return Err(MediaError::ResourceLimit(format!(
                    "Input size {} bytes exceeds maximum {} bytes",
                    size_bytes, limit
                )));
            }
        }
        Ok(())
    }

    /// Metadata keys are passed as `key=value`; keep keys to a safe alphabet.
    pub fn validate_tag_key(&self, key: &str) -> MediaResult<()> {
        let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(MediaError::invalid_request(format!(
                "Invalid metadata key: {:?}",
                key
            )));
        }
        Ok(())
    }
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Make a user-supplied name safe to use as a file name stem.
///
/// Replaces path separators and shell-hostile characters with `_`, trims
/// surrounding whitespace and truncates to 50 characters.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let truncated: String = replaced.chars().take(MAX_FILENAME_CHARS).collect();
    let truncated = truncated.trim().trim_start_matches('.');

    if truncated.is_empty() {
        "output".to_string()
    } else {
        truncated.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("AC/DC: Live (1991)"), "AC_DC_ Live _1991_");
        assert_eq!(sanitize_filename("  plain  "), "plain");
        assert_eq!(sanitize_filename(""), "output");
        assert_eq!(sanitize_filename("../etc"), "_etc");

        let long = "x".repeat(80);
        assert_eq!(sanitize_filename(&long).chars().count(), 50);
    }

    #[test]
    fn test_validate_path() {
        let security = SecurityContext::new();
        assert!(security.validate_path(Path::new("/media/in.mkv")).is_ok());
        assert!(security.validate_path(Path::new("/media/a..b.mkv")).is_ok());
        assert!(security.validate_path(Path::new("/media/../etc/passwd")).is_err());
    }

    #[test]
    fn test_validate_container() {
        let security = SecurityContext::new();
        assert!(security.validate_container("MP3").is_ok());
        assert!(matches!(
            security.validate_container("exe"),
            Err(MediaError::UnsupportedFormat(_))
        ));
        assert!(security.allow_container("ts").validate_container("ts").is_ok());
    }

    #[test]
    fn test_validate_tag_key() {
        let security = SecurityContext::new();
        assert!(security.validate_tag_key("album_artist").is_ok());
        assert!(security.validate_tag_key("").is_err());
        assert!(security.validate_tag_key("a=b").is_err());
    }

    #[test]
    fn test_validate_file_size() {
        let security = SecurityContext::new();
        assert!(security.validate_file_size(10, Some(10)).is_ok());
        assert!(security.validate_file_size(11, Some(10)).is_err());
        assert!(security.validate_file_size(u64::MAX, None).is_ok());
    }
}
