// ============================================================================
// EDIT ERRORS: invalid geometry, missing targets, collaborator failures
// ============================================================================

use std::fmt;

/// Errors surfaced by editor operations.
///
/// Invalid geometry is rejected before any mutation, so nothing reaches the
/// history.  Missing targets inside `apply`/`reverse` are *not* errors (they
/// are logged and skipped); `MissingTarget` is only returned when a caller
/// asks for an operation whose precondition is absent (no selection, no mask).
#[derive(Debug)]
pub enum EditError {
    /// Non-positive crop, undersized selection, out-of-range region.
    InvalidGeometry(String),
    /// The operation needs something that does not exist right now.
    MissingTarget(String),
    /// Pixel export, generation service or another collaborator failed.
    Collaborator(String),
    Io(std::io::Error),
    Image(image::ImageError),
    /// Project file could not be read or written.
    Project(String),
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::InvalidGeometry(s) => write!(f, "Invalid geometry: {}", s),
            EditError::MissingTarget(s) => write!(f, "Nothing to operate on: {}", s),
            EditError::Collaborator(s) => write!(f, "Operation failed: {}", s),
            EditError::Io(e) => write!(f, "I/O error: {}", e),
            EditError::Image(e) => write!(f, "Image error: {}", e),
            EditError::Project(s) => write!(f, "Project file error: {}", s),
        }
    }
}

impl std::error::Error for EditError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EditError::Io(e) => Some(e),
            EditError::Image(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EditError {
    fn from(e: std::io::Error) -> Self {
        EditError::Io(e)
    }
}

impl From<image::ImageError> for EditError {
    fn from(e: image::ImageError) -> Self {
        EditError::Image(e)
    }
}

impl From<Box<bincode::ErrorKind>> for EditError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EditError::Project(e.to_string())
    }
}

impl EditError {
    /// True for failures the user caused (shown as a non-blocking notice)
    /// rather than failures of the environment.
    pub fn is_user_error(&self) -> bool {
        matches!(self, EditError::InvalidGeometry(_) | EditError::MissingTarget(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_the_precondition_failures() {
        assert!(EditError::InvalidGeometry("zero width".into()).is_user_error());
        assert!(EditError::MissingTarget("no mask".into()).is_user_error());
        assert!(!EditError::Collaborator("service down".into()).is_user_error());
        assert!(!EditError::Io(std::io::Error::other("disk")).is_user_error());
    }
}
