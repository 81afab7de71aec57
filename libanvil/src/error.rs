use std::fmt::Display;

pub type Result<T = (), E = anyhow::Error> = core::result::Result<T, E>;

/// Typed build failures. Most errors go through `anyhow` with context attached; these variants
/// exist because some call sites need to distinguish a missing optional structure (skip the
/// feature) from actual corruption (abort the build).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// The file kind is not one we can rebuild (e.g. ET_NONE). This is a precondition violation
    /// by the caller, not a recoverable input error.
    UnsupportedFileType(u16),

    /// An invariant of the input model doesn't hold.
    Corrupted(String),

    /// A structure that should accompany another one is absent, e.g. a dynamic tag with no
    /// section at its address.
    NotFound(String),
}

impl Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::UnsupportedFileType(kind) => {
                write!(f, "ELF file type {kind:#x} is not supported")
            }
            BuildError::Corrupted(message) => write!(f, "Corrupted input: {message}"),
            BuildError::NotFound(message) => write!(f, "Not found: {message}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// True if `error` is a `BuildError::NotFound`, which call sites dealing with optional structures
/// treat as "skip that feature".
pub(crate) fn is_not_found(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<BuildError>(),
        Some(BuildError::NotFound(_))
    )
}
