//! Error types for identities, the type registry and packet encoding.

use thiserror::Error;

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Top-level error for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid identity string or component.
    #[error(transparent)]
    Id(#[from] IdError),

    /// Encoding or decoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Type registry misuse.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Rejected identity input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Username part is empty.
    #[error("id has an empty username")]
    EmptyUsername,

    /// Domain part is empty.
    #[error("id has an empty domain")]
    EmptyDomain,

    /// More than one `@` separator.
    #[error("id `{0}` contains more than one '@'")]
    TooManySeparators(String),
}

/// Packet encoding/decoding failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serializer failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O failure surfaced through a framed stream.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The packet's `TypeName` did not match the requested content type.
    #[error("packet carries `{actual}`, expected `{expected}`")]
    TypeMismatch {
        /// Type name the caller asked for.
        expected: &'static str,
        /// Type name the packet carries.
        actual: String,
    },

    /// Encoded packet would contain the frame delimiter.
    #[error("encoded packet contains the frame delimiter")]
    DelimiterInPayload,
}

/// Type registry misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A different Rust type is already registered under this name.
    #[error("type name `{name}` already registered to `{existing}`")]
    Conflict {
        /// The contested type name.
        name: String,
        /// Rust type currently owning the name.
        existing: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_error_display() {
        assert_eq!(IdError::EmptyUsername.to_string(), "id has an empty username");
        assert_eq!(
            IdError::TooManySeparators("a@b@c".into()).to_string(),
            "id `a@b@c` contains more than one '@'"
        );
    }

    #[test]
    fn type_mismatch_display() {
        let err = CodecError::TypeMismatch {
            expected: "chat.message",
            actual: "chat.typing".into(),
        };
        assert_eq!(
            err.to_string(),
            "packet carries `chat.typing`, expected `chat.message`"
        );
    }

    #[test]
    fn core_error_is_transparent() {
        let err: CoreError = IdError::EmptyDomain.into();
        assert_eq!(err.to_string(), "id has an empty domain");
    }
}
