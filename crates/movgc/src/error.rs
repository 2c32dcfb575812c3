//! Errors surfaced by the collector.

use thiserror::Error;

use crate::meta::TypeKey;

/// Errors returned by allocation, collection and configuration.
///
/// Contract violations by the embedding code (registering a root twice,
/// pinning null and so on) are not represented here; they panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// Allocation still failed after a collection and a heap expansion.
    #[error("out of memory: cannot allocate {requested} bytes after collecting and expanding the heap")]
    OutOfMemory {
        /// Box size that was requested, header included.
        requested: usize,
    },

    /// A thread is inside an [`UnsafeScope`](crate::UnsafeScope), so the
    /// world cannot be stopped right now.
    #[error("stop-the-world is disabled by a thread inside an unsafe scope")]
    StopTheWorldDisabled,

    /// The address is neither null nor inside memory known to the index.
    #[error("address {addr:#x} is not owned by the collected heap")]
    UnindexedMemory {
        /// The offending address.
        addr: usize,
    },

    /// Compaction tried to relocate an object whose type opted out of moving.
    #[error("type `{type_name}` cannot be moved by the compactor")]
    NotMovable {
        /// Name recorded in the type's metadata.
        type_name: String,
    },

    /// An allocation or commit named a type with no metadata published in
    /// the collector's type registry.
    #[error("no type metadata is published for {0:?}")]
    UnknownType(TypeKey),

    /// A size-class pool was asked for a box larger than its largest class.
    #[error("box of {size} bytes does not fit any size class")]
    ObjectTooLarge {
        /// Box size, header included.
        size: usize,
    },

    /// The calling OS thread already has a live [`Mutator`](crate::Mutator)
    /// for this collector.
    #[error("thread is already registered with this collector")]
    ThreadAlreadyRegistered,

    /// A [`GcConfig`](crate::GcConfig) field is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to map memory.
    #[error("failed to map {len} bytes: {reason}")]
    MapFailed {
        /// Requested mapping length.
        len: usize,
        /// OS error text.
        reason: String,
    },
}

impl GcError {
    /// Whether the operation may succeed if simply retried later.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::StopTheWorldDisabled)
    }

    pub(crate) fn map_failed(len: usize, err: &std::io::Error) -> Self {
        Self::MapFailed {
            len,
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::GcError;

    #[test]
    fn test_messages_name_the_problem() {
        let err = GcError::OutOfMemory { requested: 64 };
        assert!(err.to_string().contains("64 bytes"));

        let err = GcError::UnindexedMemory { addr: 0x1000 };
        assert!(err.to_string().contains("0x1000"));

        let err = GcError::NotMovable {
            type_name: "Socket".into(),
        };
        assert!(err.to_string().contains("Socket"));
    }

    #[test]
    fn test_only_stw_refusal_is_recoverable() {
        assert!(GcError::StopTheWorldDisabled.is_recoverable());
        assert!(!GcError::OutOfMemory { requested: 1 }.is_recoverable());
        assert!(!GcError::ThreadAlreadyRegistered.is_recoverable());
    }

    #[test]
    fn test_map_failed_keeps_os_text() {
        let io = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no pages");
        let err = GcError::map_failed(4096, &io);
        assert_eq!(
            err,
            GcError::MapFailed {
                len: 4096,
                reason: "no pages".into()
            }
        );
    }
}
