use thiserror::Error;

/// Failures of page-table operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum VmmError {
    #[error("no physical frame available for a page table")]
    OutOfMemory,
    #[error("virtual page is already mapped")]
    AlreadyMapped,
    #[error("virtual page is not mapped")]
    NotMapped,
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}
