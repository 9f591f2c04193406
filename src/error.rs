use thiserror::Error;

/// Error taxonomy of the storage core.
///
/// Every kind maps onto a caller-visible failure class: `Corruption` is a
/// failed integrity check (CRC, magic, manifest token), `Io` is an OS-level
/// read/write failure propagated unchanged, `InvalidArgument` is a caller
/// contract violation, and `Internal` is a broken invariant inside the core.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
