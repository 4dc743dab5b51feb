//! Admin-operation errors (spec Section 7: registration/removal are
//! synchronous, so failures there are `Result`s, unlike the in-band
//! `Value::Error` that `attribute_stream` itself produces).
//!
//! Pure plumbing, no hand-written `Display` needed per variant -- grounded
//! on `tenor-storage::StorageError`'s `thiserror` derive style (see that
//! crate's `error.rs`).

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("attribute finder '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("no attribute finder registered under '{0}'")]
    NotRegistered(String),

    #[error("invalid attribute finder specification for '{name}': {reason}")]
    InvalidSpecification { name: String, reason: String },
}
