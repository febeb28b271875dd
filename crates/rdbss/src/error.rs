//! Error type for the redirector create pipeline.

use thiserror::Error;

/// Terminal statuses surfaced to the caller of a create operation.
///
/// Transitional conditions (more-processing-required, reparse, pending
/// resolution) are control-flow types inside the pipeline and are never
/// reported through this enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The object name is malformed (bad leading separator, wildcards in a
    /// leaf name, missing server or share component).
    #[error("the object name is invalid")]
    InvalidName,

    /// A component of the remaining path uses `.`/`..`/separators illegally.
    #[error("the object path component syntax is bad")]
    PathSyntaxBad,

    /// The object path cannot be used for this operation.
    #[error("the object path is invalid")]
    PathInvalid,

    /// The canonicalized name exceeds the maximum representable length.
    #[error("the object name is too long")]
    NameTooLong,

    /// No connection exists or can be constructed for the given name.
    #[error("no such network connection")]
    NoSuchConnection,

    /// The name resolves to a connection owned by conflicting credentials.
    /// Triggers exactly one scavenge-and-retry of the resolution step.
    #[error("a credential conflict exists with an existing connection")]
    CredentialConflict,

    /// The requested access/share combination conflicts with existing opens.
    #[error("a sharing violation occurred")]
    SharingViolation,

    /// An object by that name already exists and the disposition requires
    /// creating a new one.
    #[error("an object by that name already exists")]
    NameCollision,

    /// Allocation failed or a configured capacity limit was reached.
    #[error("insufficient resources to complete the operation")]
    OutOfMemory,

    /// A required lock could not be granted.
    #[error("a required lock could not be granted")]
    LockNotGranted,

    /// The operation is not valid for this kind of file object, e.g. I/O on
    /// an open-target-directory stub.
    #[error("the request is not valid for this device object")]
    InvalidDeviceRequest,

    /// The operation was abandoned before completion, such as a pending
    /// net-root resolution told to give up.
    #[error("the operation was cancelled")]
    Cancelled,

    /// Generic failure; used to translate protocol-layer misbehavior that
    /// has no more specific status.
    #[error("the operation was unsuccessful")]
    Unsuccessful,

    /// Opaque protocol-layer status, passed through verbatim.
    #[error("remote status {0:#010x}")]
    Remote(u32),
}
