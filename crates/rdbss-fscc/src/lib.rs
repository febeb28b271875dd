//! File-system control code types shared across the redirector workspace:
//! access masks, share-access flags, create dispositions and create options.
//!
//! The layouts follow the Windows file-system control code definitions
//! ([MS-FSCC]/[MS-SMB2]) so that a mini-redirector speaking a real wire
//! protocol can pass these fields through unchanged.

#![forbid(unsafe_code)]

mod access_mask;
mod create;

pub use access_mask::FileAccessMask;
pub use create::{CreateDisposition, CreateOptions, ShareAccessFlags};
