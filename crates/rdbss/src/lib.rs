//! A network-redirector file-open pipeline.
//!
//! This crate implements the create path of a network redirector: raw paths
//! are canonicalized, bound to per-share connection objects, deduplicated
//! onto file control blocks, arbitrated for share access and finally opened
//! (or collapsed onto an existing open) through a pluggable
//! [`MiniRedirector`] protocol backend.
//!
//! The entry point is [`Redirector::create`]; everything it returns is
//! closed through [`Redirector::close`].

#![forbid(unsafe_code)]

pub mod cache;
pub mod create;
pub mod error;
pub mod fcb;
pub mod minirdr;
pub mod name;
pub mod netroot;
pub mod share_access;
pub mod srv_open;
pub mod sync_helpers;

pub use cache::{CacheManager, FileSizes, NoopCacheManager};
pub use create::{CreateParams, FileObject, Redirector, RedirectorConfig, RelatedBase};
pub use error::Error;
pub use fcb::{Fcb, FcbCondition, FcbKind, FcbTable};
pub use minirdr::{CollapseQuery, CreateReply, MiniRedirector, MrxCreateContext, OpenReply};
pub use name::{Canonicalized, Control};
pub use netroot::{
    NetRoot, NetRootProvider, NetRootType, ResolveOutcome, ResolveWaiter, ResolvedRoot, SrvCall,
    VNetRoot,
};
pub use share_access::ShareAccess;
pub use srv_open::{SrvOpen, SrvOpenCondition};

pub use rdbss_fscc::{CreateDisposition, CreateOptions, FileAccessMask, ShareAccessFlags};

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
