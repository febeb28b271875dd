//! The pluggable protocol-layer boundary.
//!
//! A mini-redirector implements the per-protocol half of every open: it gets
//! a chance to veto or rewrite names before net-root binding, to refuse
//! collapsing, and it performs the actual remote open for newly built server
//! opens. The pipeline holds the implementation as an injected trait object;
//! multiple protocol backends are interchangeable.

use crate::fcb::Fcb;
use crate::netroot::VNetRoot;
use crate::srv_open::SrvOpen;
use crate::sync_helpers::Arc;
use rdbss_fscc::{CreateDisposition, CreateOptions, FileAccessMask, ShareAccessFlags};

/// Everything a mini-redirector sees when asked to open (or to agree to
/// collapse onto) a server open.
pub struct MrxCreateContext<'a> {
    pub fcb: &'a Arc<Fcb>,
    pub srv_open: &'a Arc<SrvOpen>,
    pub v_net_root: &'a Arc<VNetRoot>,
    /// The canonical remaining name being opened, relative to the net root.
    pub remaining_name: &'a str,
    pub desired_access: FileAccessMask,
    pub share_access: ShareAccessFlags,
    pub disposition: CreateDisposition,
    pub create_options: CreateOptions,
    /// Opaque extended-attribute blob from the caller, if any.
    pub ea_buffer: Option<&'a [u8]>,
    reparse_target: Option<String>,
}

impl<'a> MrxCreateContext<'a> {
    pub(crate) fn new(
        fcb: &'a Arc<Fcb>,
        srv_open: &'a Arc<SrvOpen>,
        v_net_root: &'a Arc<VNetRoot>,
        remaining_name: &'a str,
        desired_access: FileAccessMask,
        share_access: ShareAccessFlags,
        disposition: CreateDisposition,
        create_options: CreateOptions,
        ea_buffer: Option<&'a [u8]>,
    ) -> Self {
        Self {
            fcb,
            srv_open,
            v_net_root,
            remaining_name,
            desired_access,
            share_access,
            disposition,
            create_options,
            ea_buffer,
            reparse_target: None,
        }
    }

    /// Records that the server redirected this open to `target` (symbolic
    /// link traversal). A mini-redirector that calls this must also return
    /// [`CreateReply::Reparse`]; the pipeline asserts the two agree.
    pub fn request_reparse(&mut self, target: impl Into<String>) {
        self.reparse_target = Some(target.into());
    }

    pub(crate) fn take_reparse_target(&mut self) -> Option<String> {
        self.reparse_target.take()
    }

    pub(crate) fn reparse_requested(&self) -> bool {
        self.reparse_target.is_some()
    }
}

/// What the mini-redirector's create calldown produced.
pub enum CreateReply {
    /// The remote open succeeded.
    Opened(OpenReply),
    /// The open must be retried at the target recorded via
    /// [`MrxCreateContext::request_reparse`].
    Reparse,
}

/// Remote-open results the pipeline records on the FCB and server open.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenReply {
    /// Opaque handle the mini-redirector uses to address the remote open.
    pub remote_handle: u64,
    pub file_size: u64,
    pub allocation_size: u64,
    pub read_only: bool,
}

/// The candidate examined by a collapse veto.
///
/// Consulted twice: once for the search phase (`srv_open` is `None`) and
/// once to confirm a concrete candidate.
pub struct CollapseQuery<'a> {
    pub fcb: &'a Arc<Fcb>,
    pub srv_open: Option<&'a Arc<SrvOpen>>,
    pub desired_access: FileAccessMask,
    pub share_access: ShareAccessFlags,
    pub disposition: CreateDisposition,
    pub create_options: CreateOptions,
}

/// The capability hooks a protocol backend provides to the create pipeline.
pub trait MiniRedirector: Send + Sync {
    /// Inspects (and may rewrite) the canonical name before net-root
    /// binding completes. The net-root portion must keep its length.
    fn preparse_name(&self, _name: &mut String) -> crate::Result<()> {
        Ok(())
    }

    /// Veto hook for collapsing a new open onto an existing server open.
    fn should_collapse_this_open(&self, _query: &CollapseQuery<'_>) -> bool {
        true
    }

    /// Performs the remote open for a newly built server open. Called with
    /// the FCB lock released and the server open in `BeingCreated`.
    fn create(&self, context: &mut MrxCreateContext<'_>) -> crate::Result<CreateReply>;

    /// Invoked instead of [`MiniRedirector::create`] when an existing stable
    /// server open is reused.
    fn collapse_open(&self, _query: &CollapseQuery<'_>) -> crate::Result<()> {
        Ok(())
    }

    /// Used only on the tree-connect path to validate a directory below the
    /// share root. The caller's extended-attribute blob rides along as the
    /// connection-credential side channel.
    fn is_valid_directory(
        &self,
        _v_net_root: &Arc<VNetRoot>,
        _remaining_name: &str,
        _ea_buffer: Option<&[u8]>,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Tears down the remote state of a server open whose last local open
    /// went away (or whose delayed close is being scavenged).
    fn close_srv_open(&self, _srv_open: &Arc<SrvOpen>) -> crate::Result<()> {
        Ok(())
    }

    /// Flushes pending buffering-state change notifications. Called before
    /// a sharing-violation retry so a stale oplock-break race cannot cause
    /// a spurious second violation.
    fn flush_buffering_updates(&self) {}
}
