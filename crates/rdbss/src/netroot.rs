//! Server-connection and share-connection objects.
//!
//! A canonical name resolves into a `SrvCall` (the server connection), a
//! `NetRoot` (the share on that server) and a `VNetRoot` (the per-credential
//! view of the share). Construction of these objects is the connection
//! engine's business; the pipeline only consumes them through the
//! [`NetRootProvider`] boundary.

use crate::Error;
use crate::fcb::FcbTable;
use crate::name::Canonicalized;
use crate::sync_helpers::{Arc, Event};

/// Classification of the target a net root serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRootType {
    /// A disk share.
    Disk,
    /// A print share.
    Print,
    /// A named-pipe share (`IPC$`).
    Pipe,
    /// A mailslot target.
    Mailslot,
    /// Not yet known; resolved by the connection engine.
    Wild,
}

impl NetRootType {
    /// Pipe and print shares are inherently multi-reader/writer, so the
    /// caller's requested share mode is overridden with full sharing.
    pub fn forces_full_share_access(&self) -> bool {
        matches!(self, NetRootType::Pipe | NetRootType::Print)
    }
}

/// A connection to one server.
pub struct SrvCall {
    server_name: String,
}

impl SrvCall {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// One share on a server. Owns the FCB table for every file opened through
/// the share.
pub struct NetRoot {
    srv_call: Arc<SrvCall>,
    /// `\server\share`, as canonicalized.
    name: String,
    root_type: NetRootType,
    fcb_table: FcbTable,
}

impl NetRoot {
    pub fn new(
        srv_call: Arc<SrvCall>,
        name: impl Into<String>,
        root_type: NetRootType,
        fcb_capacity: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            srv_call,
            name: name.into(),
            root_type,
            fcb_table: FcbTable::new(fcb_capacity),
        })
    }

    pub fn srv_call(&self) -> &Arc<SrvCall> {
        &self.srv_call
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_type(&self) -> NetRootType {
        self.root_type
    }

    pub fn fcb_table(&self) -> &FcbTable {
        &self.fcb_table
    }
}

/// The per-credential view of a net root. Two users mapping the same share
/// get distinct v-net-roots over one `NetRoot`.
pub struct VNetRoot {
    net_root: Arc<NetRoot>,
    /// The canonical prefix that names this view, deviceful portion included
    /// (e.g. `\;m:0\server\share`). Related opens are synthesized from it.
    prefix: String,
    /// Distinguishes connections established with different credentials.
    credential_tag: u64,
}

impl VNetRoot {
    pub fn new(net_root: Arc<NetRoot>, prefix: impl Into<String>, credential_tag: u64) -> Arc<Self> {
        Arc::new(Self {
            net_root,
            prefix: prefix.into(),
            credential_tag,
        })
    }

    pub fn net_root(&self) -> &Arc<NetRoot> {
        &self.net_root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn credential_tag(&self) -> u64 {
        self.credential_tag
    }
}

/// A successful resolution: the pair of connection objects that will own the
/// file, with the server call reachable through the net root.
pub struct ResolvedRoot {
    pub net_root: Arc<NetRoot>,
    pub v_net_root: Arc<VNetRoot>,
}

/// Completion handle for an in-flight asynchronous resolution. The
/// connection engine resolves it exactly once, with [`ResolveWaiter::
/// complete`] or [`ResolveWaiter::abandon`].
#[derive(Default)]
pub struct ResolveWaiter {
    event: Event<crate::Result<ResolvedRoot>>,
}

impl ResolveWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Finishes the resolution, resuming the suspended create operation.
    pub fn complete(&self, result: crate::Result<ResolvedRoot>) {
        self.event.signal(result);
    }

    /// Abandons the resolution; the suspended create operation resumes
    /// with [`Error::Cancelled`] as its terminal status.
    pub fn abandon(&self) {
        self.event.signal(Err(Error::Cancelled));
    }

    pub(crate) fn wait(&self) -> crate::Result<ResolvedRoot> {
        self.event.wait()
    }
}

/// What the connection engine answered for a canonical name.
pub enum ResolveOutcome {
    /// Resolution finished synchronously.
    Done(crate::Result<ResolvedRoot>),
    /// Resolution is in flight; the create operation suspends on the waiter
    /// and is resumed by whichever thread completes or abandons it.
    Pending(Arc<ResolveWaiter>),
    /// The target is a mailslot that must be re-canonicalized from scratch
    /// before resolution is retried.
    MailslotReparse,
}

/// The connection-engine boundary: finds or constructs the net root that a
/// canonical name belongs to.
pub trait NetRootProvider: Send + Sync {
    /// Resolves a canonical name to its connection objects, constructing
    /// them if needed.
    fn resolve(&self, name: &Canonicalized) -> ResolveOutcome;

    /// Tears down stale per-credential connections. Invoked once when a
    /// resolution fails with a credential conflict, before the single retry.
    fn scavenge_stale_connections(&self) {}
}
