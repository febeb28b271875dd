//! File control blocks and the per-share FCB table.
//!
//! An FCB represents one uniquely-named object on a share. The table is the
//! single synchronization chokepoint guaranteeing at most one FCB per
//! canonical remaining path per net root: lookups take the table lock
//! shared, structural mutation takes it exclusive, and a version counter
//! lets the lock-upgrade path detect whether it raced another inserter.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Error;
use crate::netroot::NetRoot;
use crate::share_access::ShareAccess;
use crate::srv_open::SrvOpen;
use crate::sync_helpers::{Arc, Weak, lock_mutex, read_lock, wait_condvar, write_lock};
use std::sync::{Condvar, Mutex, MutexGuard};

/// The FCB condition state machine:
/// `BeingCreated -> {Good, Bad}`, and `Good|Bad -> Scavenged` once the FCB
/// leaves the table. `BeingCreated` is the only state other threads block
/// on; they wait for the transition signal before touching the FCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcbCondition {
    BeingCreated,
    Good,
    Bad,
    Scavenged,
}

/// What kind of object the FCB stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcbKind {
    /// A file or directory on a disk or print share.
    Storage,
    /// A named pipe instance.
    Pipe,
    /// A mailslot; opened without any server-open machinery.
    Mailslot,
    /// A rename-support stub that resolves a parent directory. Supports
    /// only close and cleanup.
    TargetDirectory,
}

/// Mutable FCB state, guarded by the FCB's own lock.
pub struct FcbState {
    pub condition: FcbCondition,
    /// Logical opens currently referencing this FCB.
    pub open_count: u32,
    /// Opens that have not yet been cleaned up.
    pub unclean_count: u32,
    /// Set when collapsing onto this FCB's server opens is forbidden
    /// (backup intent, delete-on-close, or a per-server-open share conflict).
    pub collapsing_disabled: bool,
    /// Share-mode counters for the opens the caller can see.
    pub share_access: ShareAccess,
    /// Independent share-mode counters for the server opens; these drive the
    /// purge/close-behind decisions taken before going to the server.
    pub share_access_per_srv_opens: ShareAccess,
    /// Server opens established on this FCB.
    pub srv_opens: Vec<Arc<SrvOpen>>,
    pub file_size: u64,
    pub allocation_size: u64,
    /// Reported read-only by the server; collapsing onto such opens is
    /// unsafe when byte-range locks may differ, unless the global override
    /// is set.
    pub read_only: bool,
}

/// One uniquely-named object on a share.
pub struct Fcb {
    /// The table key: the canonical remaining path, immutable after insert.
    path: String,
    kind: FcbKind,
    net_root: Weak<NetRoot>,
    /// Asynchronous "please remove me" request from cache management,
    /// honored lazily by the next lookup that observes it under the
    /// exclusive table lock.
    should_be_orphaned: AtomicBool,
    state: Mutex<FcbState>,
    transition: Condvar,
}

impl Fcb {
    fn new(path: impl Into<String>, kind: FcbKind, net_root: &Arc<NetRoot>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            kind,
            net_root: Arc::downgrade(net_root),
            should_be_orphaned: AtomicBool::new(false),
            state: Mutex::new(FcbState {
                condition: FcbCondition::BeingCreated,
                open_count: 0,
                unclean_count: 0,
                collapsing_disabled: false,
                share_access: ShareAccess::default(),
                share_access_per_srv_opens: ShareAccess::default(),
                srv_opens: Vec::new(),
                file_size: 0,
                allocation_size: 0,
                read_only: false,
            }),
            transition: Condvar::new(),
        })
    }

    /// Builds a standalone stub FCB that is never inserted into a table.
    /// Used by the open-target-directory path.
    pub(crate) fn new_stub(path: impl Into<String>, net_root: &Arc<NetRoot>) -> Arc<Self> {
        Self::new(path, FcbKind::TargetDirectory, net_root)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> FcbKind {
        self.kind
    }

    pub fn net_root(&self) -> Option<Arc<NetRoot>> {
        self.net_root.upgrade()
    }

    /// Acquires the FCB's state lock.
    pub fn lock(&self) -> MutexGuard<'_, FcbState> {
        lock_mutex(&self.state)
    }

    /// Blocks until the FCB leaves `BeingCreated`. The guard is released
    /// while waiting and reacquired before returning.
    pub fn wait_stable<'a>(&'a self, mut guard: MutexGuard<'a, FcbState>) -> MutexGuard<'a, FcbState> {
        while guard.condition == FcbCondition::BeingCreated {
            guard = wait_condvar(&self.transition, guard);
        }
        guard
    }

    /// Moves the FCB to a new condition and wakes every stabilization
    /// waiter.
    pub fn transition(&self, guard: &mut MutexGuard<'_, FcbState>, condition: FcbCondition) {
        log::trace!(
            "fcb {:?}: condition {:?} -> {:?}",
            self.path,
            guard.condition,
            condition
        );
        guard.condition = condition;
        self.transition.notify_all();
    }

    /// Requests lazy removal from the table.
    pub fn mark_orphaned(&self) {
        self.should_be_orphaned.store(true, Ordering::Release);
    }

    pub fn should_be_orphaned(&self) -> bool {
        self.should_be_orphaned.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Fcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fcb")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

struct TableInner {
    map: HashMap<String, Arc<Fcb>>,
    /// Bumped on every insert/remove; a reader that upgrades to the
    /// exclusive lock re-looks-up only if this moved underneath it.
    version: u64,
}

/// The per-net-root path -> FCB map.
pub struct FcbTable {
    inner: RwLock<TableInner>,
    capacity: Option<usize>,
}

impl FcbTable {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                map: HashMap::new(),
                version: 0,
            }),
            capacity,
        }
    }

    pub fn version(&self) -> u64 {
        read_lock(&self.inner).version
    }

    pub fn len(&self) -> usize {
        read_lock(&self.inner).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact-path lookup; orphaned entries are reported as misses.
    pub fn lookup(&self, path: &str) -> Option<Arc<Fcb>> {
        let inner = read_lock(&self.inner);
        inner
            .map
            .get(path)
            .filter(|fcb| !fcb.should_be_orphaned())
            .cloned()
    }

    /// Every FCB currently in the table.
    pub fn snapshot(&self) -> Vec<Arc<Fcb>> {
        read_lock(&self.inner).map.values().cloned().collect()
    }

    /// Finds the FCB for `path`, or inserts a new one in `BeingCreated`.
    ///
    /// Returns the FCB and whether this caller created it. A caller that
    /// *found* the FCB must wait for it to stabilize before relying on its
    /// condition. Optimistic-then-pessimistic: the shared-lock lookup
    /// records the table version, and the exclusive path re-looks-up only
    /// when the version moved or an orphan has to be honored.
    pub fn find_or_create(
        &self,
        net_root: &Arc<NetRoot>,
        path: &str,
        kind: FcbKind,
    ) -> crate::Result<(Arc<Fcb>, bool)> {
        let mut saw_orphan = false;
        let version = {
            let inner = read_lock(&self.inner);
            match inner.map.get(path) {
                Some(fcb) if !fcb.should_be_orphaned() => return Ok((fcb.clone(), false)),
                Some(_) => saw_orphan = true,
                None => {}
            }
            inner.version
        };

        let mut inner = write_lock(&self.inner);
        if saw_orphan || inner.version != version {
            // The shared-lock read went stale across the upgrade; re-lookup
            // before creating.
            if let Some(fcb) = inner.map.get(path).cloned() {
                if fcb.should_be_orphaned() {
                    log::debug!("fcb {path:?}: honoring orphan request");
                    inner.map.remove(path);
                    inner.version += 1;
                    let mut guard = fcb.lock();
                    if guard.condition != FcbCondition::Scavenged {
                        fcb.transition(&mut guard, FcbCondition::Scavenged);
                    }
                } else {
                    return Ok((fcb, false));
                }
            }
        }

        if let Some(capacity) = self.capacity {
            if inner.map.len() >= capacity {
                log::error!("fcb table for {:?} is full ({capacity} entries)", net_root.name());
                return Err(Error::OutOfMemory);
            }
        }

        let fcb = Fcb::new(path, kind, net_root);
        inner.map.insert(path.to_owned(), fcb.clone());
        inner.version += 1;
        log::trace!("fcb {path:?}: created (table version {})", inner.version);
        Ok((fcb, true))
    }

    /// Removes `fcb` if it is still the entry for its path. Returns whether
    /// anything was removed.
    pub fn remove(&self, fcb: &Arc<Fcb>) -> bool {
        let mut inner = write_lock(&self.inner);
        match inner.map.get(fcb.path()) {
            Some(current) if Arc::ptr_eq(current, fcb) => {
                inner.map.remove(fcb.path());
                inner.version += 1;
                true
            }
            _ => false,
        }
    }
}
