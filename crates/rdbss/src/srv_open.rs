//! Server opens and the open-collapsing machinery.
//!
//! A server open is one open instance of an FCB as seen by a particular
//! v-net-root and access/share combination. When a new logical open matches
//! an existing stable server open exactly, the pipeline collapses onto it
//! instead of paying a server round trip; otherwise it builds a new one and
//! calls down into the protocol layer.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::Error;
use crate::cache::{CacheManager, FileSizes};
use crate::create::{CreateParams, Redirector};
use crate::fcb::{Fcb, FcbCondition};
use crate::minirdr::{CollapseQuery, CreateReply, MiniRedirector, MrxCreateContext, OpenReply};
use crate::netroot::VNetRoot;
use crate::sync_helpers::{Arc, Weak, lock_mutex, wait_condvar};
use rdbss_fscc::{FileAccessMask, ShareAccessFlags};

/// The server-open condition state machine: `BeingCreated -> {Good, Bad}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrvOpenCondition {
    BeingCreated,
    Good,
    Bad,
}

/// Per-open flags. A server open may be collapsed onto only while `Good`
/// and none of these are set (`close_delayed` merely removes it from the
/// delayed-close scavenger's reach once cleared).
#[derive(Debug, Clone, Copy, Default)]
pub struct SrvOpenFlags {
    pub closed: bool,
    pub collapsing_disabled: bool,
    pub file_renamed: bool,
    pub file_deleted: bool,
    pub close_delayed: bool,
}

/// Mutable server-open state, guarded by the server open's own lock.
/// Acquired only after the owning FCB's lock, never before.
pub struct SrvOpenState {
    pub condition: SrvOpenCondition,
    /// Logical opens riding on this server open.
    pub open_count: u32,
    pub flags: SrvOpenFlags,
    /// The terminal status recorded when construction failed, surfaced to
    /// every waiter that pinned this open during the transition.
    pub failure: Option<Error>,
    /// Guards the per-server-open share-access accounting: added at most
    /// once, removed at most once.
    pub share_access_added: bool,
    /// Opaque remote handle from the mini-redirector.
    pub remote_handle: Option<u64>,
}

/// One open instance of an FCB on a particular v-net-root.
pub struct SrvOpen {
    fcb: Weak<Fcb>,
    v_net_root: Arc<VNetRoot>,
    desired_access: FileAccessMask,
    share_access: ShareAccessFlags,
    /// Whether this open addressed the reparse point itself; a new request
    /// with the opposite option can never collapse onto it.
    open_reparse_point: bool,
    state: Mutex<SrvOpenState>,
    transition: Condvar,
}

impl SrvOpen {
    pub(crate) fn new(
        fcb: &Arc<Fcb>,
        v_net_root: &Arc<VNetRoot>,
        desired_access: FileAccessMask,
        share_access: ShareAccessFlags,
        open_reparse_point: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            fcb: Arc::downgrade(fcb),
            v_net_root: v_net_root.clone(),
            desired_access,
            share_access,
            open_reparse_point,
            state: Mutex::new(SrvOpenState {
                condition: SrvOpenCondition::BeingCreated,
                open_count: 0,
                flags: SrvOpenFlags::default(),
                failure: None,
                share_access_added: false,
                remote_handle: None,
            }),
            transition: Condvar::new(),
        })
    }

    pub fn fcb(&self) -> Option<Arc<Fcb>> {
        self.fcb.upgrade()
    }

    pub fn v_net_root(&self) -> &Arc<VNetRoot> {
        &self.v_net_root
    }

    pub fn desired_access(&self) -> FileAccessMask {
        self.desired_access
    }

    pub fn share_access(&self) -> ShareAccessFlags {
        self.share_access
    }

    pub fn open_reparse_point(&self) -> bool {
        self.open_reparse_point
    }

    pub fn lock(&self) -> MutexGuard<'_, SrvOpenState> {
        lock_mutex(&self.state)
    }

    /// Blocks until the server open leaves `BeingCreated`.
    pub fn wait_stable<'a>(
        &'a self,
        mut guard: MutexGuard<'a, SrvOpenState>,
    ) -> MutexGuard<'a, SrvOpenState> {
        while guard.condition == SrvOpenCondition::BeingCreated {
            guard = wait_condvar(&self.transition, guard);
        }
        guard
    }

    /// Moves the server open to a new condition and wakes stabilization
    /// waiters.
    pub fn transition(&self, guard: &mut MutexGuard<'_, SrvOpenState>, condition: SrvOpenCondition) {
        guard.condition = condition;
        self.transition.notify_all();
    }
}

/// How a collapse-or-create round ended.
pub(crate) enum CollapseOutcome {
    /// A server open (new or reused) is ready for completion bookkeeping.
    Open(Arc<SrvOpen>),
    /// The server redirected the open; retry at the target path.
    Reparse(String),
}

/// What one scan over the FCB's server-open list produced.
enum Scan {
    Match(Arc<SrvOpen>),
    Transitional(Arc<SrvOpen>),
    ReparseMismatch,
    None,
}

impl Redirector {
    /// Finds a compatible existing server open for the request, or builds a
    /// new one and calls down into the protocol layer.
    pub(crate) fn collapse_or_create_srv_open(
        &self,
        fcb: &Arc<Fcb>,
        v_net_root: &Arc<VNetRoot>,
        params: &CreateParams,
        share: ShareAccessFlags,
        remaining: &str,
    ) -> crate::Result<CollapseOutcome> {
        let options = params.create_options;
        if options.open_for_backup_intent() || options.delete_on_close() {
            // These opens must always reach the server fresh, and nothing
            // may collapse onto this FCB afterwards either.
            fcb.lock().collapsing_disabled = true;
            self.scavenge_delayed_closes(fcb);
            self.cache().purge_cached_data(fcb, None, false, true);
        } else if params.disposition.is_open_existing() {
            if let Some(existing) = self.find_collapsible_srv_open(fcb, v_net_root, params, share)? {
                return Ok(CollapseOutcome::Open(existing));
            }
        }
        self.build_new_srv_open(fcb, v_net_root, params, share, remaining)
    }

    fn find_collapsible_srv_open(
        &self,
        fcb: &Arc<Fcb>,
        v_net_root: &Arc<VNetRoot>,
        params: &CreateParams,
        share: ShareAccessFlags,
    ) -> crate::Result<Option<Arc<SrvOpen>>> {
        if fcb.lock().collapsing_disabled {
            return Ok(None);
        }
        let search_query = CollapseQuery {
            fcb,
            srv_open: None,
            desired_access: params.desired_access,
            share_access: share,
            disposition: params.disposition,
            create_options: params.create_options,
        };
        if !self.minirdr().should_collapse_this_open(&search_query) {
            return Ok(None);
        }

        let mut scavenged = false;
        let mut purged = false;
        loop {
            let found = {
                let guard = fcb.lock();
                let mut found = Scan::None;
                for srv_open in &guard.srv_opens {
                    if !Arc::ptr_eq(srv_open.v_net_root(), v_net_root) {
                        continue;
                    }
                    if srv_open.desired_access() != params.desired_access
                        || srv_open.share_access() != share
                    {
                        continue;
                    }
                    let mut state = srv_open.lock();
                    let flags = state.flags;
                    if flags.closed
                        || flags.file_renamed
                        || flags.file_deleted
                        || flags.collapsing_disabled
                    {
                        continue;
                    }
                    if srv_open.open_reparse_point() != params.create_options.open_reparse_point()
                    {
                        found = Scan::ReparseMismatch;
                        break;
                    }
                    if guard.read_only && !self.config().collapse_readonly_opens {
                        // Collapsing a read-only target is unsafe to share
                        // once byte-range locks come into play.
                        continue;
                    }
                    match state.condition {
                        SrvOpenCondition::Good => {
                            found = Scan::Match(srv_open.clone());
                            break;
                        }
                        SrvOpenCondition::BeingCreated => {
                            // Pin the candidate before the FCB lock goes
                            // away for the stabilization wait.
                            state.open_count += 1;
                            found = Scan::Transitional(srv_open.clone());
                            break;
                        }
                        SrvOpenCondition::Bad => continue,
                    }
                }
                found
            };

            match found {
                Scan::Match(candidate) => {
                    let confirm = CollapseQuery {
                        srv_open: Some(&candidate),
                        ..search_query
                    };
                    if !self.minirdr().should_collapse_this_open(&confirm) {
                        return Ok(None);
                    }
                    self.minirdr().collapse_open(&confirm)?;
                    log::debug!("collapsed onto existing srv-open for {:?}", fcb.path());
                    return Ok(Some(candidate));
                }
                Scan::Transitional(candidate) => {
                    let guard = candidate.lock();
                    let mut guard = candidate.wait_stable(guard);
                    let condition = guard.condition;
                    let failure = guard.failure.clone();
                    guard.open_count -= 1;
                    drop(guard);
                    // Reacquire the FCB lock before proceeding, per the
                    // Table -> Fcb -> SrvOpen ordering contract.
                    drop(fcb.lock());
                    match condition {
                        SrvOpenCondition::Good => continue,
                        SrvOpenCondition::Bad => {
                            return Err(failure.unwrap_or(Error::Unsuccessful));
                        }
                        SrvOpenCondition::BeingCreated => unreachable!("wait_stable returned early"),
                    }
                }
                Scan::ReparseMismatch => {
                    // A reparse-point-option mismatch poisons the whole
                    // candidate set; clear the decks and build fresh.
                    self.scavenge_delayed_closes(fcb);
                    self.cache().purge_cached_data(fcb, None, false, true);
                    return Ok(None);
                }
                Scan::None => {
                    if !scavenged {
                        scavenged = true;
                        self.scavenge_delayed_closes(fcb);
                        continue;
                    }
                    if !purged {
                        purged = true;
                        self.cache().purge_cached_data(fcb, None, false, true);
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn build_new_srv_open(
        &self,
        fcb: &Arc<Fcb>,
        v_net_root: &Arc<VNetRoot>,
        params: &CreateParams,
        share: ShareAccessFlags,
        remaining: &str,
    ) -> crate::Result<CollapseOutcome> {
        // The per-server-open share check runs before a server round trip:
        // on conflict, give a later retry its best chance first.
        {
            let mut guard = fcb.lock();
            if let Err(violation) = guard
                .share_access_per_srv_opens
                .check(params.desired_access, share)
            {
                guard.collapsing_disabled = true;
                drop(guard);
                log::debug!(
                    "srv-open share conflict on {:?}; scavenging and purging before reporting",
                    fcb.path()
                );
                self.scavenge_delayed_closes(fcb);
                self.cache().purge_cached_data(fcb, None, true, true);
                return Err(violation);
            }
        }

        let srv_open = SrvOpen::new(
            fcb,
            v_net_root,
            params.desired_access,
            share,
            params.create_options.open_reparse_point(),
        );
        fcb.lock().srv_opens.push(srv_open.clone());

        // The calldown runs with the FCB lock released; the BeingCreated
        // condition keeps every concurrent open parked on the transition
        // signal instead.
        let mut context = MrxCreateContext::new(
            fcb,
            &srv_open,
            v_net_root,
            remaining,
            params.desired_access,
            share,
            params.disposition,
            params.create_options,
            params.ea_buffer.as_deref(),
        );
        match self.minirdr().create(&mut context) {
            Ok(CreateReply::Opened(reply)) => {
                if context.reparse_requested() {
                    log::error!("mini-redirector requested reparse but returned an opened reply");
                    debug_assert!(false, "reparse contract violated by mini-redirector");
                    self.fail_srv_open(fcb, &srv_open, Error::Unsuccessful);
                    return Err(Error::Unsuccessful);
                }
                self.complete_srv_open(fcb, &srv_open, params, reply)?;
                Ok(CollapseOutcome::Open(srv_open))
            }
            Ok(CreateReply::Reparse) => {
                let Some(target) = context.take_reparse_target() else {
                    log::error!("mini-redirector signalled reparse without a target");
                    debug_assert!(false, "reparse contract violated by mini-redirector");
                    self.fail_srv_open(fcb, &srv_open, Error::Unsuccessful);
                    return Err(Error::Unsuccessful);
                };
                log::debug!("create of {:?} reparsed to {target:?}", fcb.path());
                // The abandoned server open surfaces a generic failure to
                // anyone who pinned it during the transition.
                self.fail_srv_open(fcb, &srv_open, Error::Unsuccessful);
                Ok(CollapseOutcome::Reparse(target))
            }
            Err(error) => {
                log::debug!("mini-redirector create failed for {:?}: {error}", fcb.path());
                self.fail_srv_open(fcb, &srv_open, error.clone());
                // Protocol-layer statuses pass through verbatim. The FCB
                // reference stays with the caller: we do not give back the
                // FCB here.
                Err(error)
            }
        }
    }

    /// Records a successful calldown: share accounting, size bookkeeping,
    /// and the Good transitions (the FCB follows the first server open ever
    /// built on it).
    fn complete_srv_open(
        &self,
        fcb: &Arc<Fcb>,
        srv_open: &Arc<SrvOpen>,
        params: &CreateParams,
        reply: OpenReply,
    ) -> crate::Result<()> {
        let mut guard = fcb.lock();
        {
            let mut state = srv_open.lock();
            state.remote_handle = Some(reply.remote_handle);
            if !state.share_access_added {
                // The FCB lock was released across the calldown; another
                // build may have been accounted since the pre-check, so the
                // check repeats here before the counters are charged.
                if let Err(violation) = guard
                    .share_access_per_srv_opens
                    .check(srv_open.desired_access(), srv_open.share_access())
                {
                    guard.collapsing_disabled = true;
                    state.failure = Some(violation.clone());
                    state.flags.closed = true;
                    srv_open.transition(&mut state, SrvOpenCondition::Bad);
                    drop(state);
                    guard.srv_opens.retain(|open| !Arc::ptr_eq(open, srv_open));
                    if guard.condition == FcbCondition::BeingCreated {
                        fcb.transition(&mut guard, FcbCondition::Bad);
                    }
                    drop(guard);
                    log::debug!(
                        "srv-open share conflict on {:?} surfaced at completion",
                        fcb.path()
                    );
                    if let Err(error) = self.minirdr().close_srv_open(srv_open) {
                        log::error!("close of conflicting srv-open failed: {error}");
                    }
                    self.scavenge_delayed_closes(fcb);
                    self.cache().purge_cached_data(fcb, None, true, true);
                    return Err(violation);
                }
                guard
                    .share_access_per_srv_opens
                    .add(srv_open.desired_access(), srv_open.share_access());
                state.share_access_added = true;
            }
            srv_open.transition(&mut state, SrvOpenCondition::Good);
        }
        guard.read_only = reply.read_only;

        let sizes = FileSizes {
            file_size: reply.file_size,
            allocation_size: reply.allocation_size,
        };
        let was_cached = self.cache().is_file_cached(fcb);
        let diverged =
            guard.file_size != sizes.file_size || guard.allocation_size != sizes.allocation_size;
        guard.file_size = sizes.file_size;
        guard.allocation_size = sizes.allocation_size;
        if params.disposition.is_overwrite() {
            // Truncation happened on the server; the cache layer needs the
            // new sizes before any further I/O.
            if let Err(error) = self.cache().notify_new_file_sizes(fcb, sizes) {
                log::error!("size notification after overwrite failed: {error}");
                self.cache().purge_cached_data(fcb, None, true, true);
            }
        } else if was_cached && diverged {
            // A misbehaving server can report sizes inconsistent with what
            // is cached; reconcile, and purge if reconciliation fails.
            log::debug!(
                "server sizes diverged from cached state for {:?}; reconciling",
                fcb.path()
            );
            if let Err(error) = self.cache().notify_new_file_sizes(fcb, sizes) {
                log::error!("size reconciliation failed: {error}");
                self.cache().purge_cached_data(fcb, None, true, true);
            }
        }

        if guard.condition == FcbCondition::BeingCreated {
            fcb.transition(&mut guard, FcbCondition::Good);
        }
        Ok(())
    }

    /// Unwinds a server open whose calldown did not produce a usable open.
    /// The open leaves the FCB's list; pinned waiters observe `Bad` plus the
    /// recorded status.
    fn fail_srv_open(&self, fcb: &Arc<Fcb>, srv_open: &Arc<SrvOpen>, error: Error) {
        let mut guard = fcb.lock();
        {
            let mut state = srv_open.lock();
            state.failure = Some(error);
            state.flags.closed = true;
            srv_open.transition(&mut state, SrvOpenCondition::Bad);
        }
        guard.srv_opens.retain(|open| !Arc::ptr_eq(open, srv_open));
        if guard.condition == FcbCondition::BeingCreated {
            fcb.transition(&mut guard, FcbCondition::Bad);
        }
    }

    /// Force-closes delayed-close server opens with no remaining logical
    /// opens. Returns how many were closed.
    pub(crate) fn scavenge_delayed_closes(&self, fcb: &Arc<Fcb>) -> usize {
        let mut victims = Vec::new();
        {
            let mut guard = fcb.lock();
            let opens = std::mem::take(&mut guard.srv_opens);
            for srv_open in &opens {
                let mut state = srv_open.lock();
                if state.flags.close_delayed && !state.flags.closed && state.open_count == 0 {
                    state.flags.close_delayed = false;
                    state.flags.closed = true;
                    if state.share_access_added {
                        guard
                            .share_access_per_srv_opens
                            .remove(srv_open.desired_access(), srv_open.share_access());
                        state.share_access_added = false;
                    }
                    victims.push(srv_open.clone());
                }
            }
            guard.srv_opens = opens
                .into_iter()
                .filter(|open| !open.lock().flags.closed)
                .collect();
        }
        for victim in &victims {
            if let Err(error) = self.minirdr().close_srv_open(victim) {
                log::error!("delayed close of srv-open failed: {error}");
            }
        }
        if !victims.is_empty() {
            log::debug!(
                "scavenged {} delayed-close srv-opens on {:?}",
                victims.len(),
                fcb.path()
            );
        }
        victims.len()
    }
}
