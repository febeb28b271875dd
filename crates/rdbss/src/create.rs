//! The create orchestrator.
//!
//! Drives one open from a raw path to a completed file object:
//! canonicalize, bind to a net root, find or create the FCB, arbitrate
//! share access, collapse onto or build a server open, and complete. The
//! orchestrator also owns the outer retry loops: the single
//! scavenge-and-retry on a sharing violation, and the reparse loop for
//! symbolic-link traversal.

use crate::Error;
use crate::cache::{CacheManager, NoopCacheManager};
use crate::fcb::{Fcb, FcbCondition, FcbKind};
use crate::minirdr::MiniRedirector;
use crate::name::{self, Canonicalized};
use crate::netroot::{NetRootProvider, NetRootType, ResolveOutcome, ResolvedRoot, VNetRoot};
use crate::srv_open::{CollapseOutcome, SrvOpen};
use crate::sync_helpers::Arc;
use rdbss_fscc::{CreateDisposition, CreateOptions, FileAccessMask, ShareAccessFlags};

/// Reparse chains longer than this indicate a symbolic-link cycle.
const MAX_REPARSE_DEPTH: u32 = 32;

/// Tunables for the create pipeline.
#[derive(Debug, Clone)]
pub struct RedirectorConfig {
    /// Substituted for the `*` server wildcard in domain-wide mailslot
    /// names.
    pub primary_domain: String,
    /// Allow collapsing onto server opens of files the server reported
    /// read-only.
    pub collapse_readonly_opens: bool,
    /// Keep the remote handle of a server open alive after its last local
    /// open goes away, as long as the FCB itself stays referenced. A later
    /// matching open collapses onto it without a server round trip.
    pub delay_srv_open_close: bool,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        Self {
            primary_domain: "WORKGROUP".to_owned(),
            collapse_readonly_opens: false,
            delay_srv_open_close: true,
        }
    }
}

/// Base for an open relative to an already-opened directory.
pub struct RelatedBase {
    pub fcb: Arc<Fcb>,
    pub v_net_root: Arc<VNetRoot>,
}

/// Everything one create request carries.
pub struct CreateParams {
    /// The raw path: absolute (UNC or deviceful), or relative when
    /// `related` is set.
    pub path: String,
    pub related: Option<RelatedBase>,
    pub desired_access: FileAccessMask,
    pub share_access: ShareAccessFlags,
    pub disposition: CreateDisposition,
    pub create_options: CreateOptions,
    /// Open the parent directory of `path` for a rename, not the file
    /// itself.
    pub open_target_directory: bool,
    /// Establish the connection only; no file is opened.
    pub tree_connect: bool,
    /// Opaque extended-attribute blob forwarded to the protocol layer
    /// (pipe metadata, tree-connect credential side channel).
    pub ea_buffer: Option<Vec<u8>>,
}

impl CreateParams {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            related: None,
            desired_access: FileAccessMask::new().with_read_data(true),
            share_access: ShareAccessFlags::all(),
            disposition: CreateDisposition::Open,
            create_options: CreateOptions::new(),
            open_target_directory: false,
            tree_connect: false,
            ea_buffer: None,
        }
    }
}

/// A completed open. Dropping it leaks the open; hand it back to
/// [`Redirector::close`] instead.
pub struct FileObject {
    fcb: Option<Arc<Fcb>>,
    srv_open: Option<Arc<SrvOpen>>,
    v_net_root: Option<Arc<VNetRoot>>,
    is_unc_name: bool,
    stripped_trailing_separator: bool,
    /// Whether visible share-access counters were charged for this open;
    /// close undoes the accounting exactly once.
    share_access_added: bool,
    desired_access: FileAccessMask,
    share_access: ShareAccessFlags,
}

impl FileObject {
    pub fn fcb(&self) -> Option<&Arc<Fcb>> {
        self.fcb.as_ref()
    }

    pub fn srv_open(&self) -> Option<&Arc<SrvOpen>> {
        self.srv_open.as_ref()
    }

    pub fn v_net_root(&self) -> Option<&Arc<VNetRoot>> {
        self.v_net_root.as_ref()
    }

    /// Whether the caller presented the name in UNC form.
    pub fn is_unc_name(&self) -> bool {
        self.is_unc_name
    }

    /// Whether a trailing separator was stripped during canonicalization.
    pub fn stripped_trailing_separator(&self) -> bool {
        self.stripped_trailing_separator
    }
}

/// What one full attempt (canonicalize through completion) produced.
enum AttemptOutcome {
    Complete(FileObject),
    /// The server redirected the open; the loop restarts at the target.
    Reparse(String),
}

/// The create pipeline with its three injected collaborators.
pub struct Redirector {
    minirdr: Arc<dyn MiniRedirector>,
    provider: Arc<dyn NetRootProvider>,
    cache: Arc<dyn CacheManager>,
    config: RedirectorConfig,
}

impl Redirector {
    pub fn new(minirdr: Arc<dyn MiniRedirector>, provider: Arc<dyn NetRootProvider>) -> Self {
        Self {
            minirdr,
            provider,
            cache: Arc::new(NoopCacheManager),
            config: RedirectorConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheManager>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_config(mut self, config: RedirectorConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn minirdr(&self) -> &dyn MiniRedirector {
        self.minirdr.as_ref()
    }

    pub(crate) fn cache(&self) -> &dyn CacheManager {
        self.cache.as_ref()
    }

    pub(crate) fn config(&self) -> &RedirectorConfig {
        &self.config
    }

    /// Opens (or creates) the file named by `params`.
    ///
    /// A sharing violation triggers exactly one connection scavenge and
    /// retry before it is surfaced; when the disposition demands a brand-new
    /// file it is reported as a name collision instead. Reparse results from
    /// the mini-redirector restart the whole attempt at the target path.
    pub fn create(&self, mut params: CreateParams) -> crate::Result<FileObject> {
        let mut last_v_net_root: Option<Arc<VNetRoot>> = None;
        let mut violation_scavenged = false;
        let mut reparses = 0u32;
        loop {
            match self.create_attempt(&params, &mut last_v_net_root) {
                Ok(AttemptOutcome::Complete(file_object)) => {
                    log::debug!("open of {:?} complete", params.path);
                    return Ok(file_object);
                }
                Ok(AttemptOutcome::Reparse(target)) => {
                    reparses += 1;
                    if reparses > MAX_REPARSE_DEPTH {
                        log::error!("reparse chain exceeded {MAX_REPARSE_DEPTH} links");
                        return Err(Error::PathInvalid);
                    }
                    // Reparse targets are absolute; the related base no
                    // longer applies.
                    params.path = target;
                    params.related = None;
                }
                Err(Error::SharingViolation) => {
                    if params.disposition.must_create_new() {
                        // The conflicting open proves the file exists, which
                        // is itself fatal for this disposition.
                        return Err(Error::NameCollision);
                    }
                    if violation_scavenged {
                        return Err(Error::SharingViolation);
                    }
                    violation_scavenged = true;
                    log::debug!(
                        "sharing violation on {:?}; scavenging the connection and retrying",
                        params.path
                    );
                    if let Some(v_net_root) = &last_v_net_root {
                        self.scavenge_connection(v_net_root);
                    }
                    // A stale buffering state can hold a server-side open
                    // alive past its local death; flush before retrying.
                    self.minirdr.flush_buffering_updates();
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn create_attempt(
        &self,
        params: &CreateParams,
        last_v_net_root: &mut Option<Arc<VNetRoot>>,
    ) -> crate::Result<AttemptOutcome> {
        if params.path.is_empty() && params.related.is_none() && !params.tree_connect {
            // An open of the redirector device itself. No name, no
            // connection; nothing to canonicalize or resolve.
            log::debug!("device-level open");
            return Ok(AttemptOutcome::Complete(FileObject {
                fcb: None,
                srv_open: None,
                v_net_root: None,
                is_unc_name: false,
                stripped_trailing_separator: false,
                share_access_added: false,
                desired_access: params.desired_access,
                share_access: params.share_access,
            }));
        }

        let mut canon = self.canonicalize(params)?;
        self.minirdr.preparse_name(&mut canon.name)?;

        let resolved = self.resolve_with_mailslot_retry(params, &mut canon)?;
        *last_v_net_root = Some(resolved.v_net_root.clone());

        let _ = name::canonicalize_by_server_specs(canon.remaining())?;
        if name::contains_wildcards(canon.remaining()) {
            return Err(Error::InvalidName);
        }

        let root_type = resolved.net_root.root_type();
        if params.tree_connect || canon.remaining().is_empty() {
            return self.open_connection_object(&resolved, &canon, params);
        }

        let share = if root_type.forces_full_share_access() {
            ShareAccessFlags::all()
        } else {
            params.share_access
        };

        if root_type == NetRootType::Mailslot {
            return self.open_mailslot(&resolved, &canon, params, share);
        }
        if params.open_target_directory {
            return self.open_target_directory(&resolved, &canon, params);
        }

        let kind = if root_type == NetRootType::Pipe {
            FcbKind::Pipe
        } else {
            FcbKind::Storage
        };
        self.open_through_fcb(&resolved, &canon, params, share, kind)
    }

    fn canonicalize(&self, params: &CreateParams) -> crate::Result<Canonicalized> {
        match &params.related {
            Some(related) => {
                let net_root = related
                    .v_net_root
                    .net_root();
                name::canonicalize_related(
                    related.v_net_root.prefix(),
                    related.fcb.path(),
                    &params.path,
                    net_root.root_type(),
                )
            }
            None => name::canonicalize(&params.path, &self.config.primary_domain),
        }
    }

    /// Resolves the canonical name to its connection objects. A mailslot
    /// reparse answer re-canonicalizes the raw path once and retries.
    fn resolve_with_mailslot_retry(
        &self,
        params: &CreateParams,
        canon: &mut Canonicalized,
    ) -> crate::Result<ResolvedRoot> {
        let mut mailslot_retried = false;
        loop {
            match self.resolve_net_root(canon)? {
                Some(resolved) => return Ok(resolved),
                None => {
                    if mailslot_retried {
                        log::error!("mailslot target failed to settle after re-canonicalization");
                        return Err(Error::InvalidDeviceRequest);
                    }
                    mailslot_retried = true;
                    *canon = self.canonicalize(params)?;
                }
            }
        }
    }

    /// One resolution round. `Ok(None)` means the connection engine asked
    /// for a mailslot re-canonicalization. A credential conflict scavenges
    /// stale connections once and retries.
    fn resolve_net_root(&self, canon: &Canonicalized) -> crate::Result<Option<ResolvedRoot>> {
        let mut conflict_scavenged = false;
        loop {
            let result = match self.provider.resolve(canon) {
                ResolveOutcome::Done(result) => result,
                ResolveOutcome::Pending(waiter) => waiter.wait(),
                ResolveOutcome::MailslotReparse => return Ok(None),
            };
            match result {
                Ok(resolved) => return Ok(Some(resolved)),
                Err(Error::CredentialConflict) if !conflict_scavenged => {
                    conflict_scavenged = true;
                    log::debug!(
                        "credential conflict resolving {:?}; scavenging stale connections",
                        canon.name
                    );
                    self.provider.scavenge_stale_connections();
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Tree connects and raw device opens: the file object references only
    /// the connection, no FCB.
    fn open_connection_object(
        &self,
        resolved: &ResolvedRoot,
        canon: &Canonicalized,
        params: &CreateParams,
    ) -> crate::Result<AttemptOutcome> {
        if params.tree_connect && !canon.remaining().is_empty() {
            // A tree connect below the share root is legal only when the
            // remaining name is an existing directory.
            self.minirdr.is_valid_directory(
                &resolved.v_net_root,
                canon.remaining(),
                params.ea_buffer.as_deref(),
            )?;
        }
        log::debug!("connection-level open of {:?}", canon.name);
        Ok(AttemptOutcome::Complete(FileObject {
            fcb: None,
            srv_open: None,
            v_net_root: Some(resolved.v_net_root.clone()),
            is_unc_name: canon.is_unc_name,
            stripped_trailing_separator: canon.stripped_trailing_separator,
            share_access_added: false,
            desired_access: params.desired_access,
            share_access: params.share_access,
        }))
    }

    /// Mailslots complete locally: the FCB goes `Good` immediately and no
    /// server open is built.
    fn open_mailslot(
        &self,
        resolved: &ResolvedRoot,
        canon: &Canonicalized,
        params: &CreateParams,
        share: ShareAccessFlags,
    ) -> crate::Result<AttemptOutcome> {
        let table = resolved.net_root.fcb_table();
        let (fcb, created) =
            table.find_or_create(&resolved.net_root, canon.remaining(), FcbKind::Mailslot)?;
        let mut guard = fcb.lock();
        if created {
            fcb.transition(&mut guard, FcbCondition::Good);
        } else {
            guard = fcb.wait_stable(guard);
            if guard.condition != FcbCondition::Good {
                return Err(Error::Unsuccessful);
            }
            if guard.open_count > 0 {
                guard.share_access.check(params.desired_access, share)?;
            }
        }
        guard.share_access.add(params.desired_access, share);
        guard.open_count += 1;
        guard.unclean_count += 1;
        drop(guard);
        Ok(AttemptOutcome::Complete(FileObject {
            fcb: Some(fcb),
            srv_open: None,
            v_net_root: Some(resolved.v_net_root.clone()),
            is_unc_name: canon.is_unc_name,
            stripped_trailing_separator: canon.stripped_trailing_separator,
            share_access_added: true,
            desired_access: params.desired_access,
            share_access: share,
        }))
    }

    /// Rename support: resolves the target's parent on a standalone stub FCB
    /// that never enters the table and supports only close.
    fn open_target_directory(
        &self,
        resolved: &ResolvedRoot,
        canon: &Canonicalized,
        params: &CreateParams,
    ) -> crate::Result<AttemptOutcome> {
        if params.desired_access.delete() {
            // A rename is coming; cached data under the old name would be
            // orphaned by it.
            if let Some(existing) = resolved.net_root.fcb_table().lookup(canon.remaining()) {
                self.cache.purge_cached_data(&existing, None, true, true);
            }
        }
        let stub = Fcb::new_stub(canon.remaining(), &resolved.net_root);
        let mut guard = stub.lock();
        stub.transition(&mut guard, FcbCondition::Good);
        guard.open_count += 1;
        guard.unclean_count += 1;
        drop(guard);
        log::debug!("target-directory open for {:?}", canon.name);
        Ok(AttemptOutcome::Complete(FileObject {
            fcb: Some(stub),
            srv_open: None,
            v_net_root: Some(resolved.v_net_root.clone()),
            is_unc_name: canon.is_unc_name,
            stripped_trailing_separator: canon.stripped_trailing_separator,
            share_access_added: false,
            desired_access: params.desired_access,
            share_access: params.share_access,
        }))
    }

    /// The main path: storage and pipe opens through the FCB table and the
    /// server-open collapser.
    fn open_through_fcb(
        &self,
        resolved: &ResolvedRoot,
        canon: &Canonicalized,
        params: &CreateParams,
        share: ShareAccessFlags,
        kind: FcbKind,
    ) -> crate::Result<AttemptOutcome> {
        let table = resolved.net_root.fcb_table();
        let fcb = loop {
            let (fcb, created) = table.find_or_create(&resolved.net_root, canon.remaining(), kind)?;
            if created {
                break fcb;
            }
            let guard = fcb.lock();
            let guard = fcb.wait_stable(guard);
            match guard.condition {
                FcbCondition::Good => {
                    // Fail fast before any server round trip. The
                    // authoritative check repeats at completion.
                    if guard.open_count > 0 {
                        guard.share_access.check(params.desired_access, share)?;
                    }
                    drop(guard);
                    break fcb;
                }
                FcbCondition::Bad => return Err(Error::Unsuccessful),
                // Lost a race with teardown; the entry is already gone from
                // the table, so the next round creates a fresh one.
                FcbCondition::Scavenged => continue,
                FcbCondition::BeingCreated => unreachable!("wait_stable returned early"),
            }
        };

        match self.collapse_or_create_srv_open(&fcb, &resolved.v_net_root, params, share, canon.remaining())
        {
            Ok(CollapseOutcome::Open(srv_open)) => {
                self.complete_open(resolved, canon, params, share, fcb, srv_open)
            }
            Ok(CollapseOutcome::Reparse(target)) => {
                self.finalize_fcb(&fcb);
                Ok(AttemptOutcome::Reparse(target))
            }
            Err(error) => {
                self.finalize_fcb(&fcb);
                Err(error)
            }
        }
    }

    /// Final bookkeeping for a successful storage or pipe open.
    fn complete_open(
        &self,
        resolved: &ResolvedRoot,
        canon: &Canonicalized,
        params: &CreateParams,
        share: ShareAccessFlags,
        fcb: Arc<Fcb>,
        srv_open: Arc<SrvOpen>,
    ) -> crate::Result<AttemptOutcome> {
        let mut guard = fcb.lock();
        if guard.open_count > 0 {
            // The FCB lock was released across the calldown; the counters
            // may have moved since the pre-check.
            if let Err(violation) = guard.share_access.check(params.desired_access, share) {
                drop(guard);
                self.retire_srv_open(&fcb, &srv_open);
                self.finalize_fcb(&fcb);
                return Err(violation);
            }
        }
        guard.share_access.add(params.desired_access, share);
        guard.open_count += 1;
        guard.unclean_count += 1;
        srv_open.lock().open_count += 1;
        drop(guard);

        Ok(AttemptOutcome::Complete(FileObject {
            fcb: Some(fcb),
            srv_open: Some(srv_open),
            v_net_root: Some(resolved.v_net_root.clone()),
            is_unc_name: canon.is_unc_name,
            stripped_trailing_separator: canon.stripped_trailing_separator,
            share_access_added: true,
            desired_access: params.desired_access,
            share_access: share,
        }))
    }

    /// Closes a file object, undoing its accounting exactly once. The last
    /// close of an FCB tears it down and force-closes any delayed server
    /// opens.
    pub fn close(&self, file_object: FileObject) -> crate::Result<()> {
        let Some(fcb) = file_object.fcb else {
            // Connection-level objects carry no per-file state.
            return Ok(());
        };
        let mut guard = fcb.lock();
        if file_object.share_access_added {
            guard
                .share_access
                .remove(file_object.desired_access, file_object.share_access);
        }
        debug_assert!(guard.open_count > 0, "unbalanced close");
        guard.open_count -= 1;
        guard.unclean_count = guard.unclean_count.saturating_sub(1);
        let fcb_idle = guard.open_count == 0;

        let mut victim = None;
        if let Some(srv_open) = &file_object.srv_open {
            let mut state = srv_open.lock();
            debug_assert!(state.open_count > 0, "unbalanced srv-open close");
            state.open_count -= 1;
            if state.open_count == 0 && !state.flags.closed {
                if self.config.delay_srv_open_close && !fcb_idle {
                    // Keep the remote handle warm for a future collapse.
                    state.flags.close_delayed = true;
                } else {
                    state.flags.closed = true;
                    if state.share_access_added {
                        guard
                            .share_access_per_srv_opens
                            .remove(srv_open.desired_access(), srv_open.share_access());
                        state.share_access_added = false;
                    }
                    victim = Some(srv_open.clone());
                }
            }
            drop(state);
            if victim.is_some() {
                guard.srv_opens.retain(|open| !Arc::ptr_eq(open, srv_open));
            }
        }
        drop(guard);

        if let Some(victim) = victim {
            self.minirdr.close_srv_open(&victim)?;
        }
        if fcb_idle {
            self.finalize_fcb(&fcb);
        }
        Ok(())
    }

    /// Tears down an FCB with no remaining logical opens: force-closes every
    /// surviving server open, moves the FCB to `Scavenged` and drops it from
    /// the table. A no-op while opens remain.
    fn finalize_fcb(&self, fcb: &Arc<Fcb>) {
        let victims = {
            let mut guard = fcb.lock();
            if guard.open_count > 0 {
                return;
            }
            let opens = std::mem::take(&mut guard.srv_opens);
            let mut victims = Vec::new();
            for srv_open in opens {
                let close_needed = {
                    let mut state = srv_open.lock();
                    if state.flags.closed {
                        false
                    } else {
                        state.flags.closed = true;
                        state.flags.close_delayed = false;
                        if state.share_access_added {
                            guard
                                .share_access_per_srv_opens
                                .remove(srv_open.desired_access(), srv_open.share_access());
                            state.share_access_added = false;
                        }
                        true
                    }
                };
                if close_needed {
                    victims.push(srv_open);
                }
            }
            if guard.condition != FcbCondition::Scavenged {
                fcb.transition(&mut guard, FcbCondition::Scavenged);
            }
            victims
        };
        for victim in &victims {
            if let Err(error) = self.minirdr.close_srv_open(victim) {
                log::error!("close of srv-open during fcb teardown failed: {error}");
            }
        }
        if let Some(net_root) = fcb.net_root() {
            net_root.fcb_table().remove(fcb);
        }
    }

    /// Unwinds a server open that never received its logical open.
    fn retire_srv_open(&self, fcb: &Arc<Fcb>, srv_open: &Arc<SrvOpen>) {
        let victim = {
            let mut guard = fcb.lock();
            let mut state = srv_open.lock();
            if state.open_count > 0 || state.flags.closed {
                None
            } else {
                state.flags.closed = true;
                state.flags.close_delayed = false;
                if state.share_access_added {
                    guard
                        .share_access_per_srv_opens
                        .remove(srv_open.desired_access(), srv_open.share_access());
                    state.share_access_added = false;
                }
                drop(state);
                guard.srv_opens.retain(|open| !Arc::ptr_eq(open, srv_open));
                Some(srv_open.clone())
            }
        };
        if let Some(victim) = victim {
            if let Err(error) = self.minirdr.close_srv_open(&victim) {
                log::error!("close of retired srv-open failed: {error}");
            }
        }
    }

    /// Sweeps a connection: force-closes delayed server opens everywhere and
    /// drops idle FCBs from the table. Returns how many server opens were
    /// closed.
    pub fn scavenge_connection(&self, v_net_root: &Arc<VNetRoot>) -> usize {
        let table = v_net_root.net_root().fcb_table();
        let mut closed = 0;
        for fcb in table.snapshot() {
            closed += self.scavenge_delayed_closes(&fcb);
            self.cache.purge_cached_data(&fcb, None, false, true);
            let removable = {
                let mut guard = fcb.lock();
                if guard.open_count == 0
                    && guard.srv_opens.is_empty()
                    && matches!(guard.condition, FcbCondition::Good | FcbCondition::Bad)
                {
                    fcb.transition(&mut guard, FcbCondition::Scavenged);
                    true
                } else {
                    false
                }
            };
            if removable {
                table.remove(&fcb);
            }
        }
        log::debug!(
            "connection scavenge of {:?} closed {closed} srv-opens",
            v_net_root.net_root().name()
        );
        closed
    }
}
