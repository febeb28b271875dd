//! Share-mode arbitration.
//!
//! The classic Windows share-access check: every accounted open contributes
//! to seven counters, and a new open is compatible only if every existing
//! open shares the access it wants, and it shares every access the existing
//! opens hold. Two independent instances exist per FCB: one for opens the
//! caller can see, one for the server opens beneath them.

use crate::Error;
use rdbss_fscc::{FileAccessMask, ShareAccessFlags};

/// Share-mode counters for one FCB.
///
/// Counters are only ever mutated under the owning FCB's state lock, and
/// every [`ShareAccess::remove`] must exactly undo a prior
/// [`ShareAccess::add`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShareAccess {
    pub open_count: u32,
    pub readers: u32,
    pub writers: u32,
    pub deleters: u32,
    pub shared_read: u32,
    pub shared_write: u32,
    pub shared_delete: u32,
}

impl ShareAccess {
    /// Decides whether an open with `desired`/`share` is compatible with the
    /// opens already accounted here. Attribute-only opens are always
    /// compatible.
    pub fn check(&self, desired: FileAccessMask, share: ShareAccessFlags) -> crate::Result<()> {
        if !desired.wants_share_relevant_access() {
            return Ok(());
        }
        let open_count = self.open_count;
        let violation = (desired.wants_read() && self.shared_read < open_count)
            || (desired.wants_write() && self.shared_write < open_count)
            || (desired.wants_delete() && self.shared_delete < open_count)
            || (self.readers > 0 && !share.read())
            || (self.writers > 0 && !share.write())
            || (self.deleters > 0 && !share.delete());
        if violation {
            Err(Error::SharingViolation)
        } else {
            Ok(())
        }
    }

    /// Accounts a new accessor. Must be called at most once per logical
    /// accessor; the caller guards re-entry with its own "already updated"
    /// flag since update paths can be revisited.
    pub fn add(&mut self, desired: FileAccessMask, share: ShareAccessFlags) {
        if !desired.wants_share_relevant_access() {
            return;
        }
        self.open_count += 1;
        self.readers += desired.wants_read() as u32;
        self.writers += desired.wants_write() as u32;
        self.deleters += desired.wants_delete() as u32;
        self.shared_read += share.read() as u32;
        self.shared_write += share.write() as u32;
        self.shared_delete += share.delete() as u32;
    }

    /// Exactly undoes a prior [`ShareAccess::add`] with the same arguments.
    pub fn remove(&mut self, desired: FileAccessMask, share: ShareAccessFlags) {
        if !desired.wants_share_relevant_access() {
            return;
        }
        debug_assert!(self.open_count > 0, "unbalanced share-access removal");
        self.open_count -= 1;
        self.readers -= desired.wants_read() as u32;
        self.writers -= desired.wants_write() as u32;
        self.deleters -= desired.wants_delete() as u32;
        self.shared_read -= share.read() as u32;
        self.shared_write -= share.write() as u32;
        self.shared_delete -= share.delete() as u32;
    }
}
