//! Shared scaffolding for create-pipeline integration tests: a scriptable
//! mini-redirector and an in-process connection engine.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use rdbss::sync_helpers::Arc;
use rdbss::{
    Canonicalized, CreateReply, Error, FileAccessMask, MiniRedirector, MrxCreateContext, NetRoot,
    NetRootProvider, NetRootType, OpenReply, Redirector, ResolveOutcome, ResolveWaiter,
    ResolvedRoot, ShareAccessFlags, SrvCall, SrvOpen, VNetRoot,
};

/// One scripted answer for a create calldown; the default when the script
/// runs dry is a successful open of a fresh handle.
pub enum ScriptedCreate {
    Open(OpenReply),
    Fail(Error),
    Reparse(String),
}

#[derive(Default)]
pub struct MockMiniRedirector {
    pub create_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub flush_calls: AtomicUsize,
    pub reject_directories: AtomicBool,
    /// Milliseconds each create calldown sleeps before answering; lets a
    /// test hold several builds in flight at once.
    pub create_delay_ms: AtomicU64,
    /// The extended-attribute blob seen by the last tree-connect validation.
    pub last_tree_connect_ea: Mutex<Option<Vec<u8>>>,
    next_handle: AtomicU64,
    script: Mutex<VecDeque<ScriptedCreate>>,
}

impl MockMiniRedirector {
    pub fn script(&self, step: ScriptedCreate) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn created(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn flushed(&self) -> usize {
        self.flush_calls.load(Ordering::SeqCst)
    }

    fn default_reply(&self) -> OpenReply {
        OpenReply {
            remote_handle: self.next_handle.fetch_add(1, Ordering::SeqCst) + 1,
            file_size: 0x1000,
            allocation_size: 0x1000,
            read_only: false,
        }
    }
}

impl MiniRedirector for MockMiniRedirector {
    fn create(&self, context: &mut MrxCreateContext<'_>) -> rdbss::Result<CreateReply> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        match self.script.lock().unwrap().pop_front() {
            None => Ok(CreateReply::Opened(self.default_reply())),
            Some(ScriptedCreate::Open(reply)) => Ok(CreateReply::Opened(reply)),
            Some(ScriptedCreate::Fail(error)) => Err(error),
            Some(ScriptedCreate::Reparse(target)) => {
                context.request_reparse(target);
                Ok(CreateReply::Reparse)
            }
        }
    }

    fn is_valid_directory(
        &self,
        _v_net_root: &Arc<VNetRoot>,
        _remaining_name: &str,
        ea_buffer: Option<&[u8]>,
    ) -> rdbss::Result<()> {
        *self.last_tree_connect_ea.lock().unwrap() = ea_buffer.map(<[u8]>::to_vec);
        if self.reject_directories.load(Ordering::SeqCst) {
            Err(Error::PathInvalid)
        } else {
            Ok(())
        }
    }

    fn close_srv_open(&self, _srv_open: &Arc<SrvOpen>) -> rdbss::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush_buffering_updates(&self) {
        self.flush_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-process connection engine: one net root per canonical prefix,
/// with optional scripted failures, a one-shot pending resolution and a
/// one-shot mailslot reparse answer.
#[derive(Default)]
pub struct MockProvider {
    pub resolve_calls: AtomicUsize,
    pub scavenge_calls: AtomicUsize,
    pub pending_once: AtomicBool,
    pub abandon_once: AtomicBool,
    pub mailslot_reparse_once: AtomicBool,
    failures: Mutex<VecDeque<Error>>,
    roots: Mutex<HashMap<String, (Arc<NetRoot>, Arc<VNetRoot>)>>,
}

impl MockProvider {
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn net_root(&self, prefix: &str) -> Option<Arc<NetRoot>> {
        self.roots
            .lock()
            .unwrap()
            .get(prefix)
            .map(|(net_root, _)| net_root.clone())
    }

    fn resolve_sync(&self, canon: &Canonicalized) -> rdbss::Result<ResolvedRoot> {
        let prefix = &canon.name[..canon.net_root_length];
        let root_type = match canon.root_type {
            NetRootType::Wild => NetRootType::Disk,
            other => other,
        };
        let mut roots = self.roots.lock().unwrap();
        let (net_root, v_net_root) = roots
            .entry(prefix.to_owned())
            .or_insert_with(|| {
                let components: Vec<&str> = prefix.split('\\').collect();
                let server = components[components.len() - 2];
                let share = components[components.len() - 1];
                let net_root = NetRoot::new(
                    Arc::new(SrvCall::new(server)),
                    format!("\\{server}\\{share}"),
                    root_type,
                    None,
                );
                let v_net_root = VNetRoot::new(net_root.clone(), prefix, 0);
                (net_root, v_net_root)
            })
            .clone();
        Ok(ResolvedRoot {
            net_root,
            v_net_root,
        })
    }
}

impl NetRootProvider for MockProvider {
    fn resolve(&self, name: &Canonicalized) -> ResolveOutcome {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.mailslot_reparse_once.swap(false, Ordering::SeqCst) {
            return ResolveOutcome::MailslotReparse;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return ResolveOutcome::Done(Err(error));
        }
        if self.pending_once.swap(false, Ordering::SeqCst) {
            let waiter = ResolveWaiter::new();
            let signaller = waiter.clone();
            let resolved = self.resolve_sync(name);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signaller.complete(resolved);
            });
            return ResolveOutcome::Pending(waiter);
        }
        if self.abandon_once.swap(false, Ordering::SeqCst) {
            let waiter = ResolveWaiter::new();
            let abandoner = waiter.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                abandoner.abandon();
            });
            return ResolveOutcome::Pending(waiter);
        }
        ResolveOutcome::Done(self.resolve_sync(name))
    }

    fn scavenge_stale_connections(&self) {
        self.scavenge_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn make_redirector() -> (Redirector, Arc<MockMiniRedirector>, Arc<MockProvider>) {
    let minirdr = Arc::new(MockMiniRedirector::default());
    let provider = Arc::new(MockProvider::default());
    let redirector = Redirector::new(minirdr.clone(), provider.clone());
    (redirector, minirdr, provider)
}

pub fn access(read: bool, write: bool, delete: bool) -> FileAccessMask {
    FileAccessMask::new()
        .with_read_data(read)
        .with_write_data(write)
        .with_delete(delete)
}

pub fn share(read: bool, write: bool, delete: bool) -> ShareAccessFlags {
    ShareAccessFlags::new()
        .with_read(read)
        .with_write(write)
        .with_delete(delete)
}
