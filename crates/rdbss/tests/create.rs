//! End-to-end tests for the create pipeline against a scriptable
//! mini-redirector and an in-process connection engine.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rdbss::sync_helpers::Arc;
use rdbss::{
    CreateDisposition, CreateParams, Error, FcbCondition, FcbKind, FileAccessMask, RelatedBase,
    SrvOpenCondition,
};

mod common;
use common::{ScriptedCreate, access, make_redirector, share};

const FILE_PATH: &str = "\\Server\\Share\\Dir\\File.txt";
const DEVICEFUL_PATH: &str = "\\;m:0\\Server\\Share\\Dir\\File.txt";

fn read_open(path: &str) -> CreateParams {
    let mut params = CreateParams::new(path);
    params.desired_access = access(true, false, false);
    params.share_access = share(true, true, false);
    params
}

#[test_log::test]
fn test_open_builds_fcb_and_srv_open() {
    let (redirector, minirdr, provider) = make_redirector();

    let opened = redirector.create(read_open(DEVICEFUL_PATH)).unwrap();
    assert_eq!(minirdr.created(), 1);
    assert!(!opened.is_unc_name());

    let fcb = opened.fcb().unwrap();
    assert_eq!(fcb.path(), "\\Dir\\File.txt");
    assert_eq!(fcb.kind(), FcbKind::Storage);
    assert_eq!(fcb.lock().condition, FcbCondition::Good);
    let srv_open = opened.srv_open().unwrap();
    assert_eq!(srv_open.lock().condition, SrvOpenCondition::Good);
    assert!(srv_open.lock().remote_handle.is_some());

    let table_root = provider.net_root("\\;m:0\\Server\\Share").unwrap();
    assert_eq!(table_root.fcb_table().len(), 1);

    redirector.close(opened).unwrap();
    assert_eq!(minirdr.closed(), 1);
    assert!(table_root.fcb_table().is_empty());
}

#[test_log::test]
fn test_identical_open_collapses_without_server_round_trip() {
    let (redirector, minirdr, _provider) = make_redirector();

    let first = redirector.create(read_open(DEVICEFUL_PATH)).unwrap();
    let second = redirector.create(read_open(DEVICEFUL_PATH)).unwrap();
    assert_eq!(minirdr.created(), 1);
    assert!(Arc::ptr_eq(first.fcb().unwrap(), second.fcb().unwrap()));
    assert!(Arc::ptr_eq(first.srv_open().unwrap(), second.srv_open().unwrap()));

    let fcb = first.fcb().unwrap().clone();
    redirector.close(first).unwrap();
    assert_eq!(minirdr.closed(), 0);
    redirector.close(second).unwrap();
    assert_eq!(minirdr.closed(), 1);
    assert_eq!(fcb.lock().condition, FcbCondition::Scavenged);
}

#[test_log::test]
fn test_concurrent_opens_share_one_fcb() {
    let (redirector, minirdr, provider) = make_redirector();
    let redirector = Arc::new(redirector);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let redirector = redirector.clone();
            thread::spawn(move || redirector.create(read_open(FILE_PATH)).expect("open failed"))
        })
        .collect();
    let opened: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(minirdr.created(), 1);
    let first_fcb = opened[0].fcb().unwrap().clone();
    for open in &opened {
        assert!(Arc::ptr_eq(open.fcb().unwrap(), &first_fcb));
    }
    assert_eq!(provider.net_root("\\Server\\Share").unwrap().fcb_table().len(), 1);

    for open in opened {
        redirector.close(open).unwrap();
    }
    assert_eq!(minirdr.closed(), 1);
    assert!(provider.net_root("\\Server\\Share").unwrap().fcb_table().is_empty());
}

#[test_log::test]
fn test_persistent_sharing_violation_retries_exactly_once() {
    let (redirector, minirdr, _provider) = make_redirector();

    let mut writer = CreateParams::new(FILE_PATH);
    writer.desired_access = access(false, true, false);
    writer.share_access = share(false, false, false);
    let writer = redirector.create(writer).unwrap();

    let error = redirector.create(read_open(FILE_PATH)).err().unwrap();
    assert_eq!(error, Error::SharingViolation);
    // One scavenge-and-retry, then the violation surfaces.
    assert_eq!(minirdr.flushed(), 1);
    assert_eq!(minirdr.created(), 1);

    redirector.close(writer).unwrap();
}

#[test_log::test]
fn test_must_create_new_reports_collision_on_violation() {
    let (redirector, minirdr, _provider) = make_redirector();

    let mut writer = CreateParams::new(FILE_PATH);
    writer.desired_access = access(false, true, false);
    writer.share_access = share(false, false, false);
    let _writer = redirector.create(writer).unwrap();

    let mut exclusive_new = CreateParams::new(FILE_PATH);
    exclusive_new.desired_access = access(true, false, false);
    exclusive_new.disposition = CreateDisposition::Create;
    let error = redirector.create(exclusive_new).err().unwrap();
    // The conflicting open proves the file exists; no retry happens.
    assert_eq!(error, Error::NameCollision);
    assert_eq!(minirdr.flushed(), 0);
}

#[test_log::test]
fn test_simultaneous_conflicting_builds_admit_exactly_one() {
    let (redirector, minirdr, _provider) = make_redirector();
    let redirector = Arc::new(redirector);

    // An attribute-only open keeps the FCB stable so both builders race on
    // an existing FCB rather than serializing on its construction.
    let mut attrs_only = CreateParams::new(FILE_PATH);
    attrs_only.desired_access = FileAccessMask::new().with_read_attributes(true);
    let anchor = redirector.create(attrs_only).unwrap();

    // Slow calldowns hold both builds in flight past each other's
    // pre-checks.
    minirdr.create_delay_ms.store(50, Ordering::SeqCst);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let redirector = redirector.clone();
            thread::spawn(move || {
                let mut writer = CreateParams::new(FILE_PATH);
                writer.desired_access = access(false, true, false);
                writer.share_access = share(false, false, false);
                redirector.create(writer)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    minirdr.create_delay_ms.store(0, Ordering::SeqCst);

    let succeeded = results.iter().filter(|result| result.is_ok()).count();
    let violations = results
        .iter()
        .filter(|result| matches!(result, Err(Error::SharingViolation)))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(violations, 1);

    for result in results {
        if let Ok(opened) = result {
            redirector.close(opened).unwrap();
        }
    }
    redirector.close(anchor).unwrap();
}

#[test_log::test]
fn test_completion_recheck_catches_conflicting_delayed_close() {
    let (redirector, minirdr, _provider) = make_redirector();
    let redirector = Arc::new(redirector);

    let mut attrs_only = CreateParams::new(FILE_PATH);
    attrs_only.desired_access = FileAccessMask::new().with_read_attributes(true);
    let anchor = redirector.create(attrs_only).unwrap();

    // Hold the reader's calldown in flight while a conflicting writer
    // opens and closes underneath it. The reader's pre-checks ran against
    // an empty FCB; only the re-check at completion can see the writer's
    // lingering server open.
    minirdr.create_delay_ms.store(250, Ordering::SeqCst);
    let reader_redirector = redirector.clone();
    let reader = thread::spawn(move || {
        let mut reader = CreateParams::new(FILE_PATH);
        reader.desired_access = access(true, false, false);
        reader.share_access = share(true, false, false);
        reader_redirector.create(reader)
    });
    thread::sleep(Duration::from_millis(50));
    minirdr.create_delay_ms.store(0, Ordering::SeqCst);

    let mut writer = CreateParams::new(FILE_PATH);
    writer.desired_access = access(false, true, false);
    writer.share_access = share(false, false, false);
    let writer = redirector.create(writer).unwrap();
    redirector.close(writer).unwrap();
    // The writer's server open lingers as a delayed close; its counters
    // stay charged against new server opens.
    assert_eq!(minirdr.closed(), 0);

    let opened = reader.join().unwrap().unwrap();
    // The reader's first build lost to the writer at completion and was
    // torn down; the retry succeeded once the delayed close was scavenged.
    assert_eq!(minirdr.created(), 4);
    assert_eq!(minirdr.closed(), 2);
    assert_eq!(minirdr.flushed(), 1);

    redirector.close(opened).unwrap();
    redirector.close(anchor).unwrap();
}

#[test_log::test]
fn test_delayed_close_is_scavenged_for_a_conflicting_open() {
    let (redirector, minirdr, _provider) = make_redirector();

    // An attribute-only open keeps the FCB alive without charging share
    // counters.
    let mut attrs_only = CreateParams::new(FILE_PATH);
    attrs_only.desired_access = FileAccessMask::new().with_read_attributes(true);
    let anchor = redirector.create(attrs_only).unwrap();

    let mut writer = CreateParams::new(FILE_PATH);
    writer.desired_access = access(false, true, false);
    writer.share_access = share(false, true, false);
    let writer = redirector.create(writer).unwrap();
    assert_eq!(minirdr.created(), 2);

    // The writer's server open lingers as a delayed close.
    redirector.close(writer).unwrap();
    assert_eq!(minirdr.closed(), 0);

    // A reader that shares only read conflicts with the lingering writer
    // until the scavenger closes it.
    let mut reader = CreateParams::new(FILE_PATH);
    reader.desired_access = access(true, false, false);
    reader.share_access = share(true, false, false);
    let reader = redirector.create(reader).unwrap();
    assert_eq!(minirdr.created(), 3);
    assert_eq!(minirdr.closed(), 1);
    // Resolved inside the attempt; the outer violation retry never fired.
    assert_eq!(minirdr.flushed(), 0);

    redirector.close(reader).unwrap();
    redirector.close(anchor).unwrap();
}

#[test_log::test]
fn test_failed_calldown_tears_the_fcb_down() {
    let (redirector, minirdr, provider) = make_redirector();
    minirdr.script(ScriptedCreate::Fail(Error::Remote(0xC000_0022)));

    let error = redirector.create(read_open(FILE_PATH)).err().unwrap();
    assert_eq!(error, Error::Remote(0xC000_0022));
    assert!(provider.net_root("\\Server\\Share").unwrap().fcb_table().is_empty());

    // The path is openable again afterwards.
    let opened = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(opened.fcb().unwrap().lock().condition, FcbCondition::Good);
}

#[test_log::test]
fn test_reparse_restarts_at_the_target() {
    let (redirector, minirdr, provider) = make_redirector();
    minirdr.script(ScriptedCreate::Reparse("\\Server\\Share2\\Real.txt".into()));

    let opened = redirector.create(read_open("\\Server\\Share\\Link.txt")).unwrap();
    assert_eq!(minirdr.created(), 2);
    assert_eq!(opened.fcb().unwrap().path(), "\\Real.txt");
    assert_eq!(
        opened.fcb().unwrap().net_root().unwrap().name(),
        "\\Server\\Share2"
    );
    // Nothing survives under the link's name.
    assert!(provider.net_root("\\Server\\Share").unwrap().fcb_table().is_empty());
}

#[test_log::test]
fn test_reparse_cycle_is_bounded() {
    let (redirector, minirdr, _provider) = make_redirector();
    for _ in 0..64 {
        minirdr.script(ScriptedCreate::Reparse("\\Server\\Share\\Loop.txt".into()));
    }
    let error = redirector
        .create(read_open("\\Server\\Share\\Loop.txt"))
        .err()
        .unwrap();
    assert_eq!(error, Error::PathInvalid);
}

#[test_log::test]
fn test_pending_resolution_is_resumed() {
    let (redirector, minirdr, provider) = make_redirector();
    provider.pending_once.store(true, Ordering::SeqCst);

    let opened = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(minirdr.created(), 1);
    assert_eq!(opened.fcb().unwrap().lock().condition, FcbCondition::Good);
}

#[test_log::test]
fn test_abandoned_resolution_surfaces_cancellation() {
    let (redirector, minirdr, provider) = make_redirector();
    provider.abandon_once.store(true, Ordering::SeqCst);

    let error = redirector.create(read_open(FILE_PATH)).err().unwrap();
    assert_eq!(error, Error::Cancelled);
    assert_eq!(minirdr.created(), 0);

    // The path stays openable once the connection engine answers normally.
    let opened = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(opened.fcb().unwrap().lock().condition, FcbCondition::Good);
}

#[test_log::test]
fn test_credential_conflict_scavenges_and_retries_once() {
    let (redirector, _minirdr, provider) = make_redirector();
    provider.fail_next(Error::CredentialConflict);

    let opened = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(provider.scavenge_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 2);
    redirector.close(opened).unwrap();

    // A second conflict in a row is terminal.
    provider.fail_next(Error::CredentialConflict);
    provider.fail_next(Error::CredentialConflict);
    let error = redirector.create(read_open(FILE_PATH)).err().unwrap();
    assert_eq!(error, Error::CredentialConflict);
}

#[test_log::test]
fn test_malformed_names_rejected_before_resolution() {
    let (redirector, _minirdr, provider) = make_redirector();

    for (raw, expected) in [
        ("relative\\path", Error::InvalidName),
        ("\\server", Error::PathInvalid),
        ("\\server\\", Error::InvalidName),
    ] {
        let error = redirector.create(CreateParams::new(raw)).err().unwrap();
        assert_eq!(error, expected, "{raw}");
    }
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 0);
}

#[test_log::test]
fn test_component_syntax_and_wildcards_rejected_after_resolution() {
    let (redirector, minirdr, _provider) = make_redirector();

    let error = redirector
        .create(CreateParams::new("\\Server\\Share\\a..\\b"))
        .err()
        .unwrap();
    assert_eq!(error, Error::PathSyntaxBad);

    let error = redirector
        .create(CreateParams::new("\\Server\\Share\\fi*le"))
        .err()
        .unwrap();
    assert_eq!(error, Error::InvalidName);

    assert_eq!(minirdr.created(), 0);
}

#[test_log::test]
fn test_tree_connect_yields_connection_object() {
    let (redirector, minirdr, _provider) = make_redirector();

    let mut params = CreateParams::new("\\Server\\Share\\Subdir");
    params.tree_connect = true;
    params.ea_buffer = Some(b"credential".to_vec());
    let connection = redirector.create(params).unwrap();
    assert!(connection.fcb().is_none());
    assert!(connection.srv_open().is_none());
    assert_eq!(connection.v_net_root().unwrap().prefix(), "\\Server\\Share");
    assert_eq!(minirdr.created(), 0);
    // The credential blob reaches the directory validation.
    assert_eq!(
        minirdr.last_tree_connect_ea.lock().unwrap().as_deref(),
        Some(&b"credential"[..])
    );
    redirector.close(connection).unwrap();

    minirdr.reject_directories.store(true, Ordering::SeqCst);
    let mut params = CreateParams::new("\\Server\\Share\\Missing");
    params.tree_connect = true;
    assert_eq!(redirector.create(params).err().unwrap(), Error::PathInvalid);
}

#[test_log::test]
fn test_share_root_open_is_connection_level() {
    let (redirector, minirdr, _provider) = make_redirector();

    let device = redirector.create(CreateParams::new("\\Server\\Share")).unwrap();
    assert!(device.fcb().is_none());
    assert!(device.v_net_root().is_some());
    assert_eq!(minirdr.created(), 0);
}

#[test_log::test]
fn test_empty_name_opens_the_device_itself() {
    let (redirector, minirdr, provider) = make_redirector();

    // No name, no connection: the open references only the redirector
    // device and never reaches canonicalization or resolution.
    let device = redirector.create(CreateParams::new("")).unwrap();
    assert!(device.fcb().is_none());
    assert!(device.srv_open().is_none());
    assert!(device.v_net_root().is_none());
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 0);
    assert_eq!(minirdr.created(), 0);

    redirector.close(device).unwrap();
}

#[test_log::test]
fn test_mailslot_open_completes_locally() {
    let (redirector, minirdr, provider) = make_redirector();

    let opened = redirector.create(read_open("\\*\\MAILSLOT\\box")).unwrap();
    // The wildcard server resolves to the primary domain.
    let net_root = provider.net_root("\\WORKGROUP\\MAILSLOT").unwrap();
    assert_eq!(opened.fcb().unwrap().kind(), FcbKind::Mailslot);
    assert!(opened.srv_open().is_none());
    assert_eq!(minirdr.created(), 0);
    assert_eq!(net_root.fcb_table().len(), 1);

    redirector.close(opened).unwrap();
    assert!(net_root.fcb_table().is_empty());
}

#[test_log::test]
fn test_mailslot_reparse_recanonicalizes_once() {
    let (redirector, _minirdr, provider) = make_redirector();
    provider.mailslot_reparse_once.store(true, Ordering::SeqCst);

    let opened = redirector.create(read_open("\\*\\MAILSLOT\\box")).unwrap();
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 2);
    assert_eq!(opened.fcb().unwrap().kind(), FcbKind::Mailslot);
}

#[test_log::test]
fn test_related_open_recanonicalizes_through_parent() {
    let (redirector, _minirdr, provider) = make_redirector();

    let parent = redirector.create(read_open("\\Server\\Share\\Dir")).unwrap();
    let mut child = read_open("File.txt");
    child.related = Some(RelatedBase {
        fcb: parent.fcb().unwrap().clone(),
        v_net_root: parent.v_net_root().unwrap().clone(),
    });
    // A relative raw path cannot be canonicalized standalone; the retry
    // after a mailslot reparse answer must go through the parent again.
    provider.mailslot_reparse_once.store(true, Ordering::SeqCst);

    let opened = redirector.create(child).unwrap();
    assert_eq!(opened.fcb().unwrap().path(), "\\Dir\\File.txt");
    assert_eq!(provider.resolve_calls.load(Ordering::SeqCst), 3);

    redirector.close(opened).unwrap();
    redirector.close(parent).unwrap();
}

#[test_log::test]
fn test_open_target_directory_uses_standalone_stub() {
    let (redirector, minirdr, provider) = make_redirector();

    let mut params = CreateParams::new("\\Server\\Share\\Dir\\Renamed.txt");
    params.open_target_directory = true;
    params.desired_access = access(false, false, true);
    let stub = redirector.create(params).unwrap();
    assert_eq!(stub.fcb().unwrap().kind(), FcbKind::TargetDirectory);
    assert_eq!(minirdr.created(), 0);
    // The stub never enters the table.
    assert!(provider.net_root("\\Server\\Share").unwrap().fcb_table().is_empty());

    redirector.close(stub).unwrap();
}

#[test_log::test]
fn test_delete_on_close_never_collapses() {
    let (redirector, minirdr, _provider) = make_redirector();

    let plain = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(minirdr.created(), 1);

    let mut doomed = read_open(FILE_PATH);
    doomed.create_options = doomed.create_options.with_delete_on_close(true);
    let doomed = redirector.create(doomed).unwrap();
    assert_eq!(minirdr.created(), 2);

    // Collapsing stays disabled on this FCB afterwards.
    let third = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(minirdr.created(), 3);

    for open in [plain, doomed, third] {
        redirector.close(open).unwrap();
    }
}

#[test_log::test]
fn test_read_only_file_does_not_collapse_by_default() {
    let (redirector, minirdr, _provider) = make_redirector();
    minirdr.script(ScriptedCreate::Open(rdbss::OpenReply {
        remote_handle: 7,
        file_size: 64,
        allocation_size: 64,
        read_only: true,
    }));

    let first = redirector.create(read_open(FILE_PATH)).unwrap();
    let second = redirector.create(read_open(FILE_PATH)).unwrap();
    assert_eq!(minirdr.created(), 2);
    assert!(Arc::ptr_eq(first.fcb().unwrap(), second.fcb().unwrap()));
    assert!(!Arc::ptr_eq(
        first.srv_open().unwrap(),
        second.srv_open().unwrap()
    ));
}
