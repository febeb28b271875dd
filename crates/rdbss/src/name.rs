//! Name canonicalization for redirected opens.
//!
//! A raw path arrives either in UNC form (`\server\share\dir\file`) or in
//! deviceful form with a drive-letter prefix (`\;m:0\server\share\dir\file`).
//! Canonicalization splits it into the net-root portion (everything up to and
//! including the share) and the remaining name, remaps the special `PIPE` and
//! `MAILSLOT` shares, and validates the remaining name component by component.

use crate::Error;
use crate::netroot::NetRootType;

/// The path separator used by canonical names.
pub const PATH_SEPARATOR: char = '\\';

/// Canonical names are bounded by the 16-bit length fields of the protocols
/// the mini-redirectors speak.
const MAX_CANONICAL_LEN: usize = u16::MAX as usize;

/// Characters that are never valid in a leaf name handed to create.
const WILDCARDS: [char; 5] = ['*', '?', '<', '>', '"'];

/// The result of the first canonicalization pass.
///
/// `name` owns the canonical buffer for this attempt; the per-operation
/// context holds it in a single slot and drops it before a retry
/// re-canonicalizes, so repeated attempts never alias a stale buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonicalized {
    /// The full canonical name, deviceful prefix included.
    pub name: String,
    /// Length of the net-root portion of `name` (`[\;d:s]\server\share`).
    pub net_root_length: usize,
    /// Root type deduced from the share component.
    pub root_type: NetRootType,
    /// Set when the input was presented in UNC form. Persisted on the
    /// resulting open so query-name operations can reconstruct what the
    /// caller typed.
    pub is_unc_name: bool,
    /// Set when a trailing separator was removed from the remaining name.
    pub stripped_trailing_separator: bool,
}

impl Canonicalized {
    /// The remaining name: everything past the net-root portion.
    pub fn remaining(&self) -> &str {
        &self.name[self.net_root_length..]
    }
}

/// Outcome of a validation pass that leaves the name ready for the next
/// pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// The name is acceptable as-is; the create state machine continues.
    MoreProcessingRequired,
}

/// Canonicalizes an absolute (UNC or deviceful) path.
///
/// `primary_domain` substitutes the `*` server wildcard in domain-wide
/// mailslot names.
pub fn canonicalize(raw: &str, primary_domain: &str) -> crate::Result<Canonicalized> {
    let Some(mut body) = raw.strip_prefix(PATH_SEPARATOR) else {
        return Err(Error::InvalidName);
    };

    let mut is_unc_name = true;
    let mut device_prefix = "";
    if body.starts_with(';') {
        // Deviceful form: `\;<drive>:<session>\server\...`.
        is_unc_name = false;
        let end = body.find(PATH_SEPARATOR).ok_or(Error::InvalidName)?;
        device_prefix = &body[..end];
        if !device_prefix.contains(':') {
            return Err(Error::InvalidName);
        }
        body = &body[end + 1..];
    }

    // A file open needs at least `\server\share`.
    let server_end = body.find(PATH_SEPARATOR).ok_or(Error::PathInvalid)?;
    let mut server = &body[..server_end];
    if server.is_empty() {
        return Err(Error::InvalidName);
    }
    let after_server = &body[server_end + 1..];
    let share_end = after_server
        .find(PATH_SEPARATOR)
        .unwrap_or(after_server.len());
    let share = &after_server[..share_end];
    if share.is_empty() {
        return Err(Error::InvalidName);
    }
    let remaining = &after_server[share_end..];

    // Special share names: pipes live on IPC$, and a `*` mailslot server
    // addresses every server in the primary domain.
    let mut root_type = NetRootType::Wild;
    let mut share = share;
    if share.eq_ignore_ascii_case("PIPE") {
        share = "IPC$";
        root_type = NetRootType::Pipe;
    } else if share.eq_ignore_ascii_case("IPC$") {
        root_type = NetRootType::Pipe;
    } else if share.eq_ignore_ascii_case("MAILSLOT") {
        root_type = NetRootType::Mailslot;
        if server == "*" {
            server = primary_domain;
        }
    }

    // The allocated and written lengths both come from this one computation.
    let mut name = String::with_capacity(
        device_prefix.len() + server.len() + share.len() + remaining.len() + 3,
    );
    if !device_prefix.is_empty() {
        name.push(PATH_SEPARATOR);
        name.push_str(device_prefix);
    }
    name.push(PATH_SEPARATOR);
    name.push_str(server);
    name.push(PATH_SEPARATOR);
    name.push_str(share);
    let net_root_length = name.len();
    name.push_str(remaining);

    if name.len() > MAX_CANONICAL_LEN {
        return Err(Error::NameTooLong);
    }

    let stripped_trailing_separator = strip_trailing_separator(&mut name, net_root_length);

    Ok(Canonicalized {
        name,
        net_root_length,
        root_type,
        is_unc_name,
        stripped_trailing_separator,
    })
}

/// Synthesizes a canonical name for an open relative to an existing one:
/// `v-net-root prefix + parent path + [separator] + suffix`.
///
/// The separator is omitted when the suffix is a stream name (starts with
/// `:`) or the parent path already ends with a separator.
pub fn canonicalize_related(
    prefix: &str,
    parent_path: &str,
    suffix: &str,
    root_type: NetRootType,
) -> crate::Result<Canonicalized> {
    let mut name = String::with_capacity(prefix.len() + parent_path.len() + suffix.len() + 1);
    name.push_str(prefix);
    name.push_str(parent_path);
    if !suffix.is_empty() && !suffix.starts_with(':') && !name.ends_with(PATH_SEPARATOR) {
        name.push(PATH_SEPARATOR);
    }
    name.push_str(suffix);

    if name.len() > MAX_CANONICAL_LEN {
        return Err(Error::NameTooLong);
    }

    let stripped_trailing_separator = strip_trailing_separator(&mut name, prefix.len());

    Ok(Canonicalized {
        name,
        net_root_length: prefix.len(),
        root_type,
        is_unc_name: false,
        stripped_trailing_separator,
    })
}

/// Validates the remaining name component by component, the way a server
/// would: no empty components except a trailing separator, and no `.`/`..`
/// navigation. A dot adjacent to a stream-name colon is legal.
///
/// A canonical remaining name passes unchanged, so re-running this pass is
/// idempotent.
pub fn canonicalize_by_server_specs(remaining: &str) -> crate::Result<Control> {
    if remaining.is_empty() {
        return Ok(Control::MoreProcessingRequired);
    }
    let components: Vec<&str> = remaining.split(PATH_SEPARATOR).collect();
    let last = components.len() - 1;
    for (index, component) in components.iter().enumerate() {
        if component.is_empty() {
            // The empty slice before a leading separator is positional; a
            // bare separator anywhere but the very end is malformed.
            if index != 0 && index != last {
                return Err(Error::PathSyntaxBad);
            }
            continue;
        }
        if component.contains(':') {
            // Stream-name components get a pass on the dot rules.
            continue;
        }
        if *component == "." || *component == ".." || component.ends_with('.') {
            return Err(Error::PathSyntaxBad);
        }
    }
    Ok(Control::MoreProcessingRequired)
}

/// Wildcards are not valid leaf names for create.
pub fn contains_wildcards(name: &str) -> bool {
    name.contains(WILDCARDS)
}

fn strip_trailing_separator(name: &mut String, net_root_length: usize) -> bool {
    if name.len() > net_root_length && name.ends_with(PATH_SEPARATOR) {
        name.pop();
        true
    } else {
        false
    }
}
