//! Create dispositions, create options and share-access flags.
//!
//! Reference: MS-SMB2 2.2.13

use modular_bitfield::prelude::*;

/// Defines the action to take if the file already exists.
///
/// Reference: MS-SMB2 2.2.13
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CreateDisposition {
    /// If the file already exists, supersede it. Otherwise, create the file
    Supersede = 0x0,
    /// If the file already exists, open it; otherwise, fail the operation
    #[default]
    Open = 0x1,
    /// If the file already exists, fail the operation; otherwise, create the file
    Create = 0x2,
    /// Open the file if it already exists; otherwise, create the file
    OpenIf = 0x3,
    /// Overwrite the file if it already exists; otherwise, fail the operation
    Overwrite = 0x4,
    /// Overwrite the file if it already exists; otherwise, create the file
    OverwriteIf = 0x5,
}

impl CreateDisposition {
    /// Dispositions that open an existing file without destroying its contents.
    /// Only these are candidates for collapsing onto an existing server open.
    pub fn is_open_existing(&self) -> bool {
        matches!(self, CreateDisposition::Open | CreateDisposition::OpenIf)
    }

    /// Dispositions that truncate an existing file on success.
    pub fn is_overwrite(&self) -> bool {
        matches!(
            self,
            CreateDisposition::Overwrite | CreateDisposition::OverwriteIf
        )
    }

    /// Whether the disposition semantically cannot tolerate an existing file.
    pub fn must_create_new(&self) -> bool {
        matches!(self, CreateDisposition::Create)
    }
}

/// Options to be applied when creating or opening the file.
///
/// Reference: MS-SMB2 2.2.13
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOptions {
    /// The file being created or opened is a directory file
    pub directory_file: bool,
    /// Writes go through to the server before the operation completes
    pub write_through: bool,
    /// The application intends to read or write at sequential offsets
    pub sequential_only: bool,
    /// File buffering is not performed on this open
    pub no_intermediate_buffering: bool,

    /// Ignored by the redirector
    pub synchronous_io_alert: bool,
    /// Ignored by the redirector
    pub synchronous_io_nonalert: bool,
    /// If the name matches an existing directory, the open must fail
    pub non_directory_file: bool,
    #[skip]
    __: bool,

    /// Ignored by the redirector
    pub complete_if_oplocked: bool,
    /// The caller does not understand how to handle extended attributes
    pub no_ea_knowledge: bool,
    /// Ignored by the redirector
    pub open_remote_instance: bool,
    /// The application intends to read or write at random offsets
    pub random_access: bool,

    /// The file must be automatically deleted when the last open is closed
    pub delete_on_close: bool,
    /// Open the file by its file identifier rather than by name
    pub open_by_file_id: bool,
    /// The file is being opened for backup intent
    pub open_for_backup_intent: bool,
    /// The file cannot be compressed
    pub no_compression: bool,

    /// Ignored by the redirector
    pub open_requiring_oplock: bool,
    /// Ignored by the redirector
    pub disallow_exclusive: bool,
    #[skip]
    __: B2,

    /// Ignored by the redirector
    pub reserve_opfilter: bool,
    /// If the target is a reparse point, open the reparse point itself
    pub open_reparse_point: bool,
    /// In an HSM environment, the file should not be recalled from tertiary storage
    pub open_no_recall: bool,
    /// Open the file to query for free space
    pub open_for_free_space_query: bool,

    #[skip]
    __: B8,
}

/// Specifies the sharing mode for the open.
///
/// Reference: MS-SMB2 2.2.13
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareAccessFlags {
    /// Other opens are allowed to read this file while this open is present
    pub read: bool,
    /// Other opens are allowed to write this file while this open is present
    pub write: bool,
    /// Other opens are allowed to delete or rename this file while this open is present
    pub delete: bool,
    #[skip]
    __: B29,
}

impl ShareAccessFlags {
    /// Full sharing: read, write and delete all permitted.
    /// Pipe and print shares force this regardless of what the caller asked for.
    pub fn all() -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_delete(true)
    }
}
