//! File access mask definition.
//!
//! [MS-SMB2 2.2.13.1](<https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-smb2/77b36d0f-6016-458a-a7a0-0f4a72ae1534>)

use modular_bitfield::prelude::*;

/// The level of access that is requested for a file or a directory.
///
/// [MS-SMB2 2.2.13.1.1](<https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-smb2/77b36d0f-6016-458a-a7a0-0f4a72ae1534>)
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAccessMask {
    /// The right to read data from the file or list the directory contents.
    pub read_data: bool,
    /// The right to write data into the file or create a child file.
    pub write_data: bool,
    /// The right to append data into the file or create a child directory.
    pub append_data: bool,
    /// The right to read the extended attributes of the file or directory.
    pub read_ea: bool,

    /// The right to write or change the extended attributes of the file or directory.
    pub write_ea: bool,
    /// The right to execute the file, or to traverse the directory.
    pub execute: bool,
    /// The right to delete entries within a directory.
    pub delete_child: bool,
    /// The right to read the attributes of the file or directory.
    pub read_attributes: bool,

    /// The right to change the attributes of the file or directory.
    pub write_attributes: bool,
    #[skip]
    __: B7,

    /// The right to delete the file or directory.
    pub delete: bool,
    /// The right to read the security descriptor for the file or directory.
    pub read_control: bool,
    /// The right to change the discretionary access control list.
    pub write_dac: bool,
    /// The right to change the owner in the security descriptor.
    pub write_owner: bool,

    /// The right to use the handle for synchronization. SMB2 ignores this bit.
    pub synchronize: bool,
    #[skip]
    __: B3,

    /// The right to read or change the system access control list.
    pub access_system_security: bool,
    /// Indicates that the client is requesting an open with the highest allowed access.
    pub maximum_allowed: bool,
    #[skip]
    __: B2,

    /// Generic all, execute, write and read, respectively.
    pub generic_all: bool,
    pub generic_execute: bool,
    pub generic_write: bool,
    pub generic_read: bool,
}

impl FileAccessMask {
    /// Whether the open actually reads data: `FILE_READ_DATA | FILE_EXECUTE`.
    pub fn wants_read(&self) -> bool {
        self.read_data() || self.execute()
    }

    /// Whether the open actually writes data: `FILE_WRITE_DATA | FILE_APPEND_DATA`.
    pub fn wants_write(&self) -> bool {
        self.write_data() || self.append_data()
    }

    /// Whether the open may delete the target: `DELETE`.
    pub fn wants_delete(&self) -> bool {
        self.delete()
    }

    /// Whether any access relevant to share-mode arbitration is requested.
    /// Attribute-only opens are always share-compatible.
    pub fn wants_share_relevant_access(&self) -> bool {
        self.wants_read() || self.wants_write() || self.wants_delete()
    }
}
