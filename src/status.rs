//! Native status vocabulary.
//!
//! Values are copied from `ntstatus.h` and `winerror.h` so that the
//! platform-independent layers can produce the exact codes the hooked entry
//! points hand back to applications.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NtStatus(pub i32);

impl NtStatus {
    pub const fn from_u32(value: u32) -> NtStatus {
        NtStatus(value as i32)
    }

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Warnings (0x8xxxxxxx) still carry valid output, e.g. a truncated record.
    pub fn is_warning(self) -> bool {
        (self.0 as u32) >> 30 == 2
    }

    pub fn is_error(self) -> bool {
        (self.0 as u32) >> 30 == 3
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

pub const STATUS_SUCCESS: NtStatus = NtStatus::from_u32(0x0000_0000);
pub const STATUS_BUFFER_OVERFLOW: NtStatus = NtStatus::from_u32(0x8000_0005);
pub const STATUS_NO_MORE_FILES: NtStatus = NtStatus::from_u32(0x8000_0006);
pub const STATUS_UNSUCCESSFUL: NtStatus = NtStatus::from_u32(0xC000_0001);
pub const STATUS_INVALID_INFO_CLASS: NtStatus = NtStatus::from_u32(0xC000_0003);
pub const STATUS_INFO_LENGTH_MISMATCH: NtStatus = NtStatus::from_u32(0xC000_0004);
pub const STATUS_INVALID_HANDLE: NtStatus = NtStatus::from_u32(0xC000_0008);
pub const STATUS_INVALID_PARAMETER: NtStatus = NtStatus::from_u32(0xC000_000D);
pub const STATUS_NO_SUCH_FILE: NtStatus = NtStatus::from_u32(0xC000_000F);
pub const STATUS_ACCESS_DENIED: NtStatus = NtStatus::from_u32(0xC000_0022);
pub const STATUS_BUFFER_TOO_SMALL: NtStatus = NtStatus::from_u32(0xC000_0023);
pub const STATUS_OBJECT_NAME_INVALID: NtStatus = NtStatus::from_u32(0xC000_0033);
pub const STATUS_OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus::from_u32(0xC000_0034);
pub const STATUS_OBJECT_NAME_COLLISION: NtStatus = NtStatus::from_u32(0xC000_0035);
pub const STATUS_OBJECT_PATH_NOT_FOUND: NtStatus = NtStatus::from_u32(0xC000_003A);
pub const STATUS_OBJECT_PATH_SYNTAX_BAD: NtStatus = NtStatus::from_u32(0xC000_003B);
pub const STATUS_SHARING_VIOLATION: NtStatus = NtStatus::from_u32(0xC000_0043);
pub const STATUS_NOT_SAME_DEVICE: NtStatus = NtStatus::from_u32(0xC000_00D4);
pub const STATUS_FILE_IS_A_DIRECTORY: NtStatus = NtStatus::from_u32(0xC000_00BA);
pub const STATUS_INTERNAL_ERROR: NtStatus = NtStatus::from_u32(0xC000_00E5);
pub const STATUS_DIRECTORY_NOT_EMPTY: NtStatus = NtStatus::from_u32(0xC000_0101);
pub const STATUS_NOT_A_DIRECTORY: NtStatus = NtStatus::from_u32(0xC000_0103);
pub const STATUS_NAME_TOO_LONG: NtStatus = NtStatus::from_u32(0xC000_0106);

pub const ERROR_FILE_NOT_FOUND: u32 = 2;
pub const ERROR_PATH_NOT_FOUND: u32 = 3;
pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_NOT_SAME_DEVICE: u32 = 17;
pub const ERROR_NO_MORE_FILES: u32 = 18;
pub const ERROR_GEN_FAILURE: u32 = 31;
pub const ERROR_SHARING_VIOLATION: u32 = 32;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_FILE_EXISTS: u32 = 80;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_INVALID_NAME: u32 = 123;
pub const ERROR_DIR_NOT_EMPTY: u32 = 145;
pub const ERROR_ALREADY_EXISTS: u32 = 183;
pub const ERROR_FILENAME_EXCED_RANGE: u32 = 206;
pub const ERROR_DIRECTORY: u32 = 267;
pub const ERROR_INTERNAL_ERROR: u32 = 1359;

/// Inverse of the common `RtlNtStatusToDosError` mappings, for host errors
/// that surface through `std::io::Error` while a kernel-level hook is active.
pub fn nt_status_from_win32(code: u32) -> NtStatus {
    match code {
        0 => STATUS_SUCCESS,
        ERROR_FILE_NOT_FOUND => STATUS_OBJECT_NAME_NOT_FOUND,
        ERROR_PATH_NOT_FOUND => STATUS_OBJECT_PATH_NOT_FOUND,
        ERROR_ACCESS_DENIED => STATUS_ACCESS_DENIED,
        ERROR_INVALID_HANDLE => STATUS_INVALID_HANDLE,
        ERROR_NOT_SAME_DEVICE => STATUS_NOT_SAME_DEVICE,
        ERROR_SHARING_VIOLATION => STATUS_SHARING_VIOLATION,
        ERROR_FILE_EXISTS | ERROR_ALREADY_EXISTS => STATUS_OBJECT_NAME_COLLISION,
        ERROR_INVALID_NAME => STATUS_OBJECT_NAME_INVALID,
        ERROR_DIR_NOT_EMPTY => STATUS_DIRECTORY_NOT_EMPTY,
        ERROR_FILENAME_EXCED_RANGE => STATUS_NAME_TOO_LONG,
        ERROR_DIRECTORY => STATUS_NOT_A_DIRECTORY,
        _ => STATUS_UNSUCCESSFUL,
    }
}
