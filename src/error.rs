use std::{path::PathBuf, time::Duration};

use crate::status::{self, NtStatus};

/// Why a raw path was rejected by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPathReason {
    Empty,
    NotAbsolute,
    ComponentTooLong,
    PathTooLong,
    ReservedName,
    IllegalCharacter,
    EscapesRoot,
    UnsupportedNamespace,
}

impl std::fmt::Display for InvalidPathReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            InvalidPathReason::Empty => "path is empty",
            InvalidPathReason::NotAbsolute => "path is not absolute",
            InvalidPathReason::ComponentTooLong => "a path component is too long",
            InvalidPathReason::PathTooLong => "path is too long",
            InvalidPathReason::ReservedName => "path names a reserved device",
            InvalidPathReason::IllegalCharacter => "path contains an illegal character",
            InvalidPathReason::EscapesRoot => "'..' walks above the root",
            InvalidPathReason::UnsupportedNamespace => "path is outside the file namespace",
        };
        f.write_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        path: String,
        reason: InvalidPathReason,
    },

    #[error("{0:?} not found")]
    NotFound(String),

    #[error("parent directory of {0:?} not found")]
    PathNotFound(String),

    #[error("{0:?} already exists")]
    AlreadyExists(String),

    #[error("directory {0:?} is not empty")]
    DirectoryNotEmpty(String),

    #[error("{0:?} is a directory")]
    IsADirectory(String),

    #[error("{0:?} is not a directory")]
    NotADirectory(String),

    #[error("no configuration published for instance {0:?}")]
    ChannelNotFound(String),

    #[error("configuration for instance {instance:?} is unreadable: {reason}")]
    ChannelCorrupt { instance: String, reason: String },

    #[error("injection failed while {stage} (host error {code:#x})")]
    Injection { stage: &'static str, code: u32 },

    #[error("injected module did not report back within {0:?}")]
    InjectionTimeout(Duration),

    #[error("failed to hook {function}: {reason}")]
    HookInstall {
        function: &'static str,
        reason: String,
    },

    #[error("cannot move {from:?} to {to:?}: different volumes")]
    CrossVolumeOperation { from: PathBuf, to: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    pub fn invalid_path(path: impl Into<String>, reason: InvalidPathReason) -> VfsError {
        VfsError::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// The status a kernel-level entry point reports for this failure.
    pub fn nt_status(&self) -> NtStatus {
        match self {
            VfsError::InvalidPath { reason, .. } => match reason {
                InvalidPathReason::ComponentTooLong | InvalidPathReason::PathTooLong => {
                    status::STATUS_NAME_TOO_LONG
                }
                InvalidPathReason::EscapesRoot => status::STATUS_OBJECT_PATH_SYNTAX_BAD,
                _ => status::STATUS_OBJECT_NAME_INVALID,
            },
            VfsError::NotFound(_) => status::STATUS_OBJECT_NAME_NOT_FOUND,
            VfsError::PathNotFound(_) => status::STATUS_OBJECT_PATH_NOT_FOUND,
            VfsError::AlreadyExists(_) => status::STATUS_OBJECT_NAME_COLLISION,
            VfsError::DirectoryNotEmpty(_) => status::STATUS_DIRECTORY_NOT_EMPTY,
            VfsError::IsADirectory(_) => status::STATUS_FILE_IS_A_DIRECTORY,
            VfsError::NotADirectory(_) => status::STATUS_NOT_A_DIRECTORY,
            VfsError::CrossVolumeOperation { .. } => status::STATUS_NOT_SAME_DEVICE,
            VfsError::Io(err) => err
                .raw_os_error()
                .map(|code| status::nt_status_from_win32(code as u32))
                .unwrap_or(status::STATUS_UNSUCCESSFUL),
            _ => status::STATUS_INTERNAL_ERROR,
        }
    }

    /// The last-error code a Win32 wrapper reports for this failure.
    pub fn win32_error(&self) -> u32 {
        match self {
            VfsError::InvalidPath { reason, .. } => match reason {
                InvalidPathReason::ComponentTooLong | InvalidPathReason::PathTooLong => {
                    status::ERROR_FILENAME_EXCED_RANGE
                }
                _ => status::ERROR_INVALID_NAME,
            },
            VfsError::NotFound(_) => status::ERROR_FILE_NOT_FOUND,
            VfsError::PathNotFound(_) => status::ERROR_PATH_NOT_FOUND,
            VfsError::AlreadyExists(_) => status::ERROR_ALREADY_EXISTS,
            VfsError::DirectoryNotEmpty(_) => status::ERROR_DIR_NOT_EMPTY,
            // DeleteFileW on a directory.
            VfsError::IsADirectory(_) => status::ERROR_ACCESS_DENIED,
            VfsError::NotADirectory(_) => status::ERROR_DIRECTORY,
            VfsError::CrossVolumeOperation { .. } => status::ERROR_NOT_SAME_DEVICE,
            VfsError::Io(err) => err
                .raw_os_error()
                .map(|code| code as u32)
                .unwrap_or(status::ERROR_GEN_FAILURE),
            _ => status::ERROR_INTERNAL_ERROR,
        }
    }
}
