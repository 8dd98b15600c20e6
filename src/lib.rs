//! User-space file system virtualization.
//!
//! A coordinating process links real directories into virtual locations
//! ([`VirtualFileSystem`]), publishes the resulting tree over a named shared
//! memory channel and starts target processes with hooks installed. Inside
//! a hooked process every file system call is routed through the same tree,
//! so the process sees one merged directory hierarchy.

pub mod channel;
pub mod context;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod ffi;
pub mod guard;
pub mod host;
pub mod inject;
pub mod listing;
pub mod logging;
pub mod parameters;
pub mod path;
pub mod records;
pub mod router;
pub mod snapshot;
pub mod status;
pub mod tree;
pub mod wide;
pub mod wildcard;

#[cfg(windows)]
pub mod crash;
#[cfg(windows)]
pub mod hooks;

pub use controller::VirtualFileSystem;
pub use error::{Result, VfsError};
pub use parameters::{CrashDumpsType, LogLevel, Parameters};
pub use path::VirtualPathKey;
pub use router::{Operation, Resolution, Router};
pub use tree::{LinkFlags, Precedence, RedirectionTree};
