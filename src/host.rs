//! Read-only probes of the physical file system.
//!
//! The router decides where an operation goes by asking a [`HostFs`] which
//! candidates exist. Inside a hooked process every probe runs with hook
//! suppression active, so the probe itself is never redirected.

use std::{
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::guard::HookGuard;

pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;
const CLUSTER_SIZE: u64 = 4096;

/// Metadata in the shape the native directory records carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryInfo {
    pub attributes: u32,
    pub size: u64,
    pub allocation_size: u64,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    pub change_time: u64,
    pub file_id: u64,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    /// Metadata for a directory that only exists in the redirection tree.
    pub fn synthetic_dir() -> EntryInfo {
        EntryInfo {
            attributes: FILE_ATTRIBUTE_DIRECTORY,
            ..Default::default()
        }
    }
}

pub fn system_time_to_filetime(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => FILETIME_UNIX_EPOCH + (since.as_nanos() / 100) as u64,
        Err(_) => 0,
    }
}

pub trait HostFs: Send + Sync {
    fn metadata(&self, path: &Path) -> io::Result<EntryInfo>;

    /// Lists the names and metadata of a directory, without `.` and `..`.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<(String, EntryInfo)>>;

    /// Whether both paths live on the same physical volume. Either path may
    /// not exist yet, in which case its nearest existing ancestor counts.
    fn same_volume(&self, a: &Path, b: &Path) -> io::Result<bool>;

    fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }
}

/// [`HostFs`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHost;

impl StdHost {
    fn info(metadata: &std::fs::Metadata) -> EntryInfo {
        #[cfg(windows)]
        {
            use std::os::windows::fs::MetadataExt;
            let size = metadata.file_size();
            EntryInfo {
                attributes: metadata.file_attributes(),
                size,
                allocation_size: round_to_cluster(size),
                creation_time: metadata.creation_time(),
                last_access_time: metadata.last_access_time(),
                last_write_time: metadata.last_write_time(),
                change_time: metadata.last_write_time(),
                file_id: 0,
            }
        }
        #[cfg(not(windows))]
        {
            use std::os::unix::fs::MetadataExt;
            let size = if metadata.is_dir() { 0 } else { metadata.len() };
            let mut attributes = if metadata.is_dir() {
                FILE_ATTRIBUTE_DIRECTORY
            } else {
                FILE_ATTRIBUTE_ARCHIVE
            };
            if metadata.permissions().readonly() {
                attributes |= FILE_ATTRIBUTE_READONLY;
            }
            let modified = metadata
                .modified()
                .map(system_time_to_filetime)
                .unwrap_or(0);
            EntryInfo {
                attributes,
                size,
                allocation_size: round_to_cluster(size),
                creation_time: metadata
                    .created()
                    .map(system_time_to_filetime)
                    .unwrap_or(modified),
                last_access_time: metadata
                    .accessed()
                    .map(system_time_to_filetime)
                    .unwrap_or(modified),
                last_write_time: modified,
                change_time: modified,
                file_id: metadata.ino(),
            }
        }
    }

    fn nearest_existing(path: &Path) -> io::Result<PathBuf> {
        path.ancestors()
            .find(|p| p.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))
    }

    #[cfg(windows)]
    fn volume_of(path: &Path) -> io::Result<String> {
        use std::os::windows::prelude::OsStrExt;
        use windows::{core::PCWSTR, Win32::Storage::FileSystem::GetVolumePathNameW};

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let mut buffer = [0u16; 1024];
        unsafe { GetVolumePathNameW(PCWSTR::from_raw(wide.as_ptr()), &mut buffer) }
            .map_err(|e| io::Error::from_raw_os_error(e.code().0 & 0xFFFF))?;
        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
        Ok(crate::path::fold_case(&String::from_utf16_lossy(&buffer[..len])))
    }
}

fn round_to_cluster(size: u64) -> u64 {
    (size + CLUSTER_SIZE - 1) / CLUSTER_SIZE * CLUSTER_SIZE
}

impl HostFs for StdHost {
    fn metadata(&self, path: &Path) -> io::Result<EntryInfo> {
        let _guard = HookGuard::enter();
        std::fs::metadata(path).map(|m| Self::info(&m))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<(String, EntryInfo)>> {
        let _guard = HookGuard::enter();
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            // Follow links the way an unhooked listing reports them.
            let metadata = match std::fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(_) => entry.metadata()?,
            };
            entries.push((
                entry.file_name().to_string_lossy().into_owned(),
                Self::info(&metadata),
            ));
        }
        Ok(entries)
    }

    fn same_volume(&self, a: &Path, b: &Path) -> io::Result<bool> {
        let _guard = HookGuard::enter();
        let a = Self::nearest_existing(a)?;
        let b = Self::nearest_existing(b)?;
        #[cfg(windows)]
        {
            Ok(Self::volume_of(&a)? == Self::volume_of(&b)?)
        }
        #[cfg(not(windows))]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(std::fs::metadata(a)?.dev() == std::fs::metadata(b)?.dev())
        }
    }
}

/// The 8.3 alias of the last component of `path`. Volumes without short
/// names hand back the long name.
pub fn short_name(path: &Path) -> Option<String> {
    #[cfg(windows)]
    {
        use std::os::windows::prelude::OsStrExt;
        use windows::{core::PCWSTR, Win32::Storage::FileSystem::GetShortPathNameW};

        let _guard = HookGuard::enter();
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let mut buffer = vec![0u16; 1024];
        let len =
            unsafe { GetShortPathNameW(PCWSTR::from_raw(wide.as_ptr()), Some(&mut buffer)) } as usize;
        // Zero on failure, the needed size when the buffer is too small.
        if len == 0 || len >= buffer.len() {
            return None;
        }
        let short = String::from_utf16_lossy(&buffer[..len]);
        short.rsplit('\\').next().map(str::to_owned)
    }
    #[cfg(not(windows))]
    {
        path.file_name().map(|name| name.to_string_lossy().into_owned())
    }
}

/// Copies a file, or a directory with everything below it, to `to`. Used
/// where a move out of a read-only source has to become a copy.
pub fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    let _guard = HookGuard::enter();
    if !std::fs::metadata(from)?.is_dir() {
        return std::fs::copy(from, to).map(|_| ());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_tree(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_epoch() {
        assert_eq!(system_time_to_filetime(UNIX_EPOCH), FILETIME_UNIX_EPOCH);
        assert_eq!(
            system_time_to_filetime(UNIX_EPOCH + std::time::Duration::from_secs(1)),
            FILETIME_UNIX_EPOCH + 10_000_000
        );
    }

    #[test]
    fn std_host_reports_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file.txt"), b"hello").unwrap();

        let host = StdHost;
        let file = host.metadata(&dir.path().join("file.txt")).unwrap();
        assert!(!file.is_dir());
        assert_eq!(file.size, 5);
        assert_eq!(file.allocation_size, 4096);
        assert!(host.is_dir(&dir.path().join("sub")));
        assert!(!host.exists(&dir.path().join("missing")));

        let mut names: Vec<String> = host
            .read_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["file.txt", "sub"]);
    }

    #[test]
    fn same_volume_uses_existing_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let host = StdHost;
        assert!(host
            .same_volume(&dir.path().join("a"), &dir.path().join("b/c/d"))
            .unwrap());
    }

    #[test]
    fn short_names_of_plain_names_are_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("A.TXT");
        std::fs::write(&file, b"a").unwrap();
        assert_eq!(short_name(&file).as_deref(), Some("A.TXT"));
    }

    #[test]
    fn copy_tree_copies_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("a/b")).unwrap();
        std::fs::write(from.join("a/b/c.txt"), b"c").unwrap();
        std::fs::write(from.join("top.txt"), b"top").unwrap();

        let to = dir.path().join("to");
        copy_tree(&from, &to).unwrap();
        assert_eq!(std::fs::read(to.join("a/b/c.txt")).unwrap(), b"c");
        assert_eq!(std::fs::read(to.join("top.txt")).unwrap(), b"top");
        assert!(from.join("top.txt").exists());
    }
}
