//! Named shared memory carrying the current configuration snapshot.
//!
//! Two kinds of regions exist per instance:
//!
//! - `usvfs_<instance>`: a small control header, guarded by a sequence
//!   counter, naming the current payload.
//! - `usvfs_<instance>_<id>`: one immutable payload per publish.
//!
//! A publish writes a fresh payload region and then flips the header, so a
//! reader either finds the old payload or the new one, never a partial one.
//! The publisher keeps the previous payload alive until the next publish for
//! readers that looked at the header just before it changed.

use std::{
    collections::VecDeque,
    io,
    mem::size_of,
    sync::atomic::{fence, AtomicU32, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{
    error::{Result, VfsError},
    snapshot::SharedConfigSnapshot,
};

const CONTROL_MAGIC: u32 = 0x4C43_5655; // "UVCL"
const CONTROL_VERSION: u32 = 1;
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[repr(C)]
struct ControlHeader {
    magic: AtomicU32,
    version: AtomicU32,
    /// Odd while the header is being rewritten.
    sequence: AtomicU64,
    payload_id_high: AtomicU64,
    payload_id_low: AtomicU64,
    payload_len: AtomicU64,
    /// Process id of the publisher, for spotting abandoned channels.
    owner_pid: AtomicU32,
    _reserved: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeaderState {
    magic: u32,
    version: u32,
    payload_id: Uuid,
    payload_len: usize,
}

impl ControlHeader {
    /// # Safety
    /// `region` must be at least `size_of::<ControlHeader>()` bytes.
    unsafe fn from_region(region: &os::Region) -> &ControlHeader {
        &*(region.as_ptr() as *const ControlHeader)
    }

    fn write(&self, payload_id: Uuid, payload_len: usize) {
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        let (high, low) = split_id(payload_id);
        self.magic.store(CONTROL_MAGIC, Ordering::Relaxed);
        self.version.store(CONTROL_VERSION, Ordering::Relaxed);
        self.payload_id_high.store(high, Ordering::Relaxed);
        self.payload_id_low.store(low, Ordering::Relaxed);
        self.payload_len.store(payload_len as u64, Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(2), Ordering::Release);
    }

    /// `None` for a torn read.
    fn read(&self) -> Option<HeaderState> {
        let before = self.sequence.load(Ordering::Acquire);
        if before % 2 == 1 {
            return None;
        }
        let state = HeaderState {
            magic: self.magic.load(Ordering::Relaxed),
            version: self.version.load(Ordering::Relaxed),
            payload_id: join_id(
                self.payload_id_high.load(Ordering::Relaxed),
                self.payload_id_low.load(Ordering::Relaxed),
            ),
            payload_len: self.payload_len.load(Ordering::Relaxed) as usize,
        };
        fence(Ordering::Acquire);
        (self.sequence.load(Ordering::Relaxed) == before).then(|| state)
    }
}

fn split_id(id: Uuid) -> (u64, u64) {
    let value = id.as_u128();
    ((value >> 64) as u64, value as u64)
}

fn join_id(high: u64, low: u64) -> Uuid {
    Uuid::from_u128(((high as u128) << 64) | low as u128)
}

fn control_name(instance: &str) -> String {
    format!("usvfs_{}", instance)
}

fn payload_name(instance: &str, id: Uuid) -> String {
    format!("usvfs_{}_{}", instance, id.simple())
}

/// Owner of an instance's regions. Dropping it withdraws the instance.
pub struct Publisher {
    instance: String,
    control: os::Region,
    /// The current payload last, at most one predecessor before it.
    payloads: VecDeque<os::Region>,
}

impl Publisher {
    /// Claims `instance`. Fails with `AlreadyExists` while another live
    /// publisher holds it.
    pub fn create(instance: &str) -> Result<Publisher> {
        let name = control_name(instance);
        let len = size_of::<ControlHeader>();
        let control = match os::Region::create_exclusive(&name, len) {
            Ok(control) => control,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !abandoned(&name)? {
                    return Err(VfsError::AlreadyExists(name));
                }
                log::warn!("replacing abandoned configuration channel for {:?}", instance);
                os::remove(&name)?;
                os::Region::create_exclusive(&name, len)?
            }
            Err(err) => return Err(err.into()),
        };
        // Safety: the region was just created with the header's size.
        let header = unsafe { ControlHeader::from_region(&control) };
        header.owner_pid.store(std::process::id(), Ordering::Release);
        log::debug!("created configuration channel for {:?}", instance);
        Ok(Publisher {
            instance: instance.to_owned(),
            control,
            payloads: VecDeque::with_capacity(2),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Replaces the published snapshot.
    pub fn publish(&mut self, snapshot: &SharedConfigSnapshot) -> Result<()> {
        let bytes = snapshot.to_bytes()?;
        let id = Uuid::new_v4();
        let mut payload = os::Region::create(&payload_name(&self.instance, id), bytes.len())?;
        payload.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);

        // Safety: the control region was created with the header's size and
        // lives as long as `self`.
        let header = unsafe { ControlHeader::from_region(&self.control) };
        header.write(id, bytes.len());

        self.payloads.push_back(payload);
        while self.payloads.len() > 2 {
            self.payloads.pop_front();
        }
        log::info!(
            "published configuration for {:?} ({} bytes, {} links)",
            self.instance,
            bytes.len(),
            snapshot.links.len()
        );
        Ok(())
    }
}

/// Whether the control region `name` was left behind by a publisher that
/// no longer runs.
fn abandoned(name: &str) -> Result<bool> {
    let control = match os::Region::open(name, size_of::<ControlHeader>())? {
        Some(control) => control,
        None => return Ok(false),
    };
    // Safety: `open` checked the size.
    let header = unsafe { ControlHeader::from_region(&control) };
    Ok(!os::process_alive(header.owner_pid.load(Ordering::Acquire)))
}

/// Reads the snapshot currently published for `instance`.
///
/// Torn reads are retried until `timeout` elapses.
pub fn attach(instance: &str, timeout: Duration) -> Result<SharedConfigSnapshot> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(snapshot) = try_attach(instance)? {
            return Ok(snapshot);
        }
        if Instant::now() >= deadline {
            log::warn!("gave up reading configuration for {:?}", instance);
            return Err(VfsError::ChannelNotFound(instance.to_owned()));
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

fn try_attach(instance: &str) -> Result<Option<SharedConfigSnapshot>> {
    let control = os::Region::open(&control_name(instance), size_of::<ControlHeader>())?
        .ok_or_else(|| VfsError::ChannelNotFound(instance.to_owned()))?;
    // Safety: `open` checked the size and the region outlives `header`.
    let header = unsafe { ControlHeader::from_region(&control) };
    let state = match header.read() {
        Some(state) => state,
        None => return Ok(None),
    };
    if state.magic == 0 && state.payload_len == 0 {
        // created, nothing published yet
        return Err(VfsError::ChannelNotFound(instance.to_owned()));
    }
    if state.magic != CONTROL_MAGIC || state.version != CONTROL_VERSION {
        return Err(VfsError::ChannelCorrupt {
            instance: instance.to_owned(),
            reason: format!(
                "unexpected control header {:#x} version {}",
                state.magic, state.version
            ),
        });
    }
    let payload = match os::Region::open(&payload_name(instance, state.payload_id), state.payload_len)? {
        Some(payload) => payload,
        // superseded twice while we looked
        None => return Ok(None),
    };
    let snapshot = SharedConfigSnapshot::from_bytes(instance, &payload.as_slice()[..state.payload_len])?;
    Ok(Some(snapshot))
}

#[cfg(unix)]
mod os {
    use std::{
        fs::{self, File, OpenOptions},
        io,
        path::{Path, PathBuf},
    };

    use memmap2::{MmapMut, MmapOptions};

    pub struct Region {
        map: MmapMut,
        path: PathBuf,
        owner: bool,
    }

    fn region_path(name: &str) -> PathBuf {
        let shm = PathBuf::from("/dev/shm");
        let dir = if shm.is_dir() {
            shm
        } else {
            std::env::temp_dir()
        };
        dir.join(name.replace(|c: char| c == '/' || c == '\\', "_"))
    }

    impl Region {
        pub fn create(name: &str, len: usize) -> io::Result<Region> {
            let path = region_path(name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            Region::map_new(file, path, len)
        }

        /// Like [`Region::create`], but fails with `AlreadyExists` instead of
        /// taking over an existing region.
        pub fn create_exclusive(name: &str, len: usize) -> io::Result<Region> {
            let path = region_path(name);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?;
            Region::map_new(file, path, len)
        }

        fn map_new(file: File, path: PathBuf, len: usize) -> io::Result<Region> {
            file.set_len(len.max(1) as u64)?;
            let map = unsafe { MmapOptions::new().len(len.max(1)).map_mut(&file)? };
            Ok(Region {
                map,
                path,
                owner: true,
            })
        }

        pub fn open(name: &str, len: usize) -> io::Result<Option<Region>> {
            let path = region_path(name);
            let file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err),
            };
            if (file_len(&file)? as usize) < len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} is shorter than expected", path.display()),
                ));
            }
            let map = unsafe { MmapOptions::new().len(len.max(1)).map_mut(&file)? };
            Ok(Some(Region {
                map,
                path,
                owner: false,
            }))
        }

        pub fn as_ptr(&self) -> *const u8 {
            self.map.as_ptr()
        }

        pub fn as_slice(&self) -> &[u8] {
            &self.map
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            &mut self.map
        }
    }

    fn file_len(file: &File) -> io::Result<u64> {
        Ok(file.metadata()?.len())
    }

    pub fn remove(name: &str) -> io::Result<()> {
        match fs::remove_file(region_path(name)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Without `/proc` every owner counts as alive.
    pub fn process_alive(pid: u32) -> bool {
        let proc = Path::new("/proc");
        !proc.is_dir() || proc.join(pid.to_string()).exists()
    }

    impl Drop for Region {
        fn drop(&mut self) {
            if self.owner {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

#[cfg(windows)]
mod os {
    use std::io;

    use windows::{
        core::{HSTRING, PCWSTR},
        Win32::{
            Foundation::{
                CloseHandle, GetLastError, BOOL, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND,
                HANDLE, INVALID_HANDLE_VALUE,
            },
            System::Memory::{
                CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile,
                FILE_MAP, FILE_MAP_ALL_ACCESS, FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS,
                PAGE_READWRITE,
            },
        },
    };

    pub struct Region {
        handle: HANDLE,
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
    }

    // The view is plain memory owned by this value.
    unsafe impl Send for Region {}
    unsafe impl Sync for Region {}

    fn object_name(name: &str) -> HSTRING {
        HSTRING::from(format!("Local\\{}", name))
    }

    fn to_io(err: windows::core::Error) -> io::Error {
        io::Error::from_raw_os_error(err.code().0 & 0xFFFF)
    }

    impl Region {
        pub fn create(name: &str, len: usize) -> io::Result<Region> {
            Region::create_mapping(name, len, false)
        }

        pub fn create_exclusive(name: &str, len: usize) -> io::Result<Region> {
            Region::create_mapping(name, len, true)
        }

        fn create_mapping(name: &str, len: usize, exclusive: bool) -> io::Result<Region> {
            let len = len.max(1);
            let name = object_name(name);
            unsafe {
                let handle = CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    (len as u64 >> 32) as u32,
                    len as u32,
                    PCWSTR::from_raw(name.as_ptr()),
                )
                .map_err(to_io)?;
                if exclusive && GetLastError() == ERROR_ALREADY_EXISTS {
                    let _ = CloseHandle(handle);
                    return Err(io::ErrorKind::AlreadyExists.into());
                }
                Region::map(handle, FILE_MAP_ALL_ACCESS, len)
            }
        }

        pub fn open(name: &str, len: usize) -> io::Result<Option<Region>> {
            let name = object_name(name);
            let handle = unsafe {
                OpenFileMappingW(FILE_MAP_READ.0, BOOL(0), PCWSTR::from_raw(name.as_ptr()))
            };
            match handle {
                Ok(handle) => unsafe { Region::map(handle, FILE_MAP_READ, len.max(1)).map(Some) },
                Err(err) if err.code() == ERROR_FILE_NOT_FOUND.to_hresult() => Ok(None),
                Err(err) => Err(to_io(err)),
            }
        }

        unsafe fn map(handle: HANDLE, access: FILE_MAP, len: usize) -> io::Result<Region> {
            let view = MapViewOfFile(handle, access, 0, 0, len);
            if view.Value.is_null() {
                let err = io::Error::last_os_error();
                let _ = CloseHandle(handle);
                return Err(err);
            }
            Ok(Region { handle, view, len })
        }

        pub fn as_ptr(&self) -> *const u8 {
            self.view.Value as *const u8
        }

        pub fn as_slice(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.len) }
        }
    }

    /// Named mappings disappear with their last handle.
    pub fn remove(_name: &str) -> io::Result<()> {
        Ok(())
    }

    /// A mapping that still exists is held open by a live process.
    pub fn process_alive(_pid: u32) -> bool {
        true
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        parameters::Parameters,
        path::VirtualPathKey,
        tree::{LinkFlags, RedirectionTree},
    };

    fn unique_instance(tag: &str) -> String {
        format!("test_{}_{}", tag, Uuid::new_v4().simple())
    }

    fn snapshot(instance: &str, real: &str) -> SharedConfigSnapshot {
        let mut params = Parameters::new();
        params.set_instance_name(instance);
        let mut tree = RedirectionTree::new();
        tree.link(
            &VirtualPathKey::parse("C:\\data").unwrap(),
            real,
            LinkFlags::RECURSIVE,
        )
        .unwrap();
        SharedConfigSnapshot::capture(&params, &tree, &[])
    }

    #[test]
    fn header_round_trip() {
        let instance = unique_instance("header");
        let region = os::Region::create(&control_name(&instance), size_of::<ControlHeader>()).unwrap();
        let header = unsafe { ControlHeader::from_region(&region) };
        assert_eq!(header.read().unwrap().payload_len, 0);
        let id = Uuid::new_v4();
        header.write(id, 42);
        let state = header.read().unwrap();
        assert_eq!(state.payload_id, id);
        assert_eq!(state.payload_len, 42);
        assert_eq!(state.magic, CONTROL_MAGIC);
        assert_eq!(header.sequence.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn publish_then_attach() {
        let instance = unique_instance("publish");
        let mut publisher = Publisher::create(&instance).unwrap();
        let first = snapshot(&instance, "D:\\one");
        publisher.publish(&first).unwrap();
        assert_eq!(attach(&instance, Duration::from_secs(1)).unwrap(), first);

        let second = snapshot(&instance, "D:\\two");
        publisher.publish(&second).unwrap();
        assert_eq!(attach(&instance, Duration::from_secs(1)).unwrap(), second);
    }

    #[test]
    fn missing_instances() {
        let instance = unique_instance("missing");
        let err = attach(&instance, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VfsError::ChannelNotFound(_)));

        let publisher = Publisher::create(&instance).unwrap();
        let err = attach(&instance, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VfsError::ChannelNotFound(_)));
        drop(publisher);
    }

    #[test]
    fn live_instances_have_one_publisher() {
        let instance = unique_instance("exclusive");
        let mut first = Publisher::create(&instance).unwrap();
        let published = snapshot(&instance, "D:\\one");
        first.publish(&published).unwrap();

        let err = Publisher::create(&instance).err().unwrap();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
        assert_eq!(attach(&instance, Duration::from_secs(1)).unwrap(), published);

        drop(first);
        let mut second = Publisher::create(&instance).unwrap();
        second.publish(&snapshot(&instance, "D:\\two")).unwrap();
        assert!(attach(&instance, Duration::from_secs(1)).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abandoned_channels_are_taken_over() {
        let instance = unique_instance("abandoned");
        // A control region whose owner never recorded itself, as after a crash.
        let stale = os::Region::create(&control_name(&instance), size_of::<ControlHeader>()).unwrap();
        std::mem::forget(stale);

        let mut publisher = Publisher::create(&instance).unwrap();
        publisher.publish(&snapshot(&instance, "D:\\x")).unwrap();
        assert!(attach(&instance, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn dropping_the_publisher_withdraws_the_instance() {
        let instance = unique_instance("drop");
        let mut publisher = Publisher::create(&instance).unwrap();
        publisher.publish(&snapshot(&instance, "D:\\x")).unwrap();
        drop(publisher);
        let err = attach(&instance, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VfsError::ChannelNotFound(_)));
    }
}
