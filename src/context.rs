//! Per-process state of a hooked process.
//!
//! The hook layer consults one global [`HookContext`]: the router built from
//! the attached snapshot plus the table of handles that were opened through
//! a virtual path. Everything here is host independent so it can be driven
//! without any hooks installed.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use crate::{
    channel,
    cursor::DirCursor,
    error::{Result, VfsError},
    host::{self, EntryInfo, HostFs, StdHost, FILE_ATTRIBUTE_DIRECTORY},
    listing::{DirEntry, DirectoryListing},
    parameters::Parameters,
    path::VirtualPathKey,
    records::FindDataW,
    router::{Operation, Resolution, Router},
    snapshot::SharedConfigSnapshot,
    wildcard::NamePattern,
};

lazy_static::lazy_static! {
    static ref CURRENT: RwLock<Option<Arc<HookContext>>> = RwLock::new(None);
}

/// A handle whose path went through the router.
pub struct TrackedHandle {
    pub key: VirtualPathKey,
    /// Where the handle was actually opened.
    pub real: PathBuf,
    pub is_dir: bool,
    cursor: Mutex<Option<DirCursor>>,
}

impl TrackedHandle {
    pub fn new(key: VirtualPathKey, real: PathBuf, is_dir: bool) -> TrackedHandle {
        TrackedHandle {
            key,
            real,
            is_dir,
            cursor: Mutex::new(None),
        }
    }

    /// Runs `f` on this handle's enumeration cursor, building it from the
    /// merged listing on first use. Returns `Ok(None)` when the directory is
    /// not virtualized and the host should enumerate it.
    pub fn with_cursor<R>(
        &self,
        router: &Router,
        f: impl FnOnce(&mut DirCursor) -> R,
    ) -> Result<Option<R>> {
        let mut cursor = self.cursor.lock();
        if cursor.is_none() {
            let listing = match router.resolve(&self.key, Operation::Enumerate)? {
                Resolution::Listing(listing) => listing,
                _ => return Ok(None),
            };
            *cursor = Some(cursor_for(router, &listing));
        }
        Ok(cursor.as_mut().map(f))
    }
}

/// A cursor over `listing` whose `.` and `..` carry the primary directory's
/// metadata.
pub fn cursor_for(router: &Router, listing: &DirectoryListing) -> DirCursor {
    let dot_info = listing
        .primary
        .as_deref()
        .and_then(|p| router.host().metadata(p).ok())
        .unwrap_or_else(EntryInfo::synthetic_dir);
    DirCursor::for_listing(listing, dot_info)
}

/// State of one `FindFirstFile` search.
pub struct FindSession {
    pub cursor: DirCursor,
    pub pattern: NamePattern,
    /// `FindExInfoStandard` searches also carry the 8.3 alias.
    pub short_names: bool,
    pub directories_only: bool,
}

impl FindSession {
    pub fn next_entry(&mut self) -> Option<DirEntry> {
        while let Some(entry) = self.cursor.next_match(&self.pattern) {
            if !self.directories_only || entry.info.attributes & FILE_ATTRIBUTE_DIRECTORY != 0 {
                return Some(entry);
            }
        }
        None
    }

    pub fn find_data(&self, entry: &DirEntry) -> FindDataW {
        let data = FindDataW::from_entry(entry);
        if !self.short_names || entry.real_path.as_os_str().is_empty() {
            return data;
        }
        // Names that are already valid 8.3 come back unchanged and carry no alias.
        match host::short_name(&entry.real_path) {
            Some(short) if short != entry.name => data.with_short_name(&short),
            _ => data,
        }
    }
}

pub struct HookContext {
    parameters: Parameters,
    executable_blacklist: Vec<String>,
    router: RwLock<Arc<Router>>,
    handles: RwLock<HashMap<usize, Arc<TrackedHandle>>>,
    searches: Mutex<HashMap<usize, FindSession>>,
    next_search: AtomicUsize,
}

impl HookContext {
    pub fn from_snapshot(snapshot: SharedConfigSnapshot) -> Result<HookContext> {
        HookContext::with_host(snapshot, Arc::new(StdHost))
    }

    pub fn with_host(
        snapshot: SharedConfigSnapshot,
        host: Arc<dyn HostFs>,
    ) -> Result<HookContext> {
        let tree = snapshot.restore_tree()?;
        Ok(HookContext {
            parameters: snapshot.parameters,
            executable_blacklist: snapshot.executable_blacklist,
            router: RwLock::new(Arc::new(Router::new(tree, host))),
            handles: RwLock::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            // Search handles live well above any kernel handle value and are
            // never null or INVALID_HANDLE_VALUE.
            next_search: AtomicUsize::new(0x5356_0000),
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.read().clone()
    }

    pub fn is_blacklisted(&self, executable: &str) -> bool {
        crate::snapshot::is_blacklisted(&self.executable_blacklist, executable)
    }

    /// Re-reads the published configuration. Tombstones and open handles
    /// survive; cursors built before the reload keep their old listing.
    pub fn reload(&self, timeout: Duration) -> Result<()> {
        let snapshot = channel::attach(self.parameters.instance_name(), timeout)?;
        let tree = snapshot.restore_tree()?;
        let mut router = self.router.write();
        let replacement = Router::new(tree, router.shared_host());
        replacement.inherit_tombstones(&router);
        *router = Arc::new(replacement);
        log::info!(
            "reloaded configuration for {:?} ({} links)",
            self.parameters.instance_name(),
            snapshot.links.len()
        );
        Ok(())
    }

    pub fn track(&self, handle: usize, tracked: TrackedHandle) {
        log::trace!("tracking handle {:#x} for {}", handle, tracked.key);
        self.handles.write().insert(handle, Arc::new(tracked));
    }

    pub fn tracked(&self, handle: usize) -> Option<Arc<TrackedHandle>> {
        let handles = self.handles.read();
        if handles.is_empty() {
            return None;
        }
        handles.get(&handle).cloned()
    }

    pub fn forget(&self, handle: usize) -> Option<Arc<TrackedHandle>> {
        if self.handles.read().is_empty() {
            return None;
        }
        self.handles.write().remove(&handle)
    }

    pub fn tracked_count(&self) -> usize {
        self.handles.read().len()
    }

    /// Registers a search and returns the handle value handed to the caller.
    pub fn open_search(&self, session: FindSession) -> usize {
        let handle = self.next_search.fetch_add(4, Ordering::Relaxed);
        self.searches.lock().insert(handle, session);
        handle
    }

    /// Runs `f` on the search behind `handle`; `None` if it is not ours.
    pub fn with_search<R>(&self, handle: usize, f: impl FnOnce(&mut FindSession) -> R) -> Option<R> {
        self.searches.lock().get_mut(&handle).map(f)
    }

    pub fn close_search(&self, handle: usize) -> bool {
        self.searches.lock().remove(&handle).is_some()
    }
}

/// Makes `context` the one the hooks consult.
pub fn install(context: HookContext) -> Arc<HookContext> {
    let context = Arc::new(context);
    *CURRENT.write() = Some(context.clone());
    context
}

pub fn current() -> Option<Arc<HookContext>> {
    CURRENT.read().clone()
}

pub fn clear() {
    CURRENT.write().take();
}

/// Attaches to `instance` and builds a context from what it publishes.
pub fn attach(instance: &str, timeout: Duration) -> Result<HookContext> {
    let snapshot = channel::attach(instance, timeout)?;
    if snapshot.parameters.instance_name() != instance {
        return Err(VfsError::ChannelCorrupt {
            instance: instance.to_owned(),
            reason: format!(
                "snapshot belongs to {:?}",
                snapshot.parameters.instance_name()
            ),
        });
    }
    HookContext::from_snapshot(snapshot)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        cursor::ScanFlags,
        records::InfoClass,
        tree::{LinkFlags, RedirectionTree},
    };

    fn context_over(tree: &RedirectionTree) -> HookContext {
        let snapshot = SharedConfigSnapshot::capture(&Parameters::new(), tree, &[]);
        HookContext::from_snapshot(snapshot).unwrap()
    }

    fn key(path: &std::path::Path) -> VirtualPathKey {
        VirtualPathKey::from_path(path).unwrap()
    }

    #[test]
    fn tracked_directory_enumerates_merged_listing() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        let mod1 = root.path().join("mod1");
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(&mod1).unwrap();
        fs::write(data.join("base.txt"), b"").unwrap();
        fs::write(mod1.join("extra.txt"), b"").unwrap();

        let mut tree = RedirectionTree::new();
        tree.link(&key(&data), &mod1, LinkFlags::RECURSIVE).unwrap();
        let context = context_over(&tree);

        context.track(0x40, TrackedHandle::new(key(&data), data.clone(), true));
        let handle = context.tracked(0x40).unwrap();
        let router = context.router();
        let names = handle
            .with_cursor(&router, |cursor| {
                cursor
                    .entries()
                    .iter()
                    .map(|e| e.name.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap()
            .unwrap();
        assert_eq!(names, vec![".", "..", "base.txt", "extra.txt"]);

        let mut buf = vec![0u8; 4096];
        let result = handle
            .with_cursor(&router, |cursor| {
                cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), None)
            })
            .unwrap()
            .unwrap();
        assert!(result.status.is_success());

        assert!(context.forget(0x40).is_some());
        assert!(context.tracked(0x40).is_none());
        assert_eq!(context.tracked_count(), 0);
    }

    #[test]
    fn untouched_directory_is_left_to_the_host() {
        let root = tempfile::tempdir().unwrap();
        let context = context_over(&RedirectionTree::new());
        let tracked = TrackedHandle::new(key(root.path()), root.path().to_path_buf(), true);
        let result = tracked
            .with_cursor(&context.router(), |_| ())
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn search_handles_are_distinct_and_closable() {
        let context = context_over(&RedirectionTree::new());
        let session = || FindSession {
            cursor: DirCursor::new(Vec::new()),
            pattern: NamePattern::match_all(),
            short_names: true,
            directories_only: false,
        };
        let a = context.open_search(session());
        let b = context.open_search(session());
        assert_ne!(a, b);
        assert_eq!(context.with_search(a, |s| s.pattern.is_match_all()), Some(true));
        assert!(context.close_search(a));
        assert!(!context.close_search(a));
        assert!(context.with_search(a, |_| ()).is_none());
        assert!(context.close_search(b));
    }

    #[test]
    fn searches_can_be_limited_to_directories() {
        let entry = |name: &str, info: EntryInfo| DirEntry {
            name: name.into(),
            info,
            origin: crate::listing::EntryOrigin::Virtual,
            real_path: PathBuf::from(format!("/nowhere/{}", name)),
        };
        let entries = vec![
            entry("a.txt", EntryInfo::default()),
            entry("sub", EntryInfo::synthetic_dir()),
            entry("b.txt", EntryInfo::default()),
            entry("more", EntryInfo::synthetic_dir()),
        ];
        let mut session = FindSession {
            cursor: DirCursor::new(entries),
            pattern: NamePattern::match_all(),
            short_names: false,
            directories_only: true,
        };
        let names: Vec<String> = std::iter::from_fn(|| session.next_entry())
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["sub", "more"]);
    }

    #[test]
    fn basic_searches_leave_the_alias_empty() {
        let dir = tempfile::tempdir().unwrap();
        let long = dir.path().join("a rather long file name.txt");
        fs::write(&long, b"x").unwrap();
        let entry = DirEntry {
            name: "a rather long file name.txt".into(),
            info: EntryInfo::default(),
            origin: crate::listing::EntryOrigin::Real,
            real_path: long,
        };
        let session = FindSession {
            cursor: DirCursor::new(Vec::new()),
            pattern: NamePattern::match_all(),
            short_names: false,
            directories_only: false,
        };
        let data = session.find_data(&entry);
        assert_eq!(data.name(), "a rather long file name.txt");
        assert_eq!(data.short_name(), "");
    }

    #[test]
    fn installed_context_is_shared() {
        let context = install(context_over(&RedirectionTree::new()));
        let seen = current().unwrap();
        assert!(Arc::ptr_eq(&context, &seen));
        clear();
        assert!(current().is_none());
    }

    /// A host on which nothing exists.
    struct EmptyHost;

    impl HostFs for EmptyHost {
        fn metadata(&self, _: &std::path::Path) -> std::io::Result<EntryInfo> {
            Err(std::io::ErrorKind::NotFound.into())
        }

        fn read_dir(&self, _: &std::path::Path) -> std::io::Result<Vec<(String, EntryInfo)>> {
            Ok(Vec::new())
        }

        fn same_volume(&self, _: &std::path::Path, _: &std::path::Path) -> std::io::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn reload_keeps_the_host() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("data");
        let mod1 = root.path().join("mod1");
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(&mod1).unwrap();
        fs::write(mod1.join("a.txt"), b"").unwrap();

        let mut parameters = Parameters::new();
        parameters.set_instance_name(&format!("ctx_host_{}", uuid::Uuid::new_v4().simple()));
        let mut vfs = crate::controller::VirtualFileSystem::create(&parameters).unwrap();
        vfs.link_directory(&mod1, &data.to_string_lossy(), LinkFlags::RECURSIVE)
            .unwrap();
        let context = HookContext::with_host(vfs.snapshot(), Arc::new(EmptyHost)).unwrap();

        let a = key(&data.join("a.txt"));
        assert!(context.router().resolve(&a, Operation::Open).is_err());
        context.reload(Duration::from_secs(2)).unwrap();
        assert!(context.router().resolve(&a, Operation::Open).is_err());
    }

    #[test]
    fn blacklist_from_snapshot() {
        let snapshot = SharedConfigSnapshot::capture(
            &Parameters::new(),
            &RedirectionTree::new(),
            &["helper.exe".to_owned()],
        );
        let context = HookContext::from_snapshot(snapshot).unwrap();
        assert!(context.is_blacklisted("C:\\x\\HELPER.exe"));
        assert!(!context.is_blacklisted("C:\\x\\game.exe"));
    }
}
