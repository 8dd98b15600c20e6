//! Decides where each file system operation on a virtual path goes.
//!
//! The router only probes the host; every mutation is carried out by the
//! caller, which reports back through [`Router::materialized`],
//! [`Router::deleted`] and [`Router::renamed`].

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    error::{Result, VfsError},
    host::{EntryInfo, HostFs},
    listing::DirectoryListing,
    path::{fold_case, VirtualPathKey},
    tree::{Candidate, RedirectionTree, SingleMatch},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Fail if the name exists.
    CreateNew,
    /// Open an existing file or create a new one.
    OpenAlways,
    /// Create or replace; the new file always goes to the write target.
    CreateAlways,
    /// Replace an existing file's content in place.
    TruncateExisting,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    QueryAttributes,
    Open,
    Create {
        disposition: CreateDisposition,
        directory: bool,
    },
    Enumerate,
    Delete {
        directory: bool,
    },
    Rename {
        destination: &'a VirtualPathKey,
        replace_existing: bool,
        allow_copy: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMethod {
    /// A native rename or move.
    Move,
    /// Copy to the destination, then hide the read-only source.
    CopyAndHide,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePlan {
    pub source_key: VirtualPathKey,
    pub destination_key: VirtualPathKey,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Create the destination's missing parent directories first.
    pub create_dirs: bool,
    pub method: RenameMethod,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Not virtualized: call the host with the original arguments.
    Passthrough,
    /// Use `real` instead of the virtual path.
    Redirect { real: PathBuf, create_dirs: bool },
    /// A directory that exists only in the redirection tree. Handles to it
    /// are opened on `anchor`, its nearest physical ancestor.
    Synthetic { info: EntryInfo, anchor: PathBuf },
    Listing(DirectoryListing),
    /// Deleted virtually: report success without touching the host.
    Hidden,
    Rename(RenamePlan),
}

impl Resolution {
    fn redirect(candidate: &Candidate) -> Resolution {
        match candidate.is_native() {
            true => Resolution::Passthrough,
            false => Resolution::Redirect {
                real: candidate.path.clone(),
                create_dirs: false,
            },
        }
    }
}

pub struct Router {
    tree: RedirectionTree,
    host: Arc<dyn HostFs>,
    /// Names deleted virtually, as folded names per directory.
    tombstones: RwLock<HashMap<VirtualPathKey, HashSet<String>>>,
}

impl Router {
    pub fn new(tree: RedirectionTree, host: Arc<dyn HostFs>) -> Router {
        Router {
            tree,
            host,
            tombstones: RwLock::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &RedirectionTree {
        &self.tree
    }

    pub fn host(&self) -> &dyn HostFs {
        &*self.host
    }

    /// The host this router probes, for building its replacement.
    pub fn shared_host(&self) -> Arc<dyn HostFs> {
        self.host.clone()
    }

    pub fn resolve(&self, key: &VirtualPathKey, op: Operation<'_>) -> Result<Resolution> {
        let resolution = match op {
            Operation::QueryAttributes | Operation::Open => self.resolve_existing(key),
            Operation::Create {
                disposition,
                directory,
            } => self.resolve_create(key, disposition, directory),
            Operation::Enumerate => self.resolve_enumerate(key),
            Operation::Delete { directory } => self.resolve_delete(key, directory),
            Operation::Rename {
                destination,
                replace_existing,
                allow_copy,
            } => self.resolve_rename(key, destination, replace_existing, allow_copy),
        };
        match &resolution {
            Ok(Resolution::Passthrough) => {}
            Ok(other) => log::trace!("{} {} -> {:?}", op_name(&op), key, other),
            Err(err) => log::trace!("{} {} failed: {}", op_name(&op), key, err),
        }
        resolution
    }

    /// Tombstones covering `key` itself or one of its ancestors.
    pub fn is_deleted(&self, key: &VirtualPathKey) -> bool {
        let tombstones = self.tombstones.read();
        if tombstones.is_empty() {
            return false;
        }
        (2..=key.len()).any(|len| {
            tombstones
                .get(&key.prefix(len - 1))
                .map(|names| names.contains(&key.folded()[len - 1]))
                .unwrap_or(false)
        })
    }

    pub fn tombstones_in(&self, dir: &VirtualPathKey) -> Vec<String> {
        self.tombstones
            .read()
            .get(dir)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn bury(&self, key: &VirtualPathKey) {
        if let (Some(parent), Some(name)) = (key.parent(), key.file_name()) {
            log::debug!("hiding {}", key);
            self.tombstones
                .write()
                .entry(parent)
                .or_default()
                .insert(fold_case(name));
        }
    }

    /// Takes over the virtual deletes of `previous`, the router this one
    /// replaces.
    pub fn inherit_tombstones(&self, previous: &Router) {
        let inherited = previous.tombstones.read().clone();
        self.tombstones.write().extend(inherited);
    }

    /// A file or directory was created at `key`.
    pub fn materialized(&self, key: &VirtualPathKey) {
        let (parent, name) = match (key.parent(), key.file_name()) {
            (Some(parent), Some(name)) => (parent, fold_case(name)),
            _ => return,
        };
        let mut tombstones = self.tombstones.write();
        if let Some(names) = tombstones.get_mut(&parent) {
            names.remove(&name);
            if names.is_empty() {
                tombstones.remove(&parent);
            }
        }
    }

    /// `key` was physically deleted. Copies of it in lower-priority sources
    /// are hidden so the name stays gone.
    pub fn deleted(&self, key: &VirtualPathKey) {
        if self.existing(key).is_some() {
            self.bury(key);
        }
    }

    pub fn renamed(&self, plan: &RenamePlan) {
        self.materialized(&plan.destination_key);
        match plan.method {
            RenameMethod::CopyAndHide => self.bury(&plan.source_key),
            RenameMethod::Move => self.deleted(&plan.source_key),
        }
    }

    fn existing(&self, key: &VirtualPathKey) -> Option<(SingleMatch, usize)> {
        if self.is_deleted(key) {
            return None;
        }
        let resolved = self.tree.resolve_single(key)?;
        let index = resolved
            .candidates
            .iter()
            .position(|c| self.host.exists(&c.path))?;
        Some((resolved, index))
    }

    fn synthetic(&self, key: &VirtualPathKey) -> Option<Resolution> {
        if self.is_deleted(key) || !self.tree.node(key)?.is_directory_like() {
            return None;
        }
        let native = key.to_path_buf();
        let anchor = native.ancestors().skip(1).find(|p| self.host.is_dir(p))?;
        Some(Resolution::Synthetic {
            info: EntryInfo::synthetic_dir(),
            anchor: anchor.to_path_buf(),
        })
    }

    /// Whether the directory containing `key` is visible.
    fn parent_exists(&self, key: &VirtualPathKey) -> bool {
        let parent = match key.parent() {
            Some(parent) => parent,
            None => return true,
        };
        if self.is_deleted(&parent) {
            return false;
        }
        match self.tree.resolve_single(&parent) {
            None => self.host.is_dir(&parent.to_path_buf()),
            Some(resolved) => {
                self.tree.node(&parent).is_some()
                    || resolved.candidates.iter().any(|c| self.host.is_dir(&c.path))
            }
        }
    }

    fn missing(&self, key: &VirtualPathKey) -> VfsError {
        match self.parent_exists(key) {
            true => VfsError::NotFound(key.to_string()),
            false => VfsError::PathNotFound(key.to_string()),
        }
    }

    /// Whether the tree or a tombstone has a say about `key`. Handles to
    /// other paths need no tracking.
    pub fn is_virtualized(&self, key: &VirtualPathKey) -> bool {
        self.is_deleted(key) || self.tree.resolve_single(key).is_some()
    }

    fn resolve_existing(&self, key: &VirtualPathKey) -> Result<Resolution> {
        if !self.is_virtualized(key) {
            return Ok(Resolution::Passthrough);
        }
        if let Some((resolved, index)) = self.existing(key) {
            return Ok(Resolution::redirect(&resolved.candidates[index]));
        }
        self.synthetic(key).ok_or_else(|| self.missing(key))
    }

    fn write_destination(&self, key: &VirtualPathKey) -> Result<Resolution> {
        if !self.parent_exists(key) {
            return Err(VfsError::PathNotFound(key.to_string()));
        }
        let write = self
            .tree
            .resolve_single(key)
            .and_then(|resolved| resolved.write_target);
        Ok(match write {
            Some(write) => Resolution::Redirect {
                real: write.path,
                create_dirs: write.create_target,
            },
            None => Resolution::Passthrough,
        })
    }

    fn resolve_create(
        &self,
        key: &VirtualPathKey,
        disposition: CreateDisposition,
        directory: bool,
    ) -> Result<Resolution> {
        if !self.is_virtualized(key) {
            return Ok(Resolution::Passthrough);
        }
        let existing = self.existing(key);
        let synthetic = match existing {
            Some(_) => None,
            None => self.synthetic(key),
        };
        match disposition {
            CreateDisposition::CreateNew => {
                if existing.is_some() || synthetic.is_some() {
                    return Err(VfsError::AlreadyExists(key.to_string()));
                }
                self.write_destination(key)
            }
            CreateDisposition::OpenAlways => match (existing, synthetic) {
                (Some((resolved, index)), _) => Ok(Resolution::redirect(&resolved.candidates[index])),
                (None, Some(synthetic)) if directory => Ok(synthetic),
                _ => self.write_destination(key),
            },
            CreateDisposition::CreateAlways => match synthetic {
                Some(synthetic) if directory => Ok(synthetic),
                _ => self.write_destination(key),
            },
            CreateDisposition::TruncateExisting => match existing {
                Some((resolved, index)) => Ok(Resolution::redirect(&resolved.candidates[index])),
                None => Err(self.missing(key)),
            },
        }
    }

    fn resolve_enumerate(&self, key: &VirtualPathKey) -> Result<Resolution> {
        if self.is_deleted(key) {
            return Err(self.missing(key));
        }
        let plan = match self.tree.enumeration_plan(key) {
            Some(plan) => plan,
            None => return Ok(Resolution::Passthrough),
        };
        let hidden: HashSet<String> = self.tombstones_in(key).into_iter().collect();
        let listing = DirectoryListing::merge(&self.tree, &plan, &*self.host, &|name| {
            hidden.contains(name)
        });
        if !listing.exists() {
            return Err(self.missing(key));
        }
        Ok(Resolution::Listing(listing))
    }

    fn resolve_delete(&self, key: &VirtualPathKey, directory: bool) -> Result<Resolution> {
        if !self.is_virtualized(key) {
            return Ok(Resolution::Passthrough);
        }
        let (resolved, index) = match self.existing(key) {
            Some(found) => found,
            None if self.synthetic(key).is_some() => {
                if !directory {
                    return Err(VfsError::IsADirectory(key.to_string()));
                }
                self.check_empty(key)?;
                self.bury(key);
                return Ok(Resolution::Hidden);
            }
            None => return Err(self.missing(key)),
        };
        let candidate = &resolved.candidates[index];
        match (self.host.is_dir(&candidate.path), directory) {
            (true, false) => return Err(VfsError::IsADirectory(key.to_string())),
            (false, true) => return Err(VfsError::NotADirectory(key.to_string())),
            _ => {}
        }
        if resolved.write_target.is_none() {
            return Ok(Resolution::redirect(candidate));
        }
        if directory {
            self.check_empty(key)?;
        }
        if candidate.is_writable() {
            return Ok(Resolution::Redirect {
                real: candidate.path.clone(),
                create_dirs: false,
            });
        }
        self.bury(key);
        Ok(Resolution::Hidden)
    }

    fn check_empty(&self, key: &VirtualPathKey) -> Result<()> {
        if let Ok(Resolution::Listing(listing)) = self.resolve_enumerate(key) {
            if !listing.entries.is_empty() {
                return Err(VfsError::DirectoryNotEmpty(key.to_string()));
            }
        }
        Ok(())
    }

    fn resolve_rename(
        &self,
        key: &VirtualPathKey,
        destination: &VirtualPathKey,
        replace_existing: bool,
        allow_copy: bool,
    ) -> Result<Resolution> {
        if !self.is_virtualized(key) && !self.is_virtualized(destination) {
            return Ok(Resolution::Passthrough);
        }

        let (source, writable) = match self.existing(key) {
            Some((resolved, index)) => {
                let candidate = &resolved.candidates[index];
                let writable = candidate.is_writable()
                    || resolved.write_target.is_none()
                    || !self.is_virtualized(key);
                (candidate.path.clone(), writable)
            }
            None if !self.is_virtualized(key) => (key.to_path_buf(), true),
            None => return Err(self.missing(key)),
        };

        if self.existing(destination).is_some() && !replace_existing {
            return Err(VfsError::AlreadyExists(destination.to_string()));
        }
        let (target, create_dirs) = match self.write_destination(destination)? {
            Resolution::Redirect { real, create_dirs } => (real, create_dirs),
            _ => (destination.to_path_buf(), false),
        };

        if !self.host.same_volume(&source, &target)? && !allow_copy {
            return Err(VfsError::CrossVolumeOperation {
                from: source,
                to: target,
            });
        }

        Ok(Resolution::Rename(RenamePlan {
            source_key: key.clone(),
            destination_key: destination.clone(),
            source,
            destination: target,
            create_dirs,
            method: match writable {
                true => RenameMethod::Move,
                false => RenameMethod::CopyAndHide,
            },
        }))
    }
}

fn op_name(op: &Operation<'_>) -> &'static str {
    match op {
        Operation::QueryAttributes => "query",
        Operation::Open => "open",
        Operation::Create { .. } => "create",
        Operation::Enumerate => "enumerate",
        Operation::Delete { .. } => "delete",
        Operation::Rename { .. } => "rename",
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io, path::Path};

    use super::*;
    use crate::{host::StdHost, tree::LinkFlags};

    /// Puts every path on its own volume.
    struct SplitVolumes;

    impl HostFs for SplitVolumes {
        fn metadata(&self, path: &Path) -> io::Result<EntryInfo> {
            StdHost.metadata(path)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<(String, EntryInfo)>> {
            StdHost.read_dir(path)
        }

        fn same_volume(&self, _: &Path, _: &Path) -> io::Result<bool> {
            Ok(false)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        data: PathBuf,
        mod1: PathBuf,
        overwrite: PathBuf,
        router: Router,
    }

    fn key(path: &Path) -> VirtualPathKey {
        VirtualPathKey::from_path(path).unwrap()
    }

    fn fixture() -> Fixture {
        fixture_on(Arc::new(StdHost))
    }

    fn fixture_on(host: Arc<dyn HostFs>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let mod1 = dir.path().join("mod1");
        let overwrite = dir.path().join("overwrite");
        for d in [&data, &mod1, &overwrite] {
            fs::create_dir(d).unwrap();
        }
        fs::write(data.join("base.txt"), b"base").unwrap();
        fs::write(mod1.join("mod.txt"), b"mod1").unwrap();
        fs::create_dir(mod1.join("docs")).unwrap();
        fs::write(mod1.join("docs").join("doc.txt"), b"doc").unwrap();

        let mut tree = RedirectionTree::new();
        tree.link(&key(&data), &mod1, LinkFlags::RECURSIVE).unwrap();
        tree.link(
            &key(&data),
            &overwrite,
            LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            data,
            mod1,
            overwrite,
            router: Router::new(tree, host),
        }
    }

    fn redirected(resolution: Resolution) -> PathBuf {
        match resolution {
            Resolution::Redirect { real, .. } => real,
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn opens_first_existing_candidate() {
        let f = fixture();
        let r = f
            .router
            .resolve(&key(&f.data.join("mod.txt")), Operation::Open)
            .unwrap();
        assert_eq!(redirected(r), f.mod1.join("mod.txt"));

        let r = f
            .router
            .resolve(&key(&f.data.join("base.txt")), Operation::QueryAttributes)
            .unwrap();
        assert!(matches!(r, Resolution::Passthrough));
    }

    #[test]
    fn missing_files_report_native_errors() {
        let f = fixture();
        let err = f
            .router
            .resolve(&key(&f.data.join("nope.txt")), Operation::Open)
            .unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        let err = f
            .router
            .resolve(&key(&f.data.join("nodir").join("x.txt")), Operation::Open)
            .unwrap_err();
        assert!(matches!(err, VfsError::PathNotFound(_)));
    }

    #[test]
    fn untouched_paths_pass_through() {
        let f = fixture();
        let outside = key(&f.mod1.join("mod.txt"));
        for op in [Operation::Open, Operation::Enumerate, Operation::Delete { directory: false }] {
            assert!(matches!(
                f.router.resolve(&outside, op).unwrap(),
                Resolution::Passthrough
            ));
        }
    }

    #[test]
    fn new_files_go_to_the_write_target() {
        let f = fixture();
        let new = key(&f.data.join("docs").join("new.txt"));
        let r = f
            .router
            .resolve(
                &new,
                Operation::Create {
                    disposition: CreateDisposition::CreateNew,
                    directory: false,
                },
            )
            .unwrap();
        match r {
            Resolution::Redirect { real, create_dirs } => {
                assert_eq!(real, f.overwrite.join("docs").join("new.txt"));
                assert!(create_dirs);
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = f
            .router
            .resolve(
                &key(&f.data.join("mod.txt")),
                Operation::Create {
                    disposition: CreateDisposition::CreateNew,
                    directory: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
    }

    #[test]
    fn create_always_shadows_lower_sources() {
        let f = fixture();
        let r = f
            .router
            .resolve(
                &key(&f.data.join("mod.txt")),
                Operation::Create {
                    disposition: CreateDisposition::CreateAlways,
                    directory: false,
                },
            )
            .unwrap();
        assert_eq!(redirected(r), f.overwrite.join("mod.txt"));
    }

    #[test]
    fn deleting_read_only_files_leaves_a_tombstone() {
        let f = fixture();
        let file = key(&f.data.join("mod.txt"));
        let r = f
            .router
            .resolve(&file, Operation::Delete { directory: false })
            .unwrap();
        assert!(matches!(r, Resolution::Hidden));
        assert!(f.mod1.join("mod.txt").exists());
        assert!(f.router.is_deleted(&file));

        let err = f.router.resolve(&file, Operation::Open).unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        match f.router.resolve(&key(&f.data), Operation::Enumerate).unwrap() {
            Resolution::Listing(listing) => assert!(listing.find("mod.txt").is_none()),
            other => panic!("unexpected {:?}", other),
        }

        // recreating the name brings it back
        let r = f
            .router
            .resolve(
                &file,
                Operation::Create {
                    disposition: CreateDisposition::CreateNew,
                    directory: false,
                },
            )
            .unwrap();
        assert_eq!(redirected(r), f.overwrite.join("mod.txt"));
        fs::write(f.overwrite.join("mod.txt"), b"new").unwrap();
        f.router.materialized(&file);
        assert!(!f.router.is_deleted(&file));
    }

    #[test]
    fn deleting_from_the_write_target_is_physical() {
        let f = fixture();
        fs::write(f.overwrite.join("written.txt"), b"w").unwrap();
        let file = key(&f.data.join("written.txt"));
        let r = f
            .router
            .resolve(&file, Operation::Delete { directory: false })
            .unwrap();
        assert_eq!(redirected(r), f.overwrite.join("written.txt"));
        fs::remove_file(f.overwrite.join("written.txt")).unwrap();
        f.router.deleted(&file);
        assert!(!f.router.is_deleted(&file));
    }

    #[test]
    fn deleted_directories_hide_their_content() {
        let f = fixture();
        let docs = key(&f.data.join("docs"));
        let err = f
            .router
            .resolve(&docs, Operation::Delete { directory: true })
            .unwrap_err();
        assert!(matches!(err, VfsError::DirectoryNotEmpty(_)));

        f.router
            .resolve(&docs.join("doc.txt").unwrap(), Operation::Delete { directory: false })
            .unwrap();
        let r = f
            .router
            .resolve(&docs, Operation::Delete { directory: true })
            .unwrap();
        assert!(matches!(r, Resolution::Hidden));
        let err = f
            .router
            .resolve(&docs.join("doc.txt").unwrap(), Operation::Open)
            .unwrap_err();
        assert!(matches!(err, VfsError::PathNotFound(_)));
    }

    #[test]
    fn renaming_read_only_files_copies() {
        let f = fixture();
        let source = key(&f.data.join("mod.txt"));
        let destination = key(&f.data.join("renamed.txt"));
        let r = f
            .router
            .resolve(
                &source,
                Operation::Rename {
                    destination: &destination,
                    replace_existing: false,
                    allow_copy: false,
                },
            )
            .unwrap();
        let plan = match r {
            Resolution::Rename(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.source, f.mod1.join("mod.txt"));
        assert_eq!(plan.destination, f.overwrite.join("renamed.txt"));
        assert_eq!(plan.method, RenameMethod::CopyAndHide);

        f.router.renamed(&plan);
        assert!(f.router.is_deleted(&source));
    }

    #[test]
    fn renaming_onto_an_existing_name() {
        let f = fixture();
        let source = key(&f.data.join("mod.txt"));
        let destination = key(&f.data.join("base.txt"));
        let rename = |replace_existing| {
            f.router.resolve(
                &source,
                Operation::Rename {
                    destination: &destination,
                    replace_existing,
                    allow_copy: false,
                },
            )
        };
        assert!(matches!(rename(false), Err(VfsError::AlreadyExists(_))));
        assert!(matches!(rename(true), Ok(Resolution::Rename(_))));
    }
    #[test]
    fn deletes_must_match_the_entry_kind() {
        let f = fixture();
        let docs = key(&f.data.join("docs"));
        let err = f
            .router
            .resolve(&docs, Operation::Delete { directory: false })
            .unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)));
        assert!(!f.router.is_deleted(&docs));
        let r = f
            .router
            .resolve(&docs.join("doc.txt").unwrap(), Operation::Open)
            .unwrap();
        assert_eq!(redirected(r), f.mod1.join("docs").join("doc.txt"));

        let file = key(&f.data.join("mod.txt"));
        let err = f
            .router
            .resolve(&file, Operation::Delete { directory: true })
            .unwrap_err();
        assert!(matches!(err, VfsError::NotADirectory(_)));
        assert!(!f.router.is_deleted(&file));
    }

    #[test]
    fn directories_only_in_the_tree_are_not_files() {
        let f = fixture();
        let mut tree = f.router.tree().clone();
        let other = f._dir.path().join("other");
        fs::create_dir(&other).unwrap();
        let virtual_dir = key(&f.data.join("virtual").join("deeper"));
        tree.link(&virtual_dir, &other, LinkFlags::empty()).unwrap();
        let router = Router::new(tree, Arc::new(StdHost));

        let virtual_parent = key(&f.data.join("virtual"));
        let err = router
            .resolve(&virtual_parent, Operation::Delete { directory: false })
            .unwrap_err();
        assert!(matches!(err, VfsError::IsADirectory(_)));
        assert!(!router.is_deleted(&virtual_parent));
    }

    #[test]
    fn cross_volume_renames_need_copy_permission() {
        let f = fixture_on(Arc::new(SplitVolumes));
        fs::write(f.overwrite.join("written.txt"), b"w").unwrap();
        let source = key(&f.data.join("written.txt"));
        let destination = key(&f.data.join("moved.txt"));
        let rename = |allow_copy| {
            f.router.resolve(
                &source,
                Operation::Rename {
                    destination: &destination,
                    replace_existing: false,
                    allow_copy,
                },
            )
        };

        match rename(false) {
            Err(VfsError::CrossVolumeOperation { from, to }) => {
                assert_eq!(from, f.overwrite.join("written.txt"));
                assert_eq!(to, f.overwrite.join("moved.txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match rename(true).unwrap() {
            Resolution::Rename(plan) => {
                assert_eq!(plan.source, f.overwrite.join("written.txt"));
                assert_eq!(plan.destination, f.overwrite.join("moved.txt"));
                assert_eq!(plan.method, RenameMethod::Move);
            }
            other => panic!("unexpected {:?}", other),
        }

        // A read-only source would be copied, which is refused the same way.
        let read_only = key(&f.data.join("mod.txt"));
        let err = f
            .router
            .resolve(
                &read_only,
                Operation::Rename {
                    destination: &destination,
                    replace_existing: false,
                    allow_copy: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, VfsError::CrossVolumeOperation { .. }));
    }
}
