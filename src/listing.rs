//! Merged directory listings for virtual directories.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use crate::{
    host::{EntryInfo, HostFs},
    path::{fold_case, VirtualPathKey},
    tree::{EnumerationPlan, RedirectionTree},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// The name also exists at the literal on-disk location.
    Real,
    /// The name is only visible through a link.
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub info: EntryInfo,
    pub origin: EntryOrigin,
    /// Where the entry physically lives; empty for synthesized directories.
    pub real_path: PathBuf,
}

impl DirEntry {
    pub fn folded_name(&self) -> String {
        fold_case(&self.name)
    }

    /// `.` or `..` for a directory listing.
    pub fn dot(name: &str, info: EntryInfo) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            info,
            origin: EntryOrigin::Real,
            real_path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub key: VirtualPathKey,
    /// The highest-priority source directory that exists.
    pub primary: Option<PathBuf>,
    /// Sorted by folded name, one entry per name.
    pub entries: Vec<DirEntry>,
    exists: bool,
}

impl DirectoryListing {
    /// Whether the directory exists anywhere, physically or in the tree.
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn find(&self, name: &str) -> Option<&DirEntry> {
        let folded = fold_case(name);
        self.entries
            .binary_search_by(|e| e.folded_name().cmp(&folded))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Merges the sources of `plan`. `hidden` is asked with folded names
    /// and removes entries that were deleted virtually.
    pub fn merge(
        tree: &RedirectionTree,
        plan: &EnumerationPlan,
        host: &dyn HostFs,
        hidden: &dyn Fn(&str) -> bool,
    ) -> DirectoryListing {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for name in &plan.virtual_children {
            let folded = fold_case(name);
            if hidden(&folded) || !seen.insert(folded) {
                continue;
            }
            if let Some(entry) = virtual_child(tree, &plan.key, name, host) {
                entries.push(entry);
            } else {
                seen.remove(&fold_case(name));
            }
        }

        let listings: Vec<Option<Vec<(String, EntryInfo)>>> = plan
            .sources
            .iter()
            .map(|source| read_source(host, &source.path))
            .collect();
        let native: HashSet<String> = plan
            .sources
            .iter()
            .zip(&listings)
            .find(|(source, _)| source.is_native())
            .and_then(|(_, listing)| listing.as_ref())
            .map(|listing| listing.iter().map(|(name, _)| fold_case(name)).collect())
            .unwrap_or_default();

        let skip = tree.skip_rules();
        let mut primary = None;
        for (source, listing) in plan.sources.iter().zip(listings) {
            let listing = match listing {
                Some(listing) => listing,
                None => continue,
            };
            primary.get_or_insert_with(|| source.path.clone());
            for (name, info) in listing {
                if source.honours_skip_rules()
                    && (skip.skips_directory(&name) || (!info.is_dir() && skip.skips_file(&name)))
                {
                    continue;
                }
                let folded = fold_case(&name);
                if hidden(&folded) || seen.contains(&folded) {
                    continue;
                }
                seen.insert(folded);
                entries.push(DirEntry {
                    real_path: source.path.join(&name),
                    name,
                    info,
                    origin: EntryOrigin::Virtual,
                });
            }
        }

        for entry in &mut entries {
            if native.contains(&entry.folded_name()) {
                entry.origin = EntryOrigin::Real;
            }
        }
        entries.sort_by_cached_key(DirEntry::folded_name);

        DirectoryListing {
            key: plan.key.clone(),
            exists: primary.is_some() || !plan.virtual_children.is_empty(),
            primary,
            entries,
        }
    }
}

fn read_source(host: &dyn HostFs, path: &Path) -> Option<Vec<(String, EntryInfo)>> {
    match host.read_dir(path) {
        Ok(listing) => Some(listing),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            log::debug!("cannot list {}: {}", path.display(), err);
            None
        }
    }
}

fn virtual_child(
    tree: &RedirectionTree,
    parent: &VirtualPathKey,
    name: &str,
    host: &dyn HostFs,
) -> Option<DirEntry> {
    let key = parent.join(name).ok()?;
    let node = tree.node(&key)?;
    if let Some(resolved) = tree.resolve_single(&key) {
        for candidate in &resolved.candidates {
            if let Ok(info) = host.metadata(&candidate.path) {
                return Some(DirEntry {
                    name: node.name().to_owned(),
                    info,
                    origin: EntryOrigin::Virtual,
                    real_path: candidate.path.clone(),
                });
            }
        }
    }
    node.is_directory_like().then(|| DirEntry {
        name: node.name().to_owned(),
        info: EntryInfo::synthetic_dir(),
        origin: EntryOrigin::Virtual,
        real_path: PathBuf::new(),
    })
}

impl RedirectionTree {
    /// Merged listing of the virtual directory `key`, or `None` when the
    /// directory is not virtualized.
    pub fn resolve_enumeration(
        &self,
        key: &VirtualPathKey,
        host: &dyn HostFs,
    ) -> Option<DirectoryListing> {
        let plan = self.enumeration_plan(key)?;
        Some(DirectoryListing::merge(self, &plan, host, &|_| false))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{host::StdHost, tree::LinkFlags};

    fn key(path: &Path) -> VirtualPathKey {
        VirtualPathKey::from_path(path).unwrap()
    }

    #[test]
    fn first_source_wins_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let mod1 = dir.path().join("mod1");
        let mod2 = dir.path().join("mod2");
        for d in [&base, &mod1, &mod2] {
            fs::create_dir(d).unwrap();
        }
        fs::write(base.join("base.txt"), b"base").unwrap();
        fs::write(base.join("shared.txt"), b"base").unwrap();
        fs::write(mod1.join("Shared.txt"), b"mod1").unwrap();
        fs::write(mod2.join("shared.TXT"), b"mod2!").unwrap();
        fs::write(mod1.join("only1.txt"), b"1").unwrap();

        let mut tree = RedirectionTree::new();
        tree.link(&key(&base), &mod1, LinkFlags::RECURSIVE).unwrap();
        tree.link(&key(&base), &mod2, LinkFlags::RECURSIVE).unwrap();

        let listing = tree.resolve_enumeration(&key(&base), &StdHost).unwrap();
        assert!(listing.exists());
        assert_eq!(listing.primary.as_deref(), Some(mod2.as_path()));
        let names: Vec<&str> = listing.names().collect();
        assert_eq!(names, vec!["base.txt", "only1.txt", "shared.TXT"]);

        let shared = listing.find("SHARED.txt").unwrap();
        assert_eq!(shared.info.size, 5);
        assert_eq!(shared.origin, EntryOrigin::Real);
        assert_eq!(listing.find("only1.txt").unwrap().origin, EntryOrigin::Virtual);
    }

    #[test]
    fn hidden_and_skipped_names_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let mod1 = dir.path().join("mod1");
        fs::create_dir(&base).unwrap();
        fs::create_dir(&mod1).unwrap();
        fs::write(mod1.join("readme.skip"), b"").unwrap();
        fs::write(base.join("native.skip"), b"").unwrap();
        fs::write(mod1.join("gone.txt"), b"").unwrap();
        fs::write(mod1.join("kept.txt"), b"").unwrap();

        let mut tree = RedirectionTree::new();
        tree.skip_rules_mut().add_file_suffix(".skip");
        tree.link(&key(&base), &mod1, LinkFlags::RECURSIVE).unwrap();

        let plan = tree.enumeration_plan(&key(&base)).unwrap();
        let gone = fold_case("gone.txt");
        let listing = DirectoryListing::merge(&tree, &plan, &StdHost, &|name| name == gone);
        let names: Vec<&str> = listing.names().collect();
        assert_eq!(names, vec!["kept.txt", "native.skip"]);
    }

    #[test]
    fn linked_subdirectories_appear_in_parent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let textures = dir.path().join("hd");
        fs::create_dir(&base).unwrap();
        fs::create_dir(&textures).unwrap();

        let mut tree = RedirectionTree::new();
        tree.link(&key(&base.join("textures")), &textures, LinkFlags::RECURSIVE)
            .unwrap();
        tree.link(&key(&base.join("missing")), dir.path().join("nowhere"), LinkFlags::RECURSIVE)
            .unwrap();

        let listing = tree.resolve_enumeration(&key(&base), &StdHost).unwrap();
        let textures_entry = listing.find("textures").unwrap();
        assert!(textures_entry.info.is_dir());
        assert_eq!(textures_entry.real_path, textures);
        assert!(listing.find("missing").unwrap().info.is_dir());
    }

    #[test]
    fn nothing_on_disk_means_not_existing() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data");
        let mut tree = RedirectionTree::new();
        tree.link(&key(&base), dir.path().join("mod"), LinkFlags::RECURSIVE)
            .unwrap();
        let listing = tree
            .resolve_enumeration(&key(&base.join("sub")), &StdHost)
            .unwrap();
        assert!(!listing.exists());
        assert!(listing.entries.is_empty());
    }
}
