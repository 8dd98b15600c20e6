//! The redirection tree: virtual directories and the real directories that
//! supply their content.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, VfsError},
    path::{fold_case, VirtualPathKey},
};

bitflags::bitflags! {
    pub struct LinkFlags: u32 {
        /// Fail if the virtual location already has a link.
        const FAIL_IF_EXISTS = 0x0000_0001;
        /// Accepted for compatibility; changes are always picked up at query time.
        const MONITOR_CHANGES = 0x0000_0002;
        /// New files go here; missing directories are created on demand.
        const CREATE_TARGET = 0x0000_0004;
        /// Apply the link to every subdirectory as well.
        const RECURSIVE = 0x0000_0008;
        /// Fail a file link whose name is excluded by the skip rules.
        const FAIL_IF_SKIPPED = 0x0000_0010;
    }
}

/// Which of two links to the same virtual directory wins a name collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precedence {
    /// Every new link shadows the ones made before it.
    LastLinkedWins,
    /// Earlier links keep shadowing later ones.
    FirstLinkedWins,
}

impl Default for Precedence {
    fn default() -> Self {
        Precedence::LastLinkedWins
    }
}

/// Names that are never taken from read-only link targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRules {
    file_suffixes: Vec<String>,
    directories: Vec<String>,
}

impl SkipRules {
    pub fn add_file_suffix(&mut self, suffix: &str) {
        let suffix = fold_case(suffix);
        if !suffix.is_empty() && !self.file_suffixes.contains(&suffix) {
            self.file_suffixes.push(suffix);
        }
    }

    pub fn add_directory(&mut self, name: &str) {
        let name = fold_case(name);
        if !name.is_empty() && !self.directories.contains(&name) {
            self.directories.push(name);
        }
    }

    pub fn clear_file_suffixes(&mut self) {
        self.file_suffixes.clear();
    }

    pub fn clear_directories(&mut self) {
        self.directories.clear();
    }

    pub fn file_suffixes(&self) -> &[String] {
        &self.file_suffixes
    }

    pub fn directories(&self) -> &[String] {
        &self.directories
    }

    pub fn is_empty(&self) -> bool {
        self.file_suffixes.is_empty() && self.directories.is_empty()
    }

    pub fn skips_file(&self, name: &str) -> bool {
        let folded = fold_case(name);
        self.file_suffixes.iter().any(|s| folded.ends_with(s.as_str()))
    }

    pub fn skips_directory(&self, name: &str) -> bool {
        let folded = fold_case(name);
        self.directories.iter().any(|d| *d == folded)
    }

    /// Whether a path below a link target is hidden: any directory on the
    /// way is skipped, or the last name is.
    pub fn skips_suffix(&self, suffix: &[String]) -> bool {
        match suffix.split_last() {
            None => false,
            Some((last, dirs)) => {
                dirs.iter().any(|d| self.skips_directory(d))
                    || self.skips_directory(last)
                    || self.skips_file(last)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub real: PathBuf,
    pub flags: LinkFlags,
}

impl LinkTarget {
    fn applies_to(&self, suffix_len: usize) -> bool {
        suffix_len <= 1 || self.flags.contains(LinkFlags::RECURSIVE)
    }

    fn honours_skip_rules(&self) -> bool {
        !self.flags.contains(LinkFlags::CREATE_TARGET)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TreeNode {
    name: String,
    children: BTreeMap<String, TreeNode>,
    targets: Vec<LinkTarget>,
}

impl TreeNode {
    fn named(name: &str) -> TreeNode {
        TreeNode {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link targets, highest priority first.
    pub fn link_targets(&self) -> &[LinkTarget] {
        &self.targets
    }

    pub fn children(&self) -> impl Iterator<Item = &TreeNode> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.get(&fold_case(name))
    }

    pub fn flags(&self) -> LinkFlags {
        self.targets
            .iter()
            .fold(LinkFlags::empty(), |acc, t| acc | t.flags)
    }

    /// Whether the node stands for a directory even when none of its
    /// targets exist on disk.
    pub fn is_directory_like(&self) -> bool {
        !self.children.is_empty()
            || self
                .flags()
                .intersects(LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET)
    }

    fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.children.is_empty()
    }
}

/// Where a candidate path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Link {
        /// The candidate is the write destination for its virtual path.
        writable: bool,
        /// The link carries [`LinkFlags::CREATE_TARGET`].
        create_target: bool,
    },
    /// The literal location of the virtual path on disk.
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub origin: Origin,
}

impl Candidate {
    pub fn is_native(&self) -> bool {
        self.origin == Origin::Native
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.origin, Origin::Link { writable: true, .. })
    }

    pub(crate) fn honours_skip_rules(&self) -> bool {
        matches!(
            self.origin,
            Origin::Link {
                create_target: false,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub path: PathBuf,
    pub create_target: bool,
}

/// Outcome of [`RedirectionTree::resolve_single`].
#[derive(Debug, Clone)]
pub struct SingleMatch {
    /// The most specific virtual directory that took part.
    pub node: VirtualPathKey,
    /// Every real path that may answer, best first; the native location last.
    pub candidates: Vec<Candidate>,
    pub write_target: Option<WriteTarget>,
}

impl SingleMatch {
    pub fn real_path(&self) -> &Path {
        &self.candidates[0].path
    }
}

/// Inputs for merging a directory listing.
#[derive(Debug, Clone)]
pub struct EnumerationPlan {
    pub key: VirtualPathKey,
    /// Real directories to list, highest priority first, native last.
    pub sources: Vec<Candidate>,
    /// Children that exist only as tree nodes (linked files and directories).
    pub virtual_children: Vec<String>,
}

fn join_suffix(base: &Path, suffix: &[String]) -> PathBuf {
    let mut path = base.to_path_buf();
    path.extend(suffix);
    path
}

fn same_real_path(a: &Path, b: &Path) -> bool {
    fold_case(&a.to_string_lossy()) == fold_case(&b.to_string_lossy())
}

#[derive(Debug, Clone, Default)]
pub struct RedirectionTree {
    root: TreeNode,
    precedence: Precedence,
    skip: SkipRules,
}

impl RedirectionTree {
    pub fn new() -> RedirectionTree {
        RedirectionTree::default()
    }

    pub fn with_precedence(precedence: Precedence) -> RedirectionTree {
        RedirectionTree {
            precedence,
            ..Default::default()
        }
    }

    pub fn precedence(&self) -> Precedence {
        self.precedence
    }

    pub fn skip_rules(&self) -> &SkipRules {
        &self.skip
    }

    pub fn skip_rules_mut(&mut self) -> &mut SkipRules {
        &mut self.skip
    }

    /// Makes `real_dir` supply content for `virtual_dir`.
    ///
    /// Linking the same real directory twice moves it to the priority slot
    /// the new link would get and replaces its flags.
    pub fn link(
        &mut self,
        virtual_dir: &VirtualPathKey,
        real_dir: impl Into<PathBuf>,
        flags: LinkFlags,
    ) -> Result<()> {
        let target = LinkTarget {
            real: real_dir.into(),
            flags,
        };
        log::debug!(
            "link {} -> {} ({:?})",
            virtual_dir,
            target.real.display(),
            flags
        );
        let precedence = self.precedence;
        let node = self.node_mut(virtual_dir);
        if flags.contains(LinkFlags::FAIL_IF_EXISTS) && !node.targets.is_empty() {
            return Err(VfsError::AlreadyExists(virtual_dir.to_string()));
        }
        node.targets.retain(|t| !same_real_path(&t.real, &target.real));
        match precedence {
            Precedence::LastLinkedWins => node.targets.insert(0, target),
            Precedence::FirstLinkedWins => node.targets.push(target),
        }
        Ok(())
    }

    /// Makes the single file `real_file` appear as `virtual_file`.
    pub fn link_file(
        &mut self,
        virtual_file: &VirtualPathKey,
        real_file: impl Into<PathBuf>,
        flags: LinkFlags,
    ) -> Result<()> {
        let real_file = real_file.into();
        if flags.contains(LinkFlags::FAIL_IF_SKIPPED) {
            let name = real_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.skip.skips_file(&name) {
                return Err(VfsError::NotFound(real_file.display().to_string()));
            }
        }
        self.link(
            virtual_file,
            real_file,
            flags - LinkFlags::RECURSIVE - LinkFlags::FAIL_IF_SKIPPED,
        )
    }

    /// Removes every link. Skip rules and precedence are kept.
    pub fn unlink_all(&mut self) {
        self.root = TreeNode::default();
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn node(&self, key: &VirtualPathKey) -> Option<&TreeNode> {
        let mut node = &self.root;
        for segment in key.folded() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, key: &VirtualPathKey) -> &mut TreeNode {
        let mut node = &mut self.root;
        for (display, folded) in key.segments().iter().zip(key.folded()) {
            node = node
                .children
                .entry(folded.clone())
                .or_insert_with(|| TreeNode::named(display));
        }
        node
    }

    /// Appends a target at the lowest priority, bypassing precedence. Used
    /// when rebuilding a tree whose order is already final.
    pub(crate) fn push_target(&mut self, key: &VirtualPathKey, target: LinkTarget) {
        self.node_mut(key).targets.push(target);
    }

    /// Every node with link targets, parents before children.
    pub(crate) fn linked_nodes(&self) -> Vec<(Vec<String>, &[LinkTarget])> {
        fn walk<'a>(
            node: &'a TreeNode,
            path: &mut Vec<String>,
            out: &mut Vec<(Vec<String>, &'a [LinkTarget])>,
        ) {
            if !node.targets.is_empty() {
                out.push((path.clone(), &node.targets));
            }
            for child in node.children.values() {
                path.push(child.name.clone());
                walk(child, path, out);
                path.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut Vec::new(), &mut out);
        out
    }

    /// Nodes along `key` that carry link targets, as (segments consumed,
    /// node), shallowest first, plus the node for `key` itself if the tree
    /// has one.
    fn walk<'a>(&'a self, key: &VirtualPathKey) -> (Vec<(usize, &'a TreeNode)>, Option<&'a TreeNode>) {
        let mut linked = Vec::new();
        let mut node = &self.root;
        for (i, segment) in key.folded().iter().enumerate() {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return (linked, None),
            }
            if !node.targets.is_empty() {
                linked.push((i + 1, node));
            }
        }
        (linked, Some(node))
    }

    /// Resolves `key` for single-target operations.
    ///
    /// Returns `None` when no virtual directory covers the path, in which
    /// case it must be used unchanged.
    pub fn resolve_single(&self, key: &VirtualPathKey) -> Option<SingleMatch> {
        let (linked, exact) = self.walk(key);
        let mut candidates = Vec::new();
        let mut write_target: Option<WriteTarget> = None;
        let mut fallback_write: Option<WriteTarget> = None;
        let mut node_depth = None;

        for &(depth, node) in linked.iter().rev() {
            let suffix = &key.segments()[depth..];
            for target in &node.targets {
                if !target.applies_to(suffix.len()) {
                    continue;
                }
                let path = join_suffix(&target.real, suffix);
                let create_target = target.flags.contains(LinkFlags::CREATE_TARGET);
                if write_target.is_none() && create_target {
                    write_target = Some(WriteTarget {
                        path: path.clone(),
                        create_target,
                    });
                }
                if fallback_write.is_none() {
                    fallback_write = Some(WriteTarget {
                        path: path.clone(),
                        create_target,
                    });
                }
                node_depth.get_or_insert(depth);
                if target.honours_skip_rules() && self.skip.skips_suffix(suffix) {
                    continue;
                }
                candidates.push(Candidate {
                    path,
                    origin: Origin::Link {
                        writable: false,
                        create_target,
                    },
                });
            }
        }

        let write_target = write_target.or(fallback_write);
        let node = match node_depth {
            Some(depth) => key.prefix(depth),
            None if exact.is_some() => key.clone(),
            None => return None,
        };
        if let Some(write) = &write_target {
            for candidate in &mut candidates {
                if candidate.path == write.path {
                    if let Origin::Link { writable, .. } = &mut candidate.origin {
                        *writable = true;
                    }
                }
            }
        }
        candidates.push(Candidate {
            path: key.to_path_buf(),
            origin: Origin::Native,
        });

        Some(SingleMatch {
            node,
            candidates,
            write_target,
        })
    }

    /// Collects the real directories whose listings make up the virtual
    /// directory `key`. `None` when the directory is not virtualized.
    pub fn enumeration_plan(&self, key: &VirtualPathKey) -> Option<EnumerationPlan> {
        let (linked, exact) = self.walk(key);
        let mut sources = Vec::new();

        for &(depth, node) in linked.iter().rev() {
            let suffix = &key.segments()[depth..];
            for target in &node.targets {
                if !suffix.is_empty() && !target.flags.contains(LinkFlags::RECURSIVE) {
                    continue;
                }
                if target.honours_skip_rules() && self.skip.skips_suffix(suffix) {
                    continue;
                }
                sources.push(Candidate {
                    path: join_suffix(&target.real, suffix),
                    origin: Origin::Link {
                        writable: false,
                        create_target: target.flags.contains(LinkFlags::CREATE_TARGET),
                    },
                });
            }
        }

        let virtual_children: Vec<String> = exact
            .map(|node| {
                node.children
                    .values()
                    .filter(|c| !c.is_empty())
                    .map(|c| c.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if sources.is_empty() && virtual_children.is_empty() {
            return None;
        }
        sources.push(Candidate {
            path: key.to_path_buf(),
            origin: Origin::Native,
        });
        Some(EnumerationPlan {
            key: key.clone(),
            sources,
            virtual_children,
        })
    }
}
