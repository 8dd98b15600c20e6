//! The coordinating side of a session: owns the authoritative tree and
//! republishes it after every change.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    channel::Publisher,
    error::{Result, VfsError},
    host::StdHost,
    logging,
    parameters::Parameters,
    path::VirtualPathKey,
    router::Router,
    snapshot::{self, SharedConfigSnapshot},
    tree::{LinkFlags, Precedence, RedirectionTree},
};

pub struct VirtualFileSystem {
    parameters: Parameters,
    tree: RedirectionTree,
    executable_blacklist: Vec<String>,
    publisher: Publisher,
}

impl VirtualFileSystem {
    pub fn create(parameters: &Parameters) -> Result<VirtualFileSystem> {
        VirtualFileSystem::with_precedence(parameters, Precedence::default())
    }

    pub fn with_precedence(
        parameters: &Parameters,
        precedence: Precedence,
    ) -> Result<VirtualFileSystem> {
        logging::set_log_level(parameters.log_level());
        let mut vfs = VirtualFileSystem {
            parameters: parameters.clone(),
            tree: RedirectionTree::with_precedence(precedence),
            executable_blacklist: Vec::new(),
            publisher: Publisher::create(parameters.instance_name())?,
        };
        vfs.publish()?;
        log::info!(
            "virtual file system {:?} created ({:?})",
            parameters.instance_name(),
            precedence
        );
        Ok(vfs)
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn tree(&self) -> &RedirectionTree {
        &self.tree
    }

    pub fn snapshot(&self) -> SharedConfigSnapshot {
        SharedConfigSnapshot::capture(&self.parameters, &self.tree, &self.executable_blacklist)
    }

    fn publish(&mut self) -> Result<()> {
        let snapshot = self.snapshot();
        self.publisher.publish(&snapshot)
    }

    /// Makes the content of `real_dir` visible under `virtual_dir`.
    pub fn link_directory(
        &mut self,
        real_dir: impl AsRef<Path>,
        virtual_dir: &str,
        flags: LinkFlags,
    ) -> Result<()> {
        let key = VirtualPathKey::parse(virtual_dir)?;
        self.tree
            .link(&key, absolute(real_dir.as_ref())?, flags)?;
        self.publish()
    }

    pub fn link_file(
        &mut self,
        real_file: impl AsRef<Path>,
        virtual_file: &str,
        flags: LinkFlags,
    ) -> Result<()> {
        let key = VirtualPathKey::parse(virtual_file)?;
        if key.is_root() {
            return Err(VfsError::invalid_path(
                virtual_file,
                crate::error::InvalidPathReason::NotAbsolute,
            ));
        }
        self.tree
            .link_file(&key, absolute(real_file.as_ref())?, flags)?;
        self.publish()
    }

    /// Removes every link. Processes already running pick the change up
    /// when they reload.
    pub fn clear_mappings(&mut self) -> Result<()> {
        log::info!("clearing all mappings");
        self.tree.unlink_all();
        self.publish()
    }

    pub fn add_skip_file_suffix(&mut self, suffix: &str) -> Result<()> {
        self.tree.skip_rules_mut().add_file_suffix(suffix);
        self.publish()
    }

    pub fn clear_skip_file_suffixes(&mut self) -> Result<()> {
        self.tree.skip_rules_mut().clear_file_suffixes();
        self.publish()
    }

    pub fn add_skip_directory(&mut self, name: &str) -> Result<()> {
        self.tree.skip_rules_mut().add_directory(name);
        self.publish()
    }

    pub fn clear_skip_directories(&mut self) -> Result<()> {
        self.tree.skip_rules_mut().clear_directories();
        self.publish()
    }

    /// Processes started from `executable` are launched without hooks.
    pub fn blacklist_executable(&mut self, executable: &str) -> Result<()> {
        if !self
            .executable_blacklist
            .iter()
            .any(|e| e.eq_ignore_ascii_case(executable))
        {
            self.executable_blacklist.push(executable.to_owned());
        }
        self.publish()
    }

    pub fn clear_executable_blacklist(&mut self) -> Result<()> {
        self.executable_blacklist.clear();
        self.publish()
    }

    pub fn is_blacklisted(&self, executable: &str) -> bool {
        snapshot::is_blacklisted(&self.executable_blacklist, executable)
    }

    /// A router over the current tree, as a hooked process would build it.
    pub fn router(&self) -> Router {
        Router::new(self.tree.clone(), Arc::new(StdHost))
    }

    /// Starts `executable` with hooks installed unless it is blacklisted.
    #[cfg(windows)]
    pub fn create_process_hooked(
        &self,
        executable: &Path,
        args: &[String],
        current_dir: Option<&Path>,
        options: &crate::inject::InjectOptions,
    ) -> Result<crate::inject::LaunchedProcess> {
        let instance = self.parameters.instance_name();
        if self.is_blacklisted(&executable.to_string_lossy()) {
            log::info!("{} is blacklisted, starting it unhooked", executable.display());
            return crate::inject::launch_unhooked(executable, args, current_dir);
        }
        crate::inject::launch_and_hook(instance, executable, args, current_dir, options)
    }

    #[cfg(windows)]
    pub fn hook_running(&self, pid: u32, options: &crate::inject::InjectOptions) -> Result<()> {
        crate::inject::hook_running(self.parameters.instance_name(), pid, options)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel;

    fn params(tag: &str) -> Parameters {
        let mut p = Parameters::new();
        p.set_instance_name(&format!("ctl_{}_{}", tag, uuid::Uuid::new_v4().simple()));
        p
    }

    #[test]
    fn every_change_is_published() {
        let p = params("publish");
        let mut vfs = VirtualFileSystem::create(&p).unwrap();
        let attached = channel::attach(p.instance_name(), Duration::from_secs(1)).unwrap();
        assert!(attached.links.is_empty());

        let dir = tempfile::tempdir().unwrap();
        let virtual_dir = dir.path().join("data");
        vfs.link_directory(dir.path().join("mod"), &virtual_dir.to_string_lossy(), LinkFlags::RECURSIVE)
            .unwrap();
        vfs.add_skip_file_suffix(".skip").unwrap();
        vfs.blacklist_executable("helper.exe").unwrap();

        let attached = channel::attach(p.instance_name(), Duration::from_secs(1)).unwrap();
        assert_eq!(attached, vfs.snapshot());
        assert_eq!(attached.links.len(), 1);
        assert!(attached.is_blacklisted("C:\\bin\\Helper.exe"));

        vfs.clear_mappings().unwrap();
        let attached = channel::attach(p.instance_name(), Duration::from_secs(1)).unwrap();
        assert!(attached.links.is_empty());
        assert_eq!(attached.skip_file_suffixes, vec![".SKIP".to_string()]);
    }

    #[test]
    fn invalid_virtual_paths_are_rejected() {
        let mut vfs = VirtualFileSystem::create(&params("invalid")).unwrap();
        let err = vfs
            .link_directory("/tmp", "relative\\dir", LinkFlags::empty())
            .unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath { .. }));
    }

    #[test]
    fn precedence_is_carried() {
        let p = params("precedence");
        let vfs = VirtualFileSystem::with_precedence(&p, Precedence::FirstLinkedWins).unwrap();
        let attached = channel::attach(p.instance_name(), Duration::from_secs(1)).unwrap();
        assert_eq!(attached.precedence, Precedence::FirstLinkedWins);
        assert_eq!(vfs.tree().precedence(), Precedence::FirstLinkedWins);
    }
}
