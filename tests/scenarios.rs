//! Whole-session scenarios: a coordinator publishes links, a hook context
//! attaches to them the way an injected process does, and file system
//! operations are routed over real directory trees.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use usvfs::{
    context::{self, HookContext, TrackedHandle},
    cursor::ScanFlags,
    records::InfoClass,
    router::CreateDisposition,
    wildcard::NamePattern,
    LinkFlags, Operation, Parameters, Resolution, VfsError, VirtualFileSystem, VirtualPathKey,
};

const TIMEOUT: Duration = Duration::from_secs(2);

/// `data` with two mods and an overwrite directory:
///
/// ```text
/// data/base.txt          data/docs/doc.skip ("base")
/// mod1/shared.txt ("mod1")  mod1/only1.txt  mod1/readme.skip
/// mod1/docs/doc.skip ("mod1")  mod1/empty/
/// mod2/shared.txt ("mod2")  mod2/sub/deep.txt
/// overwrite/
/// ```
struct Session {
    _dir: tempfile::TempDir,
    data: PathBuf,
    mod1: PathBuf,
    mod2: PathBuf,
    overwrite: PathBuf,
    vfs: VirtualFileSystem,
    context: HookContext,
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn session(tag: &str) -> Session {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let mod1 = dir.path().join("mod1");
    let mod2 = dir.path().join("mod2");
    let overwrite = dir.path().join("overwrite");

    write(&data.join("base.txt"), "base");
    write(&data.join("docs").join("doc.skip"), "base");
    write(&mod1.join("shared.txt"), "mod1");
    write(&mod1.join("only1.txt"), "only1");
    write(&mod1.join("readme.skip"), "skip me");
    write(&mod1.join("docs").join("doc.skip"), "mod1");
    fs::create_dir_all(mod1.join("empty")).unwrap();
    write(&mod2.join("shared.txt"), "mod2");
    write(&mod2.join("sub").join("deep.txt"), "deep");
    fs::create_dir_all(&overwrite).unwrap();

    let mut parameters = Parameters::new();
    parameters.set_instance_name(&format!("it_{}_{}", tag, uuid::Uuid::new_v4().simple()));
    let mut vfs = VirtualFileSystem::create(&parameters).unwrap();
    let virtual_data = data.to_string_lossy().into_owned();
    vfs.add_skip_file_suffix(".skip").unwrap();
    vfs.link_directory(&mod1, &virtual_data, LinkFlags::RECURSIVE)
        .unwrap();
    vfs.link_directory(&mod2, &virtual_data, LinkFlags::RECURSIVE)
        .unwrap();
    vfs.link_directory(
        &overwrite,
        &virtual_data,
        LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET,
    )
    .unwrap();

    let context = context::attach(parameters.instance_name(), TIMEOUT).unwrap();
    Session {
        _dir: dir,
        data,
        mod1,
        mod2,
        overwrite,
        vfs,
        context,
    }
}

fn key(path: &Path) -> VirtualPathKey {
    VirtualPathKey::from_path(path).unwrap()
}

impl Session {
    fn resolve(&self, path: &Path, op: Operation) -> usvfs::Result<Resolution> {
        self.context.router().resolve(&key(path), op)
    }

    /// What an application reading `path` would get.
    fn read(&self, path: &Path) -> usvfs::Result<String> {
        let real = match self.resolve(path, Operation::Open)? {
            Resolution::Redirect { real, .. } => real,
            Resolution::Passthrough => path.to_path_buf(),
            other => panic!("cannot read {:?}", other),
        };
        Ok(fs::read_to_string(real)?)
    }

    /// Names a `FindFirstFile`/`FindNextFile` loop over `dir` would see.
    fn find(&self, dir: &Path, pattern: &str) -> Vec<String> {
        let router = self.context.router();
        let listing = match router.resolve(&key(dir), Operation::Enumerate).unwrap() {
            Resolution::Listing(listing) => listing,
            other => panic!("expected a listing, got {:?}", other),
        };
        let mut cursor = context::cursor_for(&router, &listing);
        let pattern = NamePattern::from_win32(pattern);
        std::iter::from_fn(|| cursor.next_match(&pattern))
            .map(|entry| entry.name)
            .collect()
    }
}

#[test]
fn later_links_take_priority() {
    let s = session("priority");
    assert_eq!(s.read(&s.data.join("shared.txt")).unwrap(), "mod2");
    assert_eq!(s.read(&s.data.join("only1.txt")).unwrap(), "only1");
    assert_eq!(s.read(&s.data.join("base.txt")).unwrap(), "base");
    assert_eq!(s.read(&s.data.join("sub").join("deep.txt")).unwrap(), "deep");

    let names = s.find(&s.data, "*");
    for expected in [".", "..", "base.txt", "docs", "empty", "only1.txt", "shared.txt", "sub"] {
        assert_eq!(
            names.iter().filter(|n| n.as_str() == expected).count(),
            1,
            "{} in {:?}",
            expected,
            names
        );
    }
}

#[test]
fn skipped_names_come_from_the_base_directory() {
    let s = session("skip");
    // mod1's copy is skipped and data has none of its own.
    assert!(matches!(
        s.resolve(&s.data.join("readme.skip"), Operation::Open),
        Err(VfsError::NotFound(_))
    ));
    assert_eq!(s.read(&s.data.join("docs").join("doc.skip")).unwrap(), "base");
    assert!(!s.find(&s.data, "*").contains(&"readme.skip".to_string()));
}

#[test]
fn deleting_a_mod_file_only_hides_it() {
    let s = session("tombstone");
    let only1 = s.data.join("only1.txt");
    let resolution = s
        .resolve(&only1, Operation::Delete { directory: false })
        .unwrap();
    assert!(matches!(resolution, Resolution::Hidden));

    assert!(s.mod1.join("only1.txt").exists());
    assert!(matches!(
        s.resolve(&only1, Operation::Open),
        Err(VfsError::NotFound(_))
    ));
    assert!(!s.find(&s.data, "*.txt").contains(&"only1.txt".to_string()));
}

#[test]
fn deleting_from_the_overwrite_directory_is_physical() {
    let s = session("physical");
    write(&s.overwrite.join("saved.txt"), "saved");
    let saved = s.data.join("saved.txt");
    match s.resolve(&saved, Operation::Delete { directory: false }).unwrap() {
        Resolution::Redirect { real, .. } => {
            assert_eq!(real, s.overwrite.join("saved.txt"));
            fs::remove_file(&real).unwrap();
        }
        other => panic!("unexpected {:?}", other),
    }
    s.context.router().deleted(&key(&saved));
    assert!(!s.overwrite.join("saved.txt").exists());
    assert!(matches!(
        s.resolve(&saved, Operation::Open),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn new_files_land_in_overwrite_and_are_listed_once() {
    let s = session("write");
    let new = s.data.join("docs").join("new.txt");
    // Not there yet: queries report the virtual path as missing.
    assert!(matches!(
        s.resolve(&new, Operation::QueryAttributes),
        Err(VfsError::NotFound(_))
    ));

    let create = Operation::Create {
        disposition: CreateDisposition::CreateNew,
        directory: false,
    };
    match s.resolve(&new, create).unwrap() {
        Resolution::Redirect { real, create_dirs } => {
            assert_eq!(real, s.overwrite.join("docs").join("new.txt"));
            assert!(create_dirs);
            write(&real, "new");
        }
        other => panic!("unexpected {:?}", other),
    }
    s.context.router().materialized(&key(&new));

    assert_eq!(s.read(&new).unwrap(), "new");
    let names = s.find(&s.data.join("docs"), "*");
    assert_eq!(names.iter().filter(|n| n.as_str() == "new.txt").count(), 1);
    assert!(!s.data.join("docs").join("new.txt").exists());
}

#[test]
fn skipped_names_are_written_to_overwrite() {
    let s = session("skip_create");
    let new = s.data.join("new.skip");
    let create = Operation::Create {
        disposition: CreateDisposition::CreateNew,
        directory: false,
    };
    match s.resolve(&new, create).unwrap() {
        Resolution::Redirect { real, .. } => {
            assert_eq!(real, s.overwrite.join("new.skip"));
            write(&real, "created");
        }
        other => panic!("unexpected {:?}", other),
    }
    s.context.router().materialized(&key(&new));

    // The create target ignores the skip suffix, so the file stays visible.
    assert_eq!(s.read(&new).unwrap(), "created");
    assert!(s.find(&s.data, "*").contains(&"new.skip".to_string()));
    assert!(!s.mod1.join("new.skip").exists());
    assert!(!s.mod2.join("new.skip").exists());
    assert!(!s.data.join("new.skip").exists());
}

#[test]
fn empty_directories_from_mods_exist() {
    let s = session("empty");
    let empty = s.data.join("empty");
    match s.resolve(&empty, Operation::Open).unwrap() {
        Resolution::Redirect { real, .. } => assert_eq!(real, s.mod1.join("empty")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(s.find(&empty, "*"), vec![".", ".."]);
    // The directory exists, so a missing child is a missing file.
    assert!(matches!(
        s.resolve(&empty.join("anything"), Operation::QueryAttributes),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn untouched_trees_are_left_alone() {
    let s = session("identity");
    let outside = s.mod2.join("shared.txt");
    for op in [
        Operation::QueryAttributes,
        Operation::Open,
        Operation::Enumerate,
        Operation::Delete { directory: false },
    ] {
        assert!(matches!(
            s.resolve(&outside, op).unwrap(),
            Resolution::Passthrough
        ));
    }
}

#[test]
fn directory_handles_enumerate_the_merged_view() {
    let s = session("handle");
    let handle = 0x44;
    s.context.track(
        handle,
        TrackedHandle::new(key(&s.data), s.data.clone(), true),
    );
    let tracked = s.context.tracked(handle).unwrap();
    let router = s.context.router();

    let mut buf = vec![0u8; 4096];
    let result = tracked
        .with_cursor(&router, |cursor| {
            cursor.query(&mut buf, InfoClass::Names, ScanFlags::empty(), Some("*.txt"))
        })
        .unwrap()
        .unwrap();
    assert!(result.status.is_success());

    // FileNamesInformation: next offset, index, name length, name.
    let mut names = Vec::new();
    let mut at = 0;
    loop {
        let next = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize;
        let len = u32::from_le_bytes(buf[at + 8..at + 12].try_into().unwrap()) as usize;
        let units: Vec<u16> = buf[at + 12..at + 12 + len]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        names.push(String::from_utf16(&units).unwrap());
        if next == 0 {
            break;
        }
        at += next;
    }
    names.sort();
    assert_eq!(names, vec!["base.txt", "only1.txt", "shared.txt"]);

    assert!(s.context.forget(handle).is_some());
    assert!(s.context.tracked(handle).is_none());
}

#[test]
fn reload_picks_up_new_links_and_keeps_deletes() {
    let mut s = session("reload");
    let only1 = s.data.join("only1.txt");
    s.resolve(&only1, Operation::Delete { directory: false })
        .unwrap();

    let extra = s._dir.path().join("extra");
    write(&extra.join("late.txt"), "late");
    s.vfs
        .link_directory(&extra, &s.data.to_string_lossy(), LinkFlags::RECURSIVE)
        .unwrap();
    assert!(s.resolve(&s.data.join("late.txt"), Operation::Open).is_err());

    s.context.reload(TIMEOUT).unwrap();
    assert_eq!(s.read(&s.data.join("late.txt")).unwrap(), "late");
    assert!(matches!(
        s.resolve(&only1, Operation::Open),
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn closing_the_coordinator_withdraws_the_instance() {
    let s = session("withdraw");
    let instance = s.vfs.parameters().instance_name().to_owned();
    drop(s.vfs);
    assert!(matches!(
        context::attach(&instance, Duration::from_millis(100)),
        Err(VfsError::ChannelNotFound(_))
    ));
}
