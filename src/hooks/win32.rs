//! `kernelbase` entry points whose semantics the ntdll layer cannot see:
//! searches with their own handles, moves, copies and process creation.

use std::{ffi::c_void, path::Path};

use windows::{
    core::{PCWSTR, PWSTR},
    Win32::{
        Foundation::{
            CloseHandle, SetLastError, BOOL, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE,
            WIN32_ERROR,
        },
        Security::SECURITY_ATTRIBUTES,
        System::Threading::{CREATE_SUSPENDED, PROCESS_INFORMATION, STARTUPINFOW},
    },
};

use super::{create_parent_dirs, dispatch, win32_key, HookSlot, HookSpec, KERNEL};
use crate::{
    context::{self, FindSession, HookContext, TrackedHandle},
    error::VfsError,
    host::{self, EntryInfo},
    inject::{self, InjectOptions},
    path::VirtualPathKey,
    records::FindDataW,
    router::{CreateDisposition, Operation, RenameMethod, Resolution},
    status::{ERROR_FILE_EXISTS, ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_FILES},
    wide,
    wildcard::NamePattern,
};

const INVALID_FILE_ATTRIBUTES: u32 = u32::MAX;

const CREATE_NEW: u32 = 1;
const CREATE_ALWAYS: u32 = 2;
const OPEN_EXISTING: u32 = 3;
const OPEN_ALWAYS: u32 = 4;
const TRUNCATE_EXISTING: u32 = 5;

const COPY_FILE_FAIL_IF_EXISTS: u32 = 0x1;
const MOVEFILE_REPLACE_EXISTING: u32 = 0x1;
const MOVEFILE_COPY_ALLOWED: u32 = 0x2;

const GET_FILE_EX_INFO_STANDARD: i32 = 0;

const FIND_EX_INFO_STANDARD: i32 = 0;
const FIND_EX_INFO_BASIC: i32 = 1;
const FIND_EX_SEARCH_NAME_MATCH: i32 = 0;
const FIND_EX_SEARCH_LIMIT_TO_DIRECTORIES: i32 = 1;

const VOLUME_NAME_MASK: u32 = 0x7;
const VOLUME_NAME_DOS: u32 = 0x0;
const VOLUME_NAME_NONE: u32 = 0x4;

/// `WIN32_FILE_ATTRIBUTE_DATA`
#[repr(C)]
struct FileAttributeData {
    attributes: u32,
    creation_time: [u32; 2],
    last_access_time: [u32; 2],
    last_write_time: [u32; 2],
    size_high: u32,
    size_low: u32,
}

fn split_filetime(time: u64) -> [u32; 2] {
    [time as u32, (time >> 32) as u32]
}

impl From<&EntryInfo> for FileAttributeData {
    fn from(info: &EntryInfo) -> Self {
        FileAttributeData {
            attributes: info.attributes,
            creation_time: split_filetime(info.creation_time),
            last_access_time: split_filetime(info.last_access_time),
            last_write_time: split_filetime(info.last_write_time),
            size_high: (info.size >> 32) as u32,
            size_low: info.size as u32,
        }
    }
}

type CreateFileWFn = unsafe extern "system" fn(
    PCWSTR,
    u32,
    u32,
    *const SECURITY_ATTRIBUTES,
    u32,
    u32,
    HANDLE,
) -> HANDLE;
type CreateDirectoryWFn = unsafe extern "system" fn(PCWSTR, *const SECURITY_ATTRIBUTES) -> BOOL;
type PathFn = unsafe extern "system" fn(PCWSTR) -> BOOL;
type GetFileAttributesWFn = unsafe extern "system" fn(PCWSTR) -> u32;
type GetFileAttributesExWFn = unsafe extern "system" fn(PCWSTR, i32, *mut c_void) -> BOOL;
type SetFileAttributesWFn = unsafe extern "system" fn(PCWSTR, u32) -> BOOL;
type CopyFileExWFn = unsafe extern "system" fn(
    PCWSTR,
    PCWSTR,
    *mut c_void,
    *mut c_void,
    *mut BOOL,
    u32,
) -> BOOL;
type MoveFileWithProgressWFn =
    unsafe extern "system" fn(PCWSTR, PCWSTR, *mut c_void, *mut c_void, u32) -> BOOL;
type FindFirstFileExWFn =
    unsafe extern "system" fn(PCWSTR, i32, *mut c_void, i32, *mut c_void, u32) -> HANDLE;
type FindNextFileWFn = unsafe extern "system" fn(HANDLE, *mut FindDataW) -> BOOL;
type FindCloseFn = unsafe extern "system" fn(HANDLE) -> BOOL;
type GetFinalPathNameByHandleWFn = unsafe extern "system" fn(HANDLE, *mut u16, u32, u32) -> u32;
type CreateProcessInternalWFn = unsafe extern "system" fn(
    HANDLE,
    PCWSTR,
    PWSTR,
    *const SECURITY_ATTRIBUTES,
    *const SECURITY_ATTRIBUTES,
    BOOL,
    u32,
    *const c_void,
    PCWSTR,
    *const STARTUPINFOW,
    *mut PROCESS_INFORMATION,
    *mut HANDLE,
) -> BOOL;

static CREATE_FILE_W: HookSlot = HookSlot::new("CreateFileW");
static CREATE_DIRECTORY_W: HookSlot = HookSlot::new("CreateDirectoryW");
static DELETE_FILE_W: HookSlot = HookSlot::new("DeleteFileW");
static REMOVE_DIRECTORY_W: HookSlot = HookSlot::new("RemoveDirectoryW");
static GET_FILE_ATTRIBUTES_W: HookSlot = HookSlot::new("GetFileAttributesW");
static GET_FILE_ATTRIBUTES_EX_W: HookSlot = HookSlot::new("GetFileAttributesExW");
static SET_FILE_ATTRIBUTES_W: HookSlot = HookSlot::new("SetFileAttributesW");
static COPY_FILE_EX_W: HookSlot = HookSlot::new("CopyFileExW");
static MOVE_FILE_WITH_PROGRESS_W: HookSlot = HookSlot::new("MoveFileWithProgressW");
static FIND_FIRST_FILE_EX_W: HookSlot = HookSlot::new("FindFirstFileExW");
static FIND_NEXT_FILE_W: HookSlot = HookSlot::new("FindNextFileW");
static FIND_CLOSE: HookSlot = HookSlot::new("FindClose");
static GET_FINAL_PATH_NAME_BY_HANDLE_W: HookSlot = HookSlot::new("GetFinalPathNameByHandleW");
static CREATE_PROCESS_INTERNAL_W: HookSlot = HookSlot::new("CreateProcessInternalW");

pub(super) fn hooks() -> Vec<HookSpec> {
    vec![
        HookSpec::new(&CREATE_FILE_W, KERNEL, create_file_w as *const ()),
        HookSpec::new(&CREATE_DIRECTORY_W, KERNEL, create_directory_w as *const ()),
        HookSpec::new(&DELETE_FILE_W, KERNEL, delete_file_w as *const ()),
        HookSpec::new(&REMOVE_DIRECTORY_W, KERNEL, remove_directory_w as *const ()),
        HookSpec::new(
            &GET_FILE_ATTRIBUTES_W,
            KERNEL,
            get_file_attributes_w as *const (),
        ),
        HookSpec::new(
            &GET_FILE_ATTRIBUTES_EX_W,
            KERNEL,
            get_file_attributes_ex_w as *const (),
        ),
        HookSpec::new(
            &SET_FILE_ATTRIBUTES_W,
            KERNEL,
            set_file_attributes_w as *const (),
        ),
        HookSpec::new(&COPY_FILE_EX_W, KERNEL, copy_file_ex_w as *const ()),
        HookSpec::new(
            &MOVE_FILE_WITH_PROGRESS_W,
            KERNEL,
            move_file_with_progress_w as *const (),
        ),
        HookSpec::new(&FIND_FIRST_FILE_EX_W, KERNEL, find_first_file_ex_w as *const ()),
        HookSpec::new(&FIND_NEXT_FILE_W, KERNEL, find_next_file_w as *const ()),
        HookSpec::new(&FIND_CLOSE, KERNEL, find_close as *const ()),
        HookSpec::new(
            &GET_FINAL_PATH_NAME_BY_HANDLE_W,
            KERNEL,
            get_final_path_name_by_handle_w as *const (),
        ),
        HookSpec::new(
            &CREATE_PROCESS_INTERNAL_W,
            KERNEL,
            create_process_internal_w as *const (),
        ),
    ]
}

fn set_error(code: u32) {
    unsafe { SetLastError(WIN32_ERROR(code)) };
}

fn fail<R>(err: &VfsError, value: R) -> R {
    log::trace!("failing with {}", err);
    set_error(err.win32_error());
    value
}

/// Error code for a failed create. A name that is already taken reads
/// `ERROR_FILE_EXISTS` here, not the `ERROR_ALREADY_EXISTS` of directories.
fn creation_error(err: &VfsError) -> u32 {
    match err {
        VfsError::AlreadyExists(_) => ERROR_FILE_EXISTS,
        other => other.win32_error(),
    }
}

fn fail_creation<R>(err: &VfsError, value: R) -> R {
    log::trace!("create failing with {}", err);
    set_error(creation_error(err));
    value
}

fn wide_path(path: &Path) -> Vec<u16> {
    wide::to_wide(&path.to_string_lossy())
}

unsafe fn key_of(name: PCWSTR) -> Option<VirtualPathKey> {
    win32_key(&wide::from_ptr(name.0)?)
}

fn open_operation(disposition: u32) -> Operation<'static> {
    let disposition = match disposition {
        CREATE_NEW => CreateDisposition::CreateNew,
        CREATE_ALWAYS => CreateDisposition::CreateAlways,
        OPEN_ALWAYS => CreateDisposition::OpenAlways,
        TRUNCATE_EXISTING => CreateDisposition::TruncateExisting,
        OPEN_EXISTING => return Operation::Open,
        other => {
            log::debug!("unknown creation disposition {}", other);
            return Operation::Open;
        }
    };
    Operation::Create {
        disposition,
        directory: false,
    }
}

/// Splits a search expression into its directory and pattern.
fn split_search(expression: &str) -> Option<(&str, &str)> {
    let at = expression.rfind(|c| c == '\\' || c == '/')?;
    match &expression[..at] {
        "" => None,
        dir => Some((dir, &expression[at + 1..])),
    }
}

/// The name `GetFinalPathNameByHandleW` reports for a virtual path, or
/// `None` for forms only the host can produce.
fn final_path_name(key: &VirtualPathKey, flags: u32) -> Option<String> {
    match flags & VOLUME_NAME_MASK {
        VOLUME_NAME_DOS => Some(key.to_verbatim()),
        VOLUME_NAME_NONE => Some(key.volume_relative()),
        _ => None,
    }
}

unsafe extern "system" fn create_file_w(
    name: PCWSTR,
    access: u32,
    share: u32,
    security: *const SECURITY_ATTRIBUTES,
    disposition: u32,
    flags: u32,
    template: HANDLE,
) -> HANDLE {
    let original: CreateFileWFn = match CREATE_FILE_W.original() {
        Some(original) => original,
        None => return INVALID_HANDLE_VALUE,
    };
    let open = |path| original(path, access, share, security, disposition, flags, template);
    dispatch(
        INVALID_HANDLE_VALUE,
        || open(name),
        |context| {
            let key = match key_of(name) {
                Some(key) => key,
                None => return open(name),
            };
            let op = open_operation(disposition);
            let router = context.router();
            let real = match router.resolve(&key, op) {
                Ok(Resolution::Redirect { real, create_dirs }) => {
                    if create_dirs {
                        if let Err(e) = create_parent_dirs(&real) {
                            return fail(&e, INVALID_HANDLE_VALUE);
                        }
                    }
                    Some(real)
                }
                Ok(Resolution::Synthetic { anchor, .. }) => Some(anchor),
                Ok(Resolution::Passthrough) => None,
                Ok(other) => {
                    log::warn!("unexpected {:?} for an open of {}", other, key);
                    None
                }
                Err(e) => return fail_creation(&e, INVALID_HANDLE_VALUE),
            };
            let handle = match &real {
                Some(real) => {
                    let real = wide_path(real);
                    open(PCWSTR::from_raw(real.as_ptr()))
                }
                None => open(name),
            };
            if handle != INVALID_HANDLE_VALUE {
                if matches!(op, Operation::Create { .. }) {
                    router.materialized(&key);
                }
                if router.is_virtualized(&key) {
                    let real = real.unwrap_or_else(|| key.to_path_buf());
                    let is_dir = router.host().is_dir(&real);
                    context.track(handle.0 as usize, TrackedHandle::new(key, real, is_dir));
                }
            }
            handle
        },
    )
}

unsafe extern "system" fn create_directory_w(
    name: PCWSTR,
    security: *const SECURITY_ATTRIBUTES,
) -> BOOL {
    let original: CreateDirectoryWFn = match CREATE_DIRECTORY_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    let create = |path| original(path, security);
    dispatch(
        FALSE,
        || create(name),
        |context| {
            let key = match key_of(name) {
                Some(key) => key,
                None => return create(name),
            };
            let router = context.router();
            let op = Operation::Create {
                disposition: CreateDisposition::CreateNew,
                directory: true,
            };
            let created = match router.resolve(&key, op) {
                Ok(Resolution::Redirect { real, create_dirs }) => {
                    if create_dirs {
                        if let Err(e) = create_parent_dirs(&real) {
                            return fail(&e, FALSE);
                        }
                    }
                    let real = wide_path(&real);
                    create(PCWSTR::from_raw(real.as_ptr()))
                }
                Ok(_) => create(name),
                Err(e) => return fail(&e, FALSE),
            };
            if created.as_bool() {
                router.materialized(&key);
            }
            created
        },
    )
}

unsafe fn routed_delete(
    context: &HookContext,
    name: PCWSTR,
    directory: bool,
    delete: impl Fn(PCWSTR) -> BOOL,
) -> BOOL {
    let key = match key_of(name) {
        Some(key) => key,
        None => return delete(name),
    };
    let router = context.router();
    let deleted = match router.resolve(&key, Operation::Delete { directory }) {
        Ok(Resolution::Hidden) => return TRUE,
        Ok(Resolution::Redirect { real, .. }) => {
            let real = wide_path(&real);
            delete(PCWSTR::from_raw(real.as_ptr()))
        }
        Ok(_) => delete(name),
        Err(e) => return fail(&e, FALSE),
    };
    if deleted.as_bool() {
        router.deleted(&key);
    }
    deleted
}

unsafe extern "system" fn delete_file_w(name: PCWSTR) -> BOOL {
    let original: PathFn = match DELETE_FILE_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    dispatch(
        FALSE,
        || original(name),
        |context| routed_delete(context, name, false, |path| original(path)),
    )
}

unsafe extern "system" fn remove_directory_w(name: PCWSTR) -> BOOL {
    let original: PathFn = match REMOVE_DIRECTORY_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    dispatch(
        FALSE,
        || original(name),
        |context| routed_delete(context, name, true, |path| original(path)),
    )
}

unsafe extern "system" fn get_file_attributes_w(name: PCWSTR) -> u32 {
    let original: GetFileAttributesWFn = match GET_FILE_ATTRIBUTES_W.original() {
        Some(original) => original,
        None => return INVALID_FILE_ATTRIBUTES,
    };
    dispatch(
        INVALID_FILE_ATTRIBUTES,
        || original(name),
        |context| {
            let key = match key_of(name) {
                Some(key) => key,
                None => return original(name),
            };
            match context.router().resolve(&key, Operation::QueryAttributes) {
                Ok(Resolution::Redirect { real, .. }) => {
                    let real = wide_path(&real);
                    original(PCWSTR::from_raw(real.as_ptr()))
                }
                Ok(Resolution::Synthetic { info, .. }) => info.attributes,
                Ok(_) => original(name),
                Err(e) => fail(&e, INVALID_FILE_ATTRIBUTES),
            }
        },
    )
}

unsafe extern "system" fn get_file_attributes_ex_w(
    name: PCWSTR,
    level: i32,
    information: *mut c_void,
) -> BOOL {
    let original: GetFileAttributesExWFn = match GET_FILE_ATTRIBUTES_EX_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    dispatch(
        FALSE,
        || original(name, level, information),
        |context| {
            let key = match key_of(name) {
                Some(key) => key,
                None => return original(name, level, information),
            };
            match context.router().resolve(&key, Operation::QueryAttributes) {
                Ok(Resolution::Redirect { real, .. }) => {
                    let real = wide_path(&real);
                    original(PCWSTR::from_raw(real.as_ptr()), level, information)
                }
                Ok(Resolution::Synthetic { info, .. })
                    if level == GET_FILE_EX_INFO_STANDARD && !information.is_null() =>
                {
                    *(information as *mut FileAttributeData) = FileAttributeData::from(&info);
                    TRUE
                }
                Ok(_) => original(name, level, information),
                Err(e) => fail(&e, FALSE),
            }
        },
    )
}

unsafe extern "system" fn set_file_attributes_w(name: PCWSTR, attributes: u32) -> BOOL {
    let original: SetFileAttributesWFn = match SET_FILE_ATTRIBUTES_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    dispatch(
        FALSE,
        || original(name, attributes),
        |context| {
            let key = match key_of(name) {
                Some(key) => key,
                None => return original(name, attributes),
            };
            match context.router().resolve(&key, Operation::Open) {
                Ok(Resolution::Redirect { real, .. }) => {
                    let real = wide_path(&real);
                    original(PCWSTR::from_raw(real.as_ptr()), attributes)
                }
                Ok(Resolution::Synthetic { .. }) => TRUE,
                Ok(_) => original(name, attributes),
                Err(e) => fail(&e, FALSE),
            }
        },
    )
}

unsafe extern "system" fn copy_file_ex_w(
    source: PCWSTR,
    destination: PCWSTR,
    progress: *mut c_void,
    data: *mut c_void,
    cancel: *mut BOOL,
    flags: u32,
) -> BOOL {
    let original: CopyFileExWFn = match COPY_FILE_EX_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    let copy = |from, to| original(from, to, progress, data, cancel, flags);
    dispatch(
        FALSE,
        || copy(source, destination),
        |context| {
            let router = context.router();
            let source_real = match key_of(source).map(|key| router.resolve(&key, Operation::Open)) {
                Some(Ok(Resolution::Redirect { real, .. })) => Some(wide_path(&real)),
                Some(Err(e)) => return fail(&e, FALSE),
                _ => None,
            };
            let destination_key = key_of(destination);
            let op = Operation::Create {
                disposition: if flags & COPY_FILE_FAIL_IF_EXISTS != 0 {
                    CreateDisposition::CreateNew
                } else {
                    CreateDisposition::CreateAlways
                },
                directory: false,
            };
            let destination_real = match destination_key.as_ref().map(|key| router.resolve(key, op)) {
                Some(Ok(Resolution::Redirect { real, create_dirs })) => {
                    if create_dirs {
                        if let Err(e) = create_parent_dirs(&real) {
                            return fail(&e, FALSE);
                        }
                    }
                    Some(wide_path(&real))
                }
                Some(Err(e)) => return fail_creation(&e, FALSE),
                _ => None,
            };
            let copied = copy(
                source_real
                    .as_ref()
                    .map(|w| PCWSTR::from_raw(w.as_ptr()))
                    .unwrap_or(source),
                destination_real
                    .as_ref()
                    .map(|w| PCWSTR::from_raw(w.as_ptr()))
                    .unwrap_or(destination),
            );
            if copied.as_bool() {
                if let Some(key) = &destination_key {
                    router.materialized(key);
                }
            }
            copied
        },
    )
}

unsafe extern "system" fn move_file_with_progress_w(
    source: PCWSTR,
    destination: PCWSTR,
    progress: *mut c_void,
    data: *mut c_void,
    flags: u32,
) -> BOOL {
    let original: MoveFileWithProgressWFn = match MOVE_FILE_WITH_PROGRESS_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    let rename = |from, to| original(from, to, progress, data, flags);
    dispatch(
        FALSE,
        || rename(source, destination),
        |context| {
            // A null destination schedules a delete at reboot.
            let (source_key, destination_key) = match (key_of(source), key_of(destination)) {
                (Some(source_key), Some(destination_key)) => (source_key, destination_key),
                _ => return rename(source, destination),
            };
            let router = context.router();
            let op = Operation::Rename {
                destination: &destination_key,
                replace_existing: flags & MOVEFILE_REPLACE_EXISTING != 0,
                allow_copy: flags & MOVEFILE_COPY_ALLOWED != 0,
            };
            let plan = match router.resolve(&source_key, op) {
                Ok(Resolution::Rename(plan)) => plan,
                Ok(_) => return rename(source, destination),
                Err(e) => return fail(&e, FALSE),
            };
            if plan.create_dirs {
                if let Err(e) = create_parent_dirs(&plan.destination) {
                    return fail(&e, FALSE);
                }
            }
            let moved = match plan.method {
                RenameMethod::Move => {
                    let from = wide_path(&plan.source);
                    let to = wide_path(&plan.destination);
                    rename(PCWSTR::from_raw(from.as_ptr()), PCWSTR::from_raw(to.as_ptr()))
                }
                RenameMethod::CopyAndHide => match host::copy_tree(&plan.source, &plan.destination) {
                    Ok(()) => TRUE,
                    Err(e) => return fail(&e.into(), FALSE),
                },
            };
            if moved.as_bool() {
                router.renamed(&plan);
            }
            moved
        },
    )
}

unsafe extern "system" fn find_first_file_ex_w(
    name: PCWSTR,
    level: i32,
    find_data: *mut c_void,
    search_op: i32,
    filter: *mut c_void,
    flags: u32,
) -> HANDLE {
    let original: FindFirstFileExWFn = match FIND_FIRST_FILE_EX_W.original() {
        Some(original) => original,
        None => return INVALID_HANDLE_VALUE,
    };
    let native = || original(name, level, find_data, search_op, filter, flags);
    dispatch(INVALID_HANDLE_VALUE, &native, |context| {
        let (short_names, directories_only) = match search_options(level, search_op) {
            Some(options) => options,
            None => return native(),
        };
        let expression = match wide::from_ptr(name.0) {
            Some(expression) => expression,
            None => return native(),
        };
        let (dir, pattern) = match split_search(&expression) {
            Some(split) => split,
            None => return native(),
        };
        let key = match win32_key(dir) {
            Some(key) => key,
            None => return native(),
        };
        let router = context.router();
        let listing = match router.resolve(&key, Operation::Enumerate) {
            Ok(Resolution::Listing(listing)) => listing,
            Ok(_) => return native(),
            // A search in a missing directory reports the path, not the file.
            Err(VfsError::NotFound(path)) => {
                return fail(&VfsError::PathNotFound(path), INVALID_HANDLE_VALUE)
            }
            Err(e) => return fail(&e, INVALID_HANDLE_VALUE),
        };

        let mut session = FindSession {
            cursor: context::cursor_for(&router, &listing),
            pattern: NamePattern::from_win32(pattern),
            short_names,
            directories_only,
        };
        let first = match session.next_entry() {
            Some(first) => first,
            None => {
                set_error(ERROR_FILE_NOT_FOUND);
                return INVALID_HANDLE_VALUE;
            }
        };
        if !find_data.is_null() {
            *(find_data as *mut FindDataW) = session.find_data(&first);
        }
        let handle = context.open_search(session);
        log::trace!("search {:#x} over {}", handle, key);
        HANDLE(handle as _)
    })
}

/// Maps the `FindFirstFileExW` info level and search op to
/// `(short_names, directories_only)`. Device searches and unknown levels
/// are left to the host.
fn search_options(level: i32, search_op: i32) -> Option<(bool, bool)> {
    let short_names = match level {
        FIND_EX_INFO_STANDARD => true,
        FIND_EX_INFO_BASIC => false,
        _ => return None,
    };
    let directories_only = match search_op {
        FIND_EX_SEARCH_NAME_MATCH => false,
        FIND_EX_SEARCH_LIMIT_TO_DIRECTORIES => true,
        _ => return None,
    };
    Some((short_names, directories_only))
}

/// Search handles from [`find_first_file_ex_w`] are served whether or not
/// the thread is inside the engine; the host has never seen them.
unsafe extern "system" fn find_next_file_w(handle: HANDLE, find_data: *mut FindDataW) -> BOOL {
    let original: FindNextFileWFn = match FIND_NEXT_FILE_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    if let Some(context) = context::current() {
        let next = context.with_search(handle.0 as usize, |search| {
            search.next_entry().map(|entry| search.find_data(&entry))
        });
        match next {
            Some(Some(data)) => {
                if let Some(find_data) = find_data.as_mut() {
                    *find_data = data;
                }
                return TRUE;
            }
            Some(None) => {
                set_error(ERROR_NO_MORE_FILES);
                return FALSE;
            }
            None => {}
        }
    }
    original(handle, find_data)
}

unsafe extern "system" fn find_close(handle: HANDLE) -> BOOL {
    let original: FindCloseFn = match FIND_CLOSE.original() {
        Some(original) => original,
        None => return FALSE,
    };
    match context::current() {
        Some(context) if context.close_search(handle.0 as usize) => TRUE,
        _ => original(handle),
    }
}

unsafe extern "system" fn get_final_path_name_by_handle_w(
    handle: HANDLE,
    buffer: *mut u16,
    length: u32,
    flags: u32,
) -> u32 {
    let original: GetFinalPathNameByHandleWFn = match GET_FINAL_PATH_NAME_BY_HANDLE_W.original() {
        Some(original) => original,
        None => return 0,
    };
    let native = || original(handle, buffer, length, flags);
    dispatch(0, &native, |context| {
        let name = match context
            .tracked(handle.0 as usize)
            .and_then(|tracked| final_path_name(&tracked.key, flags))
        {
            Some(name) => name,
            None => return native(),
        };
        let units = name.encode_utf16().count();
        if buffer.is_null() || (length as usize) <= units {
            // Required size, counting the terminator.
            return units as u32 + 1;
        }
        let buffer = std::slice::from_raw_parts_mut(buffer, length as usize);
        wide::copy_to(&name, buffer);
        units as u32
    })
}

/// Starts every child suspended, injects unless the executable is
/// blacklisted, then resumes it as the caller asked. An application name
/// inside a virtual directory is replaced by its real location.
unsafe extern "system" fn create_process_internal_w(
    token: HANDLE,
    application: PCWSTR,
    command_line: PWSTR,
    process_attributes: *const SECURITY_ATTRIBUTES,
    thread_attributes: *const SECURITY_ATTRIBUTES,
    inherit_handles: BOOL,
    creation_flags: u32,
    environment: *const c_void,
    current_directory: PCWSTR,
    startup_info: *const STARTUPINFOW,
    process_information: *mut PROCESS_INFORMATION,
    new_token: *mut HANDLE,
) -> BOOL {
    let original: CreateProcessInternalWFn = match CREATE_PROCESS_INTERNAL_W.original() {
        Some(original) => original,
        None => return FALSE,
    };
    let create = |application, flags| {
        original(
            token,
            application,
            command_line,
            process_attributes,
            thread_attributes,
            inherit_handles,
            flags,
            environment,
            current_directory,
            startup_info,
            process_information,
            new_token,
        )
    };
    dispatch(
        FALSE,
        || create(application, creation_flags),
        |context| {
            let executable = wide::from_ptr(application.0)
                .or_else(|| wide::from_ptr(command_line.0).map(|c| inject::first_argument(&c)))
                .unwrap_or_default();
            let redirected = win32_key(&executable).and_then(|key| {
                match context.router().resolve(&key, Operation::Open) {
                    Ok(Resolution::Redirect { real, .. }) => Some(wide_path(&real)),
                    _ => None,
                }
            });
            let application = redirected
                .as_ref()
                .map(|w| PCWSTR::from_raw(w.as_ptr()))
                .unwrap_or(application);

            let keep_suspended = creation_flags & CREATE_SUSPENDED.0 != 0;
            let created = create(application, creation_flags | CREATE_SUSPENDED.0);
            if !created.as_bool() || process_information.is_null() {
                return created;
            }

            let info = *process_information;
            let options = if context.is_blacklisted(&executable) {
                log::info!("{} is blacklisted, not hooking it", executable);
                None
            } else {
                match InjectOptions::for_current_module(context.parameters()) {
                    Ok(options) => Some(options),
                    Err(e) => {
                        log::error!("cannot hook {}: {}", executable, e);
                        None
                    }
                }
            };
            let instance = context.parameters().instance_name();
            let hook = options.as_ref().map(|options| (instance, options));
            if let Err(e) = inject::finish_launch(hook, &info, keep_suspended) {
                let _ = CloseHandle(info.hThread);
                let _ = CloseHandle(info.hProcess);
                *process_information = PROCESS_INFORMATION::default();
                return fail(&e, FALSE);
            }
            created
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_expressions() {
        assert_eq!(split_search("C:\\game\\data\\*.esp"), Some(("C:\\game\\data", "*.esp")));
        assert_eq!(split_search("C:\\*"), Some(("C:", "*")));
        assert_eq!(split_search("*.txt"), None);
        assert_eq!(split_search("\\*"), None);
    }

    #[test]
    fn dispositions() {
        assert!(matches!(open_operation(OPEN_EXISTING), Operation::Open));
        assert!(matches!(
            open_operation(CREATE_ALWAYS),
            Operation::Create {
                disposition: CreateDisposition::CreateAlways,
                directory: false
            }
        ));
    }

    #[test]
    fn final_names() {
        let key = VirtualPathKey::parse("C:\\game\\data\\a.esp").unwrap();
        assert_eq!(
            final_path_name(&key, VOLUME_NAME_DOS).as_deref(),
            Some("\\\\?\\C:\\game\\data\\a.esp")
        );
        assert_eq!(
            final_path_name(&key, VOLUME_NAME_NONE).as_deref(),
            Some("\\game\\data\\a.esp")
        );
        assert_eq!(final_path_name(&key, 0x2), None);
    }

    #[test]
    fn taken_names_fail_creates_with_file_exists() {
        let taken = VfsError::AlreadyExists("C:\\game\\data\\a.esp".into());
        assert_eq!(creation_error(&taken), ERROR_FILE_EXISTS);
        let missing = VfsError::PathNotFound("C:\\game\\nope\\a.esp".into());
        assert_eq!(creation_error(&missing), missing.win32_error());
    }

    #[test]
    fn search_levels_and_ops() {
        assert_eq!(
            search_options(FIND_EX_INFO_STANDARD, FIND_EX_SEARCH_NAME_MATCH),
            Some((true, false))
        );
        assert_eq!(
            search_options(FIND_EX_INFO_BASIC, FIND_EX_SEARCH_NAME_MATCH),
            Some((false, false))
        );
        assert_eq!(
            search_options(FIND_EX_INFO_BASIC, FIND_EX_SEARCH_LIMIT_TO_DIRECTORIES),
            Some((false, true))
        );
        // FindExSearchLimitToDevices
        assert_eq!(search_options(FIND_EX_INFO_STANDARD, 2), None);
        assert_eq!(search_options(2, FIND_EX_SEARCH_NAME_MATCH), None);
    }

    #[test]
    fn attribute_data_layout() {
        assert_eq!(std::mem::size_of::<FileAttributeData>(), 36);
    }
}
