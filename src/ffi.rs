//! C interface for coordinating processes.
//!
//! Parameter objects are heap values owned by the caller. The virtual file
//! system itself is a process-global singleton created by
//! [`usvfs_create_vfs`] and dropped by [`usvfs_disconnect_vfs`]. Every
//! function reports failure by returning `false` and logging the reason.

use std::os::raw::c_char;

use parking_lot::Mutex;

use crate::{
    context,
    controller::VirtualFileSystem,
    error::Result,
    logging,
    parameters::{CrashDumpsType, LogLevel, Parameters},
    tree::LinkFlags,
    wide,
};

lazy_static::lazy_static! {
    static ref VFS: Mutex<Option<VirtualFileSystem>> = Mutex::new(None);
}

const RELOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

fn with_vfs(what: &str, f: impl FnOnce(&mut VirtualFileSystem) -> Result<()>) -> bool {
    let mut vfs = VFS.lock();
    let vfs = match vfs.as_mut() {
        Some(vfs) => vfs,
        None => {
            log::error!("{}: no virtual file system was created", what);
            return false;
        }
    };
    report(what, f(vfs))
}

fn report(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::error!("{} failed: {}", what, e);
            false
        }
    }
}

unsafe fn parameters<'a>(ptr: *mut Parameters) -> Option<&'a mut Parameters> {
    ptr.as_mut()
}

#[no_mangle]
pub extern "C" fn usvfs_create_parameters() -> *mut Parameters {
    Box::into_raw(Box::new(Parameters::new()))
}

/// # Safety
///
/// `source` must come from [`usvfs_create_parameters`] or
/// [`usvfs_dupe_parameters`] and not yet be freed.
#[no_mangle]
pub unsafe extern "C" fn usvfs_dupe_parameters(source: *const Parameters) -> *mut Parameters {
    match source.as_ref() {
        Some(source) => Box::into_raw(Box::new(source.clone())),
        None => std::ptr::null_mut(),
    }
}

/// # Safety
///
/// Both pointers must be live parameter objects.
#[no_mangle]
pub unsafe extern "C" fn usvfs_copy_parameters(source: *const Parameters, dest: *mut Parameters) {
    if let (Some(source), Some(dest)) = (source.as_ref(), dest.as_mut()) {
        dest.copy_from(source);
    }
}

/// # Safety
///
/// `p` must be a live parameter object or null; it is invalid afterwards.
#[no_mangle]
pub unsafe extern "C" fn usvfs_free_parameters(p: *mut Parameters) {
    if !p.is_null() {
        drop(Box::from_raw(p));
    }
}

/// # Safety
///
/// `p` must be a live parameter object, `name` a NUL-terminated UTF-8
/// string.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_instance_name(p: *mut Parameters, name: *const c_char) {
    if let (Some(p), Some(name)) = (parameters(p), wide::from_c_str(name)) {
        p.set_instance_name(&name);
    }
}

/// # Safety
///
/// `p` must be a live parameter object.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_debug_mode(p: *mut Parameters, debug_mode: bool) {
    if let Some(p) = parameters(p) {
        p.set_debug_mode(debug_mode);
    }
}

/// # Safety
///
/// `p` must be a live parameter object.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_log_level(p: *mut Parameters, level: u8) {
    match (parameters(p), LogLevel::from_raw(level)) {
        (Some(p), Some(level)) => p.set_log_level(level),
        (_, None) => log::warn!("ignoring unknown log level {}", level),
        _ => {}
    }
}

/// # Safety
///
/// `p` must be a live parameter object.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_crash_dumps_type(p: *mut Parameters, dump_type: u8) {
    match (parameters(p), CrashDumpsType::from_raw(dump_type)) {
        (Some(p), Some(dump_type)) => p.set_crash_dumps_type(dump_type),
        (_, None) => log::warn!("ignoring unknown crash dump type {}", dump_type),
        _ => {}
    }
}

/// # Safety
///
/// `p` must be a live parameter object, `path` a NUL-terminated UTF-8
/// string.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_crash_dumps_path(p: *mut Parameters, path: *const c_char) {
    if let (Some(p), Some(path)) = (parameters(p), wide::from_c_str(path)) {
        p.set_crash_dumps_path(&path);
    }
}

/// # Safety
///
/// `p` must be a live parameter object.
#[no_mangle]
pub unsafe extern "C" fn usvfs_set_process_delay(p: *mut Parameters, milliseconds: i32) {
    if let Some(p) = parameters(p) {
        p.set_process_delay(milliseconds);
    }
}

#[no_mangle]
pub extern "C" fn usvfs_log_level_to_string(level: u8) -> *const c_char {
    let name: &'static [u8] = match LogLevel::from_raw(level) {
        Some(LogLevel::Debug) => b"debug\0",
        Some(LogLevel::Info) => b"info\0",
        Some(LogLevel::Warning) => b"warning\0",
        Some(LogLevel::Error) => b"error\0",
        None => b"unknown\0",
    };
    name.as_ptr().cast()
}

#[no_mangle]
pub extern "C" fn usvfs_crash_dumps_type_to_string(dump_type: u8) -> *const c_char {
    let name: &'static [u8] = match CrashDumpsType::from_raw(dump_type) {
        Some(CrashDumpsType::None) => b"none\0",
        Some(CrashDumpsType::Mini) => b"mini\0",
        Some(CrashDumpsType::Data) => b"data\0",
        Some(CrashDumpsType::Full) => b"full\0",
        None => b"unknown\0",
    };
    name.as_ptr().cast()
}

/// Creates the process-wide virtual file system and publishes its (empty)
/// configuration. An existing one is replaced.
///
/// # Safety
///
/// `p` must be a live parameter object.
#[no_mangle]
pub unsafe extern "C" fn usvfs_create_vfs(p: *const Parameters) -> bool {
    let p = match p.as_ref() {
        Some(p) => p,
        None => return false,
    };
    let mut vfs = VFS.lock();
    // Withdraw the old instance first so a same-named one can be created.
    vfs.take();
    match VirtualFileSystem::create(p) {
        Ok(created) => {
            *vfs = Some(created);
            true
        }
        Err(e) => {
            log::error!("failed to create virtual file system: {}", e);
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn usvfs_disconnect_vfs() {
    if VFS.lock().take().is_some() {
        log::info!("virtual file system disconnected");
    }
}

#[no_mangle]
pub extern "C" fn usvfs_clear_virtual_mappings() -> bool {
    with_vfs("clear mappings", |vfs| vfs.clear_mappings())
}

/// Re-reads the published configuration inside a hooked process.
#[no_mangle]
pub extern "C" fn usvfs_reload_mappings() -> bool {
    match context::current() {
        Some(context) => report("reload mappings", context.reload(RELOAD_TIMEOUT)),
        None => false,
    }
}

/// # Safety
///
/// Both paths must be NUL-terminated UTF-16 strings.
#[no_mangle]
pub unsafe extern "C" fn usvfs_virtual_link_file(
    source: *const u16,
    destination: *const u16,
    flags: u32,
) -> bool {
    let (source, destination) = match (wide::from_ptr(source), wide::from_ptr(destination)) {
        (Some(s), Some(d)) => (s, d),
        _ => return false,
    };
    with_vfs("link file", |vfs| {
        vfs.link_file(&source, &destination, LinkFlags::from_bits_truncate(flags))
    })
}

/// # Safety
///
/// Both paths must be NUL-terminated UTF-16 strings.
#[no_mangle]
pub unsafe extern "C" fn usvfs_virtual_link_directory_static(
    source: *const u16,
    destination: *const u16,
    flags: u32,
) -> bool {
    let (source, destination) = match (wide::from_ptr(source), wide::from_ptr(destination)) {
        (Some(s), Some(d)) => (s, d),
        _ => return false,
    };
    with_vfs("link directory", |vfs| {
        vfs.link_directory(&source, &destination, LinkFlags::from_bits_truncate(flags))
    })
}

/// # Safety
///
/// `suffix` must be a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn usvfs_add_skip_file_suffix(suffix: *const u16) -> bool {
    match wide::from_ptr(suffix) {
        Some(suffix) => with_vfs("add skip suffix", |vfs| vfs.add_skip_file_suffix(&suffix)),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn usvfs_clear_skip_file_suffixes() -> bool {
    with_vfs("clear skip suffixes", |vfs| vfs.clear_skip_file_suffixes())
}

/// # Safety
///
/// `directory` must be a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn usvfs_add_skip_directory(directory: *const u16) -> bool {
    match wide::from_ptr(directory) {
        Some(directory) => with_vfs("add skip directory", |vfs| vfs.add_skip_directory(&directory)),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn usvfs_clear_skip_directories() -> bool {
    with_vfs("clear skip directories", |vfs| vfs.clear_skip_directories())
}

/// # Safety
///
/// `executable` must be a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn usvfs_blacklist_executable(executable: *const u16) -> bool {
    match wide::from_ptr(executable) {
        Some(executable) => with_vfs("blacklist executable", |vfs| {
            vfs.blacklist_executable(&executable)
        }),
        None => false,
    }
}

#[no_mangle]
pub extern "C" fn usvfs_clear_executable_blacklist() -> bool {
    with_vfs("clear blacklist", |vfs| vfs.clear_executable_blacklist())
}

#[no_mangle]
pub extern "C" fn usvfs_init_logging(to_console: bool) {
    logging::init_logging(to_console);
}

/// Copies the oldest captured log message into `buffer` (UTF-8, NUL
/// terminated, cut to fit). Returns false when there is none.
///
/// # Safety
///
/// `buffer` must be writable for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn usvfs_get_log_messages(
    buffer: *mut c_char,
    size: usize,
    blocking: bool,
) -> bool {
    if buffer.is_null() || size == 0 {
        return false;
    }
    let message = match logging::get_log_messages(blocking) {
        Some(message) => message,
        None => return false,
    };
    let buffer = std::slice::from_raw_parts_mut(buffer as *mut u8, size);
    let len = truncate_utf8(&message, size - 1);
    buffer[..len].copy_from_slice(&message.as_bytes()[..len]);
    buffer[len] = 0;
    true
}

/// Largest prefix of `s` no longer than `max` bytes that ends on a char
/// boundary.
fn truncate_utf8(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

#[cfg(windows)]
pub use self::process::*;

#[cfg(windows)]
mod process {
    use std::ffi::c_void;

    use windows::{
        core::{PCWSTR, PWSTR},
        Win32::{
            Foundation::{SetLastError, BOOL, WIN32_ERROR},
            Security::SECURITY_ATTRIBUTES,
            System::Threading::{PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTUPINFOW},
        },
    };

    use super::VFS;
    use crate::{
        inject::{self, CreateProcessArgs, InjectOptions},
        wide,
    };

    /// `CreateProcessW` that also installs the hooks of the current virtual
    /// file system into the new process.
    ///
    /// # Safety
    ///
    /// Same contract as `CreateProcessW`.
    #[no_mangle]
    pub unsafe extern "C" fn usvfs_create_process_hooked(
        application_name: *const u16,
        command_line: *mut u16,
        process_attributes: *const SECURITY_ATTRIBUTES,
        thread_attributes: *const SECURITY_ATTRIBUTES,
        inherit_handles: BOOL,
        creation_flags: u32,
        environment: *const c_void,
        current_directory: *const u16,
        startup_info: *const STARTUPINFOW,
        process_information: *mut PROCESS_INFORMATION,
    ) -> BOOL {
        let vfs = VFS.lock();
        let vfs = match vfs.as_ref() {
            Some(vfs) => vfs,
            None => {
                log::error!("create process: no virtual file system was created");
                SetLastError(WIN32_ERROR(crate::status::ERROR_INVALID_HANDLE));
                return BOOL(0);
            }
        };
        let executable = wide::from_ptr(application_name)
            .or_else(|| wide::from_ptr(command_line).map(|c| inject::first_argument(&c)))
            .unwrap_or_default();
        let options = match InjectOptions::for_current_module(vfs.parameters()) {
            Ok(options) => options,
            Err(e) => {
                log::error!("create process: {}", e);
                SetLastError(WIN32_ERROR(e.win32_error()));
                return BOOL(0);
            }
        };
        let hook = match vfs.is_blacklisted(&executable) {
            true => {
                log::info!("{} is blacklisted, starting it unhooked", executable);
                None
            }
            false => Some((vfs.parameters().instance_name(), &options)),
        };
        let args = CreateProcessArgs {
            application_name: PCWSTR::from_raw(application_name),
            command_line: PWSTR::from_raw(command_line),
            process_attributes: (!process_attributes.is_null()).then_some(process_attributes),
            thread_attributes: (!thread_attributes.is_null()).then_some(thread_attributes),
            inherit_handles,
            creation_flags: PROCESS_CREATION_FLAGS(creation_flags),
            environment: (!environment.is_null()).then_some(environment),
            current_directory: PCWSTR::from_raw(current_directory),
            startup_info,
            process_information,
        };
        match inject::create_process(hook, &args) {
            Ok(()) => BOOL(1),
            Err(e) => {
                log::error!("create process {:?} failed: {}", executable, e);
                SetLastError(WIN32_ERROR(e.win32_error()));
                BOOL(0)
            }
        }
    }

    /// Installs the hooks of the current virtual file system into the
    /// running process `pid`.
    #[no_mangle]
    pub extern "C" fn usvfs_inject_process(pid: u32) -> bool {
        let vfs = VFS.lock();
        let vfs = match vfs.as_ref() {
            Some(vfs) => vfs,
            None => {
                log::error!("inject {}: no virtual file system was created", pid);
                return false;
            }
        };
        let result = InjectOptions::for_current_module(vfs.parameters())
            .and_then(|options| vfs.hook_running(pid, &options));
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("inject {} failed: {}", pid, e);
                unsafe { SetLastError(WIN32_ERROR(e.win32_error())) };
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    #[test]
    fn parameter_objects() {
        let p = usvfs_create_parameters();
        let name = std::ffi::CString::new("ffi_params").unwrap();
        unsafe {
            usvfs_set_instance_name(p, name.as_ptr());
            usvfs_set_log_level(p, 2);
            usvfs_set_crash_dumps_type(p, 7);
            usvfs_set_process_delay(p, 100);

            let dupe = usvfs_dupe_parameters(p);
            assert_eq!(*dupe, *p);
            assert_eq!((*dupe).log_level(), LogLevel::Warning);
            assert_eq!((*dupe).crash_dumps_type(), CrashDumpsType::None);

            let copy = usvfs_create_parameters();
            usvfs_copy_parameters(p, copy);
            assert_eq!((*copy).instance_name(), "ffi_params");

            usvfs_free_parameters(copy);
            usvfs_free_parameters(dupe);
            usvfs_free_parameters(p);
            usvfs_free_parameters(std::ptr::null_mut());
        }
    }

    #[test]
    fn enum_names() {
        let level = unsafe { CStr::from_ptr(usvfs_log_level_to_string(1)) };
        assert_eq!(level.to_str().unwrap(), "info");
        let dump = unsafe { CStr::from_ptr(usvfs_crash_dumps_type_to_string(3)) };
        assert_eq!(dump.to_str().unwrap(), "full");
        let unknown = unsafe { CStr::from_ptr(usvfs_crash_dumps_type_to_string(42)) };
        assert_eq!(unknown.to_str().unwrap(), "unknown");
    }

    #[test]
    fn utf8_truncation_keeps_char_boundaries() {
        assert_eq!(truncate_utf8("abc", 10), 3);
        assert_eq!(truncate_utf8("aä", 2), 1);
        assert_eq!(truncate_utf8("aä", 3), 3);
    }

    #[test]
    fn vfs_lifecycle() {
        let p = usvfs_create_parameters();
        let name = std::ffi::CString::new(format!(
            "ffi_{}",
            uuid::Uuid::new_v4().simple()
        ))
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let real = wide::to_wide(&dir.path().join("mod").to_string_lossy());
        let virt = wide::to_wide(&dir.path().join("data").to_string_lossy());
        unsafe {
            usvfs_set_instance_name(p, name.as_ptr());
            assert!(usvfs_create_vfs(p));
            assert!(usvfs_virtual_link_directory_static(
                real.as_ptr(),
                virt.as_ptr(),
                LinkFlags::RECURSIVE.bits()
            ));
            let suffix = wide::to_wide(".skip");
            assert!(usvfs_add_skip_file_suffix(suffix.as_ptr()));
            assert_eq!(
                VFS.lock().as_ref().unwrap().snapshot().links.len(),
                1
            );
            assert!(usvfs_clear_virtual_mappings());
            usvfs_disconnect_vfs();
            assert!(!usvfs_clear_virtual_mappings());
            usvfs_free_parameters(p);
        }
    }

    #[test]
    fn log_messages_need_a_buffer() {
        assert!(!unsafe { usvfs_get_log_messages(std::ptr::null_mut(), 16, false) });
        let mut buffer = [0 as c_char; 4];
        assert!(!unsafe { usvfs_get_log_messages(buffer.as_mut_ptr(), 0, false) });
    }
}
