//! `ntdll` entry points. Everything above them funnels through these, so
//! they are the layer that catches callers bypassing the Win32 API.

use std::{ffi::c_void, path::Path, ptr, slice};

use windows::Win32::{
    Foundation::HANDLE,
    Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED},
    System::Threading::SetEvent,
};

use super::{create_parent_dirs, dispatch, HookSlot, HookSpec, NTDLL};
use crate::{
    context::{HookContext, TrackedHandle},
    cursor::ScanFlags,
    error::VfsError,
    host::EntryInfo,
    path::VirtualPathKey,
    records::{self, InfoClass},
    router::{CreateDisposition, Operation, Resolution},
    status::{NtStatus, STATUS_INTERNAL_ERROR, STATUS_SUCCESS},
    wide,
};

type RawHandle = *mut c_void;

#[repr(C)]
pub(super) struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: *mut u16,
}

impl UnicodeString {
    fn new(buffer: &mut [u16]) -> UnicodeString {
        let bytes = (buffer.len() * 2).min(u16::MAX as usize & !1) as u16;
        UnicodeString {
            length: bytes,
            maximum_length: bytes,
            buffer: buffer.as_mut_ptr(),
        }
    }

    unsafe fn to_string_lossy(&self) -> Option<String> {
        wide::from_counted(self.buffer, self.length as usize)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(super) struct ObjectAttributes {
    length: u32,
    root_directory: RawHandle,
    object_name: *mut UnicodeString,
    attributes: u32,
    security_descriptor: *mut c_void,
    security_quality_of_service: *mut c_void,
}

#[repr(C)]
union IoStatus {
    status: NtStatus,
    pointer: *mut c_void,
}

#[repr(C)]
pub(super) struct IoStatusBlock {
    u: IoStatus,
    information: usize,
}

impl IoStatusBlock {
    fn set(&mut self, status: NtStatus, information: usize) {
        self.u = IoStatus { status };
        self.information = information;
    }
}

#[repr(C)]
pub(super) struct FileBasicInformation {
    creation_time: u64,
    last_access_time: u64,
    last_write_time: u64,
    change_time: u64,
    file_attributes: u32,
}

impl From<&EntryInfo> for FileBasicInformation {
    fn from(info: &EntryInfo) -> Self {
        FileBasicInformation {
            creation_time: info.creation_time,
            last_access_time: info.last_access_time,
            last_write_time: info.last_write_time,
            change_time: info.change_time,
            file_attributes: info.attributes,
        }
    }
}

#[repr(C)]
pub(super) struct FileNetworkOpenInformation {
    creation_time: u64,
    last_access_time: u64,
    last_write_time: u64,
    change_time: u64,
    allocation_size: u64,
    end_of_file: u64,
    file_attributes: u32,
}

impl From<&EntryInfo> for FileNetworkOpenInformation {
    fn from(info: &EntryInfo) -> Self {
        FileNetworkOpenInformation {
            creation_time: info.creation_time,
            last_access_time: info.last_access_time,
            last_write_time: info.last_write_time,
            change_time: info.change_time,
            allocation_size: info.allocation_size,
            end_of_file: info.size,
            file_attributes: info.attributes,
        }
    }
}

const FILE_SUPERSEDE: u32 = 0;
const FILE_OPEN: u32 = 1;
const FILE_CREATE: u32 = 2;
const FILE_OPEN_IF: u32 = 3;
const FILE_OVERWRITE: u32 = 4;
const FILE_OVERWRITE_IF: u32 = 5;

const FILE_DIRECTORY_FILE: u32 = 0x0000_0001;

const FILE_NAME_INFORMATION: u32 = 9;
const FILE_NORMALIZED_NAME_INFORMATION: u32 = 48;

type NtCreateFileFn = unsafe extern "system" fn(
    *mut RawHandle,
    u32,
    *mut ObjectAttributes,
    *mut IoStatusBlock,
    *mut i64,
    u32,
    u32,
    u32,
    u32,
    *mut c_void,
    u32,
) -> NtStatus;
type NtOpenFileFn = unsafe extern "system" fn(
    *mut RawHandle,
    u32,
    *mut ObjectAttributes,
    *mut IoStatusBlock,
    u32,
    u32,
) -> NtStatus;
type NtQueryDirectoryFileFn = unsafe extern "system" fn(
    RawHandle,
    RawHandle,
    *mut c_void,
    *mut c_void,
    *mut IoStatusBlock,
    *mut c_void,
    u32,
    u32,
    u8,
    *mut UnicodeString,
    u8,
) -> NtStatus;
type NtQueryDirectoryFileExFn = unsafe extern "system" fn(
    RawHandle,
    RawHandle,
    *mut c_void,
    *mut c_void,
    *mut IoStatusBlock,
    *mut c_void,
    u32,
    u32,
    u32,
    *mut UnicodeString,
) -> NtStatus;
type NtQueryAttributesFileFn =
    unsafe extern "system" fn(*mut ObjectAttributes, *mut FileBasicInformation) -> NtStatus;
type NtQueryFullAttributesFileFn =
    unsafe extern "system" fn(*mut ObjectAttributes, *mut FileNetworkOpenInformation) -> NtStatus;
type NtQueryInformationFileFn =
    unsafe extern "system" fn(RawHandle, *mut IoStatusBlock, *mut c_void, u32, u32) -> NtStatus;
type NtCloseFn = unsafe extern "system" fn(RawHandle) -> NtStatus;

static NT_CREATE_FILE: HookSlot = HookSlot::new("NtCreateFile");
static NT_OPEN_FILE: HookSlot = HookSlot::new("NtOpenFile");
static NT_QUERY_DIRECTORY_FILE: HookSlot = HookSlot::new("NtQueryDirectoryFile");
static NT_QUERY_DIRECTORY_FILE_EX: HookSlot = HookSlot::new("NtQueryDirectoryFileEx");
static NT_QUERY_ATTRIBUTES_FILE: HookSlot = HookSlot::new("NtQueryAttributesFile");
static NT_QUERY_FULL_ATTRIBUTES_FILE: HookSlot = HookSlot::new("NtQueryFullAttributesFile");
static NT_QUERY_INFORMATION_FILE: HookSlot = HookSlot::new("NtQueryInformationFile");
static NT_CLOSE: HookSlot = HookSlot::new("NtClose");

pub(super) fn hooks() -> Vec<HookSpec> {
    vec![
        HookSpec::new(&NT_CREATE_FILE, NTDLL, nt_create_file as *const ()),
        HookSpec::new(&NT_OPEN_FILE, NTDLL, nt_open_file as *const ()),
        HookSpec::new(
            &NT_QUERY_DIRECTORY_FILE,
            NTDLL,
            nt_query_directory_file as *const (),
        ),
        HookSpec::new(
            &NT_QUERY_DIRECTORY_FILE_EX,
            NTDLL,
            nt_query_directory_file_ex as *const (),
        ),
        HookSpec::new(
            &NT_QUERY_ATTRIBUTES_FILE,
            NTDLL,
            nt_query_attributes_file as *const (),
        ),
        HookSpec::new(
            &NT_QUERY_FULL_ATTRIBUTES_FILE,
            NTDLL,
            nt_query_full_attributes_file as *const (),
        ),
        HookSpec::new(
            &NT_QUERY_INFORMATION_FILE,
            NTDLL,
            nt_query_information_file as *const (),
        ),
        HookSpec::new(&NT_CLOSE, NTDLL, nt_close as *const ()),
    ]
}

fn open_operation(disposition: u32, options: u32) -> Operation<'static> {
    let disposition = match disposition {
        FILE_OPEN => return Operation::Open,
        FILE_CREATE => CreateDisposition::CreateNew,
        FILE_OPEN_IF => CreateDisposition::OpenAlways,
        FILE_OVERWRITE => CreateDisposition::TruncateExisting,
        FILE_SUPERSEDE | FILE_OVERWRITE_IF => CreateDisposition::CreateAlways,
        other => {
            log::debug!("unknown create disposition {}", other);
            CreateDisposition::CreateAlways
        }
    };
    Operation::Create {
        disposition,
        directory: options & FILE_DIRECTORY_FILE != 0,
    }
}

/// The `\??\` form of a host path.
fn nt_path(real: &Path) -> String {
    match VirtualPathKey::from_path(real) {
        Ok(key) => format!("\\??\\{}", &key.to_verbatim()[4..]),
        Err(_) => real.to_string_lossy().into_owned(),
    }
}

unsafe fn handle_path(handle: RawHandle) -> Option<String> {
    let mut buffer = vec![0u16; 1024];
    loop {
        let len = GetFinalPathNameByHandleW(HANDLE(handle as _), &mut buffer, FILE_NAME_NORMALIZED)
            as usize;
        match len {
            0 => return None,
            len if len < buffer.len() => {
                return Some(String::from_utf16_lossy(&buffer[..len]));
            }
            len => buffer.resize(len + 1, 0),
        }
    }
}

/// The virtual path `attributes` names. The flag is set when the name was
/// relative to a tracked handle, whose real location may differ from its
/// virtual one.
unsafe fn requested_key(
    context: &HookContext,
    attributes: *const ObjectAttributes,
) -> Option<(VirtualPathKey, bool)> {
    let attributes = attributes.as_ref()?;
    let name = attributes.object_name.as_ref()?.to_string_lossy()?;
    if attributes.root_directory.is_null() {
        return VirtualPathKey::parse(&name).ok().map(|key| (key, false));
    }
    let (base, tracked) = match context.tracked(attributes.root_directory as usize) {
        Some(tracked) => (tracked.key.clone(), true),
        None => (VirtualPathKey::parse(&handle_path(attributes.root_directory)?).ok()?, false),
    };
    if name.is_empty() {
        return Some((base, tracked));
    }
    base.join(&name).ok().map(|key| (key, tracked))
}

/// Calls `open` with a copy of `template` naming `path` absolutely.
unsafe fn with_object_name<R>(
    template: *const ObjectAttributes,
    path: &Path,
    open: impl FnOnce(*mut ObjectAttributes) -> R,
) -> R {
    let mut buffer: Vec<u16> = nt_path(path).encode_utf16().collect();
    let mut name = UnicodeString::new(&mut buffer);
    let mut attributes = ptr::read(template);
    attributes.root_directory = ptr::null_mut();
    attributes.object_name = &mut name;
    open(&mut attributes)
}

unsafe fn fail(io_status: *mut IoStatusBlock, err: &VfsError) -> NtStatus {
    let status = err.nt_status();
    if let Some(io) = io_status.as_mut() {
        io.set(status, 0);
    }
    status
}

/// Routes an open or create and tracks the resulting handle when its path
/// is virtualized.
#[allow(clippy::too_many_arguments)]
unsafe fn routed_open(
    context: &HookContext,
    file_handle: *mut RawHandle,
    attributes: *mut ObjectAttributes,
    io_status: *mut IoStatusBlock,
    op: Operation<'_>,
    directory: bool,
    open: impl Fn(*mut ObjectAttributes) -> NtStatus,
) -> NtStatus {
    let (key, relative_to_tracked) = match requested_key(context, attributes) {
        Some(requested) => requested,
        None => return open(attributes),
    };
    let router = context.router();
    let (status, real, is_dir) = match router.resolve(&key, op) {
        Ok(Resolution::Passthrough) if relative_to_tracked => {
            let real = key.to_path_buf();
            (with_object_name(attributes, &real, &open), real, directory)
        }
        Ok(Resolution::Passthrough) => (open(attributes), key.to_path_buf(), directory),
        Ok(Resolution::Redirect { real, create_dirs }) => {
            if create_dirs {
                if let Err(e) = create_parent_dirs(&real) {
                    return fail(io_status, &e);
                }
            }
            (with_object_name(attributes, &real, &open), real, directory)
        }
        Ok(Resolution::Synthetic { anchor, .. }) => {
            (with_object_name(attributes, &anchor, &open), anchor, true)
        }
        Ok(other) => {
            log::warn!("unexpected {:?} for an open of {}", other, key);
            (open(attributes), key.to_path_buf(), directory)
        }
        Err(e) => return fail(io_status, &e),
    };

    if status.is_success() && !file_handle.is_null() {
        if matches!(op, Operation::Create { .. }) {
            router.materialized(&key);
        }
        if router.is_virtualized(&key) {
            let is_dir = is_dir || router.host().is_dir(&real);
            context.track(*file_handle as usize, TrackedHandle::new(key, real, is_dir));
        }
    }
    status
}

unsafe extern "system" fn nt_create_file(
    file_handle: *mut RawHandle,
    desired_access: u32,
    attributes: *mut ObjectAttributes,
    io_status: *mut IoStatusBlock,
    allocation_size: *mut i64,
    file_attributes: u32,
    share_access: u32,
    disposition: u32,
    options: u32,
    ea_buffer: *mut c_void,
    ea_length: u32,
) -> NtStatus {
    let original: NtCreateFileFn = match NT_CREATE_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let open = |attributes| {
        original(
            file_handle,
            desired_access,
            attributes,
            io_status,
            allocation_size,
            file_attributes,
            share_access,
            disposition,
            options,
            ea_buffer,
            ea_length,
        )
    };
    dispatch(
        STATUS_INTERNAL_ERROR,
        || open(attributes),
        |context| {
            routed_open(
                context,
                file_handle,
                attributes,
                io_status,
                open_operation(disposition, options),
                options & FILE_DIRECTORY_FILE != 0,
                &open,
            )
        },
    )
}

unsafe extern "system" fn nt_open_file(
    file_handle: *mut RawHandle,
    desired_access: u32,
    attributes: *mut ObjectAttributes,
    io_status: *mut IoStatusBlock,
    share_access: u32,
    options: u32,
) -> NtStatus {
    let original: NtOpenFileFn = match NT_OPEN_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let open = |attributes| {
        original(
            file_handle,
            desired_access,
            attributes,
            io_status,
            share_access,
            options,
        )
    };
    dispatch(
        STATUS_INTERNAL_ERROR,
        || open(attributes),
        |context| {
            routed_open(
                context,
                file_handle,
                attributes,
                io_status,
                Operation::Open,
                options & FILE_DIRECTORY_FILE != 0,
                &open,
            )
        },
    )
}

unsafe fn complete(
    io_status: *mut IoStatusBlock,
    event: RawHandle,
    status: NtStatus,
    information: usize,
) -> NtStatus {
    if let Some(io) = io_status.as_mut() {
        io.set(status, information);
    }
    if !event.is_null() {
        let _ = SetEvent(HANDLE(event as _));
    }
    status
}

/// Serves a directory query from the handle's merged listing. `None` means
/// the handle is not ours to answer.
#[allow(clippy::too_many_arguments)]
unsafe fn query_directory(
    context: &HookContext,
    handle: RawHandle,
    event: RawHandle,
    io_status: *mut IoStatusBlock,
    buffer: *mut c_void,
    length: u32,
    class: u32,
    flags: ScanFlags,
    file_name: *const UnicodeString,
) -> Option<NtStatus> {
    let tracked = context.tracked(handle as usize)?;
    if !tracked.is_dir {
        return None;
    }
    let class = match InfoClass::from_raw(class) {
        Some(class) => class,
        None => {
            log::debug!("class {} on {} left to the host", class, tracked.key);
            return None;
        }
    };
    let pattern = file_name
        .as_ref()
        .and_then(|name| name.to_string_lossy())
        .filter(|pattern| !pattern.is_empty());
    let buffer: &mut [u8] = if buffer.is_null() {
        &mut []
    } else {
        slice::from_raw_parts_mut(buffer as *mut u8, length as usize)
    };

    let router = context.router();
    match tracked.with_cursor(&router, |cursor| {
        cursor.query(buffer, class, flags, pattern.as_deref())
    }) {
        Ok(Some(result)) => Some(complete(io_status, event, result.status, result.bytes)),
        Ok(None) => None,
        Err(e) => Some(complete(io_status, event, e.nt_status(), 0)),
    }
}

unsafe extern "system" fn nt_query_directory_file(
    file_handle: RawHandle,
    event: RawHandle,
    apc_routine: *mut c_void,
    apc_context: *mut c_void,
    io_status: *mut IoStatusBlock,
    file_information: *mut c_void,
    length: u32,
    class: u32,
    return_single_entry: u8,
    file_name: *mut UnicodeString,
    restart_scan: u8,
) -> NtStatus {
    let original: NtQueryDirectoryFileFn = match NT_QUERY_DIRECTORY_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let native = || {
        original(
            file_handle,
            event,
            apc_routine,
            apc_context,
            io_status,
            file_information,
            length,
            class,
            return_single_entry,
            file_name,
            restart_scan,
        )
    };
    dispatch(STATUS_INTERNAL_ERROR, &native, |context| {
        let mut flags = ScanFlags::empty();
        if restart_scan != 0 {
            flags |= ScanFlags::RESTART_SCAN;
        }
        if return_single_entry != 0 {
            flags |= ScanFlags::RETURN_SINGLE_ENTRY;
        }
        query_directory(
            context,
            file_handle,
            event,
            io_status,
            file_information,
            length,
            class,
            flags,
            file_name,
        )
        .unwrap_or_else(&native)
    })
}

unsafe extern "system" fn nt_query_directory_file_ex(
    file_handle: RawHandle,
    event: RawHandle,
    apc_routine: *mut c_void,
    apc_context: *mut c_void,
    io_status: *mut IoStatusBlock,
    file_information: *mut c_void,
    length: u32,
    class: u32,
    query_flags: u32,
    file_name: *mut UnicodeString,
) -> NtStatus {
    let original: NtQueryDirectoryFileExFn = match NT_QUERY_DIRECTORY_FILE_EX.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let native = || {
        original(
            file_handle,
            event,
            apc_routine,
            apc_context,
            io_status,
            file_information,
            length,
            class,
            query_flags,
            file_name,
        )
    };
    dispatch(STATUS_INTERNAL_ERROR, &native, |context| {
        query_directory(
            context,
            file_handle,
            event,
            io_status,
            file_information,
            length,
            class,
            ScanFlags::from_bits_truncate(query_flags),
            file_name,
        )
        .unwrap_or_else(&native)
    })
}

/// Shared body of the two attribute queries: redirect, or fill `out` from
/// `fill` for directories that only exist virtually.
unsafe fn query_attributes<T>(
    context: &HookContext,
    attributes: *mut ObjectAttributes,
    out: *mut T,
    fill: impl FnOnce(&EntryInfo) -> T,
    native: impl Fn(*mut ObjectAttributes) -> NtStatus,
) -> NtStatus {
    let (key, relative_to_tracked) = match requested_key(context, attributes) {
        Some(requested) => requested,
        None => return native(attributes),
    };
    match context.router().resolve(&key, Operation::QueryAttributes) {
        Ok(Resolution::Redirect { real, .. }) => with_object_name(attributes, &real, native),
        Ok(Resolution::Synthetic { info, .. }) => {
            if let Some(out) = out.as_mut() {
                *out = fill(&info);
            }
            STATUS_SUCCESS
        }
        Ok(_) if relative_to_tracked => with_object_name(attributes, &key.to_path_buf(), native),
        Ok(_) => native(attributes),
        Err(e) => e.nt_status(),
    }
}

unsafe extern "system" fn nt_query_attributes_file(
    attributes: *mut ObjectAttributes,
    information: *mut FileBasicInformation,
) -> NtStatus {
    let original: NtQueryAttributesFileFn = match NT_QUERY_ATTRIBUTES_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let native = |attributes| original(attributes, information);
    dispatch(
        STATUS_INTERNAL_ERROR,
        || native(attributes),
        |context| {
            query_attributes(
                context,
                attributes,
                information,
                FileBasicInformation::from,
                &native,
            )
        },
    )
}

unsafe extern "system" fn nt_query_full_attributes_file(
    attributes: *mut ObjectAttributes,
    information: *mut FileNetworkOpenInformation,
) -> NtStatus {
    let original: NtQueryFullAttributesFileFn = match NT_QUERY_FULL_ATTRIBUTES_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let native = |attributes| original(attributes, information);
    dispatch(
        STATUS_INTERNAL_ERROR,
        || native(attributes),
        |context| {
            query_attributes(
                context,
                attributes,
                information,
                FileNetworkOpenInformation::from,
                &native,
            )
        },
    )
}

/// Name queries on tracked handles report the virtual path.
unsafe extern "system" fn nt_query_information_file(
    file_handle: RawHandle,
    io_status: *mut IoStatusBlock,
    information: *mut c_void,
    length: u32,
    class: u32,
) -> NtStatus {
    let original: NtQueryInformationFileFn = match NT_QUERY_INFORMATION_FILE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    let native = || original(file_handle, io_status, information, length, class);
    if class != FILE_NAME_INFORMATION && class != FILE_NORMALIZED_NAME_INFORMATION {
        return native();
    }
    dispatch(STATUS_INTERNAL_ERROR, &native, |context| {
        let tracked = match context.tracked(file_handle as usize) {
            Some(tracked) if !information.is_null() => tracked,
            _ => return native(),
        };
        let buffer = slice::from_raw_parts_mut(information as *mut u8, length as usize);
        let (status, written) =
            records::write_file_name_information(buffer, &tracked.key.volume_relative());
        if let Some(io) = io_status.as_mut() {
            io.set(status, written);
        }
        status
    })
}

/// Closing drops the handle from the tracking table whether or not the
/// thread is inside the engine, since the value may be reused right away.
unsafe extern "system" fn nt_close(handle: RawHandle) -> NtStatus {
    let original: NtCloseFn = match NT_CLOSE.original() {
        Some(original) => original,
        None => return STATUS_INTERNAL_ERROR,
    };
    if let Some(context) = crate::context::current() {
        context.forget(handle as usize);
    }
    original(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions() {
        assert!(matches!(open_operation(FILE_OPEN, 0), Operation::Open));
        assert!(matches!(
            open_operation(FILE_CREATE, FILE_DIRECTORY_FILE),
            Operation::Create {
                disposition: CreateDisposition::CreateNew,
                directory: true
            }
        ));
        assert!(matches!(
            open_operation(FILE_SUPERSEDE, 0),
            Operation::Create {
                disposition: CreateDisposition::CreateAlways,
                directory: false
            }
        ));
        assert!(matches!(
            open_operation(FILE_OVERWRITE, 0),
            Operation::Create {
                disposition: CreateDisposition::TruncateExisting,
                ..
            }
        ));
    }

    #[test]
    fn nt_paths() {
        assert_eq!(nt_path(Path::new("C:\\mods\\a.txt")), "\\??\\C:\\mods\\a.txt");
        assert_eq!(
            nt_path(Path::new("\\\\srv\\share\\a")),
            "\\??\\UNC\\srv\\share\\a"
        );
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn record_layouts() {
        assert_eq!(std::mem::size_of::<ObjectAttributes>(), 48);
        assert_eq!(std::mem::size_of::<IoStatusBlock>(), 16);
        assert_eq!(std::mem::size_of::<FileBasicInformation>(), 40);
        assert_eq!(std::mem::size_of::<FileNetworkOpenInformation>(), 56);
    }
}
