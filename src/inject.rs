//! Starting processes with the hooks installed, or adding them to a running
//! process.
//!
//! Injection loads the hook module into the target with a remote
//! `LoadLibraryW` and then runs its exported [`INIT_EXPORT`] on a second
//! remote thread, passing the instance name. That function's exit code is
//! the verdict; a non-zero code means the target rolled its hooks back.

use std::{path::PathBuf, time::Duration};

use itertools::Itertools;

use crate::parameters::Parameters;

pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the activation entry point exported by the hook module.
pub const INIT_EXPORT: &str = "usvfs_init_hooks";

#[derive(Debug, Clone)]
pub struct InjectOptions {
    /// The hook module to load into targets.
    pub dll_path: PathBuf,
    /// How long each remote step may take. Must cover the process delay.
    pub init_timeout: Duration,
    /// Kill a freshly launched target when injection fails, instead of
    /// letting it run unvirtualized.
    pub terminate_on_failure: bool,
}

impl InjectOptions {
    pub fn new(dll_path: impl Into<PathBuf>) -> InjectOptions {
        InjectOptions {
            dll_path: dll_path.into(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            terminate_on_failure: false,
        }
    }

    /// Extends the timeout by the delay the target waits before activating.
    pub fn for_parameters(dll_path: impl Into<PathBuf>, parameters: &Parameters) -> InjectOptions {
        let mut options = InjectOptions::new(dll_path);
        options.init_timeout += parameters.process_delay();
        options
    }
}

/// Quotes one argument so `CommandLineToArgvW` gives it back unchanged.
pub fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c == ' ' || c == '\t' || c == '"') {
        return arg.to_owned();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

pub fn command_line(executable: &str, args: &[String]) -> String {
    std::iter::once(executable)
        .chain(args.iter().map(String::as_str))
        .map(quote_argument)
        .join(" ")
}

/// The program part of a command line.
pub fn first_argument(command_line: &str) -> String {
    let trimmed = command_line.trim_start();
    match trimmed.strip_prefix('"') {
        Some(rest) => rest.split('"').next().unwrap_or_default().to_owned(),
        None => trimmed
            .split(|c: char| c == ' ' || c == '\t')
            .next()
            .unwrap_or_default()
            .to_owned(),
    }
}

#[cfg(windows)]
pub use self::win::*;

#[cfg(windows)]
mod win {
    use std::{
        ffi::c_void,
        mem::size_of,
        path::{Path, PathBuf},
        time::Duration,
    };

    use windows::{
        core::{s, w, PCSTR, PCWSTR, PWSTR},
        Win32::{
            Foundation::{
                CloseHandle, FreeLibrary, BOOL, HANDLE, HMODULE, WAIT_OBJECT_0, WAIT_TIMEOUT,
            },
            Security::SECURITY_ATTRIBUTES,
            System::{
                Diagnostics::{
                    Debug::WriteProcessMemory,
                    ToolHelp::{
                        CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, MODULEENTRY32W,
                        TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
                    },
                },
                LibraryLoader::{
                    GetModuleFileNameW, GetModuleHandleExW, GetModuleHandleW, GetProcAddress,
                    LoadLibraryExW, DONT_RESOLVE_DLL_REFERENCES,
                    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                },
                Memory::{
                    VirtualAllocEx, VirtualFreeEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
                    PAGE_READWRITE,
                },
                Threading::{
                    CreateProcessW, CreateRemoteThread, GetCurrentProcess, GetExitCodeProcess,
                    GetExitCodeThread, GetProcessId, IsWow64Process, OpenProcess, ResumeThread,
                    TerminateProcess, WaitForSingleObject, CREATE_SUSPENDED, INFINITE,
                    LPTHREAD_START_ROUTINE, PROCESS_CREATE_THREAD, PROCESS_CREATION_FLAGS,
                    PROCESS_INFORMATION, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
                    PROCESS_VM_READ, PROCESS_VM_WRITE, STARTUPINFOW,
                },
            },
        },
    };

    use super::{command_line, InjectOptions, INIT_EXPORT};
    use crate::{
        error::{Result, VfsError},
        parameters::Parameters,
        path::fold_case,
        wide,
    };

    const ERROR_MOD_NOT_FOUND: u32 = 126;
    const ERROR_PROC_NOT_FOUND: u32 = 127;
    const ERROR_NOT_SUPPORTED: u32 = 50;

    fn failed(stage: &'static str, err: &windows::core::Error) -> VfsError {
        VfsError::Injection {
            stage,
            code: (err.code().0 & 0xFFFF) as u32,
        }
    }

    impl InjectOptions {
        /// Options that inject the module this code was loaded from.
        pub fn for_current_module(parameters: &Parameters) -> Result<InjectOptions> {
            Ok(InjectOptions::for_parameters(
                current_module_path()?,
                parameters,
            ))
        }
    }

    pub fn current_module_path() -> Result<PathBuf> {
        let mut module = HMODULE::default();
        unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(current_module_path as *const u16),
                &mut module,
            )
        }
        .map_err(|e| failed("locating the hook module", &e))?;
        let mut buffer = vec![0u16; 32_768];
        let len = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
        if len == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(PathBuf::from(String::from_utf16_lossy(&buffer[..len])))
    }

    /// A started process. Its handles are closed on drop.
    pub struct LaunchedProcess {
        info: PROCESS_INFORMATION,
    }

    unsafe impl Send for LaunchedProcess {}

    impl LaunchedProcess {
        pub fn pid(&self) -> u32 {
            self.info.dwProcessId
        }

        pub fn tid(&self) -> u32 {
            self.info.dwThreadId
        }

        pub fn process_handle(&self) -> HANDLE {
            self.info.hProcess
        }

        /// Waits for the process to exit and returns its exit code, or
        /// `None` if `timeout` passed first.
        pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<u32>> {
            let millis = timeout
                .map(|t| t.as_millis().min(u32::MAX as u128 - 1) as u32)
                .unwrap_or(INFINITE);
            if unsafe { WaitForSingleObject(self.info.hProcess, millis) } == WAIT_TIMEOUT {
                return Ok(None);
            }
            let mut code = 0u32;
            unsafe { GetExitCodeProcess(self.info.hProcess, &mut code) }
                .map_err(|e| std::io::Error::from_raw_os_error(e.code().0 & 0xFFFF))?;
            Ok(Some(code))
        }
    }

    impl Drop for LaunchedProcess {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.info.hThread);
                let _ = CloseHandle(self.info.hProcess);
            }
        }
    }

    /// The arguments of `CreateProcessW`.
    pub struct CreateProcessArgs {
        pub application_name: PCWSTR,
        pub command_line: PWSTR,
        pub process_attributes: Option<*const SECURITY_ATTRIBUTES>,
        pub thread_attributes: Option<*const SECURITY_ATTRIBUTES>,
        pub inherit_handles: BOOL,
        pub creation_flags: PROCESS_CREATION_FLAGS,
        pub environment: Option<*const c_void>,
        pub current_directory: PCWSTR,
        pub startup_info: *const STARTUPINFOW,
        pub process_information: *mut PROCESS_INFORMATION,
    }

    /// `CreateProcessW`, with the hooks of `hook`'s instance installed
    /// before the process runs any of its own code.
    ///
    /// # Safety
    ///
    /// The pointers in `args` follow the `CreateProcessW` contract.
    pub unsafe fn create_process(
        hook: Option<(&str, &InjectOptions)>,
        args: &CreateProcessArgs,
    ) -> Result<()> {
        let keep_suspended = args.creation_flags.0 & CREATE_SUSPENDED.0 != 0;
        CreateProcessW(
            args.application_name,
            args.command_line,
            args.process_attributes,
            args.thread_attributes,
            args.inherit_handles,
            args.creation_flags | CREATE_SUSPENDED,
            args.environment,
            args.current_directory,
            args.startup_info,
            args.process_information,
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e.code().0 & 0xFFFF))?;

        let info = *args.process_information;
        if let Err(e) = finish_launch(hook, &info, keep_suspended) {
            let _ = CloseHandle(info.hThread);
            let _ = CloseHandle(info.hProcess);
            *args.process_information = PROCESS_INFORMATION::default();
            return Err(e);
        }
        Ok(())
    }

    /// Injects into a process created suspended and lets it run unless the
    /// creator wanted it suspended. Fails only when the target was killed.
    pub(crate) unsafe fn finish_launch(
        hook: Option<(&str, &InjectOptions)>,
        info: &PROCESS_INFORMATION,
        keep_suspended: bool,
    ) -> Result<()> {
        if let Some((instance, options)) = hook {
            if let Err(e) = inject(instance, info.hProcess, options) {
                if options.terminate_on_failure {
                    log::error!("injection into {} failed, terminating it: {}", info.dwProcessId, e);
                    let _ = TerminateProcess(info.hProcess, 1);
                    return Err(e);
                }
                log::error!(
                    "injection into {} failed, it runs without virtualization: {}",
                    info.dwProcessId,
                    e
                );
            }
        }
        if !keep_suspended {
            ResumeThread(info.hThread);
        }
        Ok(())
    }

    fn launch(
        hook: Option<(&str, &InjectOptions)>,
        executable: &Path,
        args: &[String],
        current_dir: Option<&Path>,
    ) -> Result<LaunchedProcess> {
        let executable_text = executable.to_string_lossy();
        let application = wide::to_wide(&executable_text);
        let mut command = wide::to_wide(&command_line(&executable_text, args));
        let directory = current_dir.map(|d| wide::to_wide(&d.to_string_lossy()));
        let startup = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();
        let args = CreateProcessArgs {
            application_name: PCWSTR::from_raw(application.as_ptr()),
            command_line: PWSTR::from_raw(command.as_mut_ptr()),
            process_attributes: None,
            thread_attributes: None,
            inherit_handles: BOOL(0),
            creation_flags: PROCESS_CREATION_FLAGS(0),
            environment: None,
            current_directory: directory
                .as_ref()
                .map(|d| PCWSTR::from_raw(d.as_ptr()))
                .unwrap_or_else(PCWSTR::null),
            startup_info: &startup,
            process_information: &mut info,
        };
        unsafe { create_process(hook, &args)? };
        log::info!("started {} as process {}", executable.display(), info.dwProcessId);
        Ok(LaunchedProcess { info })
    }

    pub fn launch_and_hook(
        instance: &str,
        executable: &Path,
        args: &[String],
        current_dir: Option<&Path>,
        options: &InjectOptions,
    ) -> Result<LaunchedProcess> {
        launch(Some((instance, options)), executable, args, current_dir)
    }

    pub fn launch_unhooked(
        executable: &Path,
        args: &[String],
        current_dir: Option<&Path>,
    ) -> Result<LaunchedProcess> {
        launch(None, executable, args, current_dir)
    }

    pub fn hook_running(instance: &str, pid: u32, options: &InjectOptions) -> Result<()> {
        let access = PROCESS_CREATE_THREAD
            | PROCESS_QUERY_INFORMATION
            | PROCESS_VM_OPERATION
            | PROCESS_VM_WRITE
            | PROCESS_VM_READ;
        let process = unsafe { OpenProcess(access, BOOL(0), pid) }
            .map_err(|e| failed("opening the target", &e))?;
        let result = inject(instance, process, options);
        unsafe {
            let _ = CloseHandle(process);
        }
        result
    }

    /// Memory allocated in another process, released on drop.
    struct RemoteBuffer {
        process: HANDLE,
        address: *mut c_void,
    }

    impl RemoteBuffer {
        fn write(process: HANDLE, bytes: &[u8]) -> Result<RemoteBuffer> {
            let address = unsafe {
                VirtualAllocEx(
                    process,
                    None,
                    bytes.len(),
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if address.is_null() {
                return Err(VfsError::Injection {
                    stage: "allocating target memory",
                    code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
                });
            }
            let buffer = RemoteBuffer { process, address };
            unsafe {
                WriteProcessMemory(
                    process,
                    address,
                    bytes.as_ptr().cast(),
                    bytes.len(),
                    None,
                )
            }
            .map_err(|e| failed("writing target memory", &e))?;
            Ok(buffer)
        }

        /// Leaves the memory to a remote thread that may still read it.
        fn leak(self) {
            std::mem::forget(self);
        }
    }

    impl Drop for RemoteBuffer {
        fn drop(&mut self) {
            unsafe {
                let _ = VirtualFreeEx(self.process, self.address, 0, MEM_RELEASE);
            }
        }
    }

    fn wide_bytes(value: &str) -> Vec<u8> {
        wide::to_wide(value)
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    fn run_remote(
        process: HANDLE,
        start: usize,
        parameter: &RemoteBuffer,
        timeout: Duration,
        stage: &'static str,
    ) -> Result<u32> {
        // Safety: `start` is the address of a function with the thread
        // routine signature in the target.
        let routine: LPTHREAD_START_ROUTINE = unsafe {
            Some(std::mem::transmute::<
                usize,
                unsafe extern "system" fn(*mut c_void) -> u32,
            >(start))
        };
        let thread = unsafe {
            CreateRemoteThread(
                process,
                None,
                0,
                routine,
                Some(parameter.address as *const c_void),
                0,
                None,
            )
        }
        .map_err(|e| failed(stage, &e))?;

        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
        let waited = unsafe { WaitForSingleObject(thread, millis) };
        let result = if waited == WAIT_TIMEOUT {
            Err(VfsError::InjectionTimeout(timeout))
        } else if waited != WAIT_OBJECT_0 {
            Err(VfsError::Injection {
                stage,
                code: std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
            })
        } else {
            let mut code = 0u32;
            unsafe { GetExitCodeThread(thread, &mut code) }
                .map(|()| code)
                .map_err(|e| failed(stage, &e))
        };
        unsafe {
            let _ = CloseHandle(thread);
        }
        result
    }

    fn is_wow64(process: HANDLE) -> Result<bool> {
        let mut wow64 = BOOL(0);
        unsafe { IsWow64Process(process, &mut wow64) }
            .map_err(|e| failed("checking the architecture", &e))?;
        Ok(wow64.as_bool())
    }

    /// Base address of the module at `path` in process `pid`.
    fn remote_module_base(pid: u32, path: &Path) -> Result<usize> {
        let wanted = fold_case(&path.to_string_lossy());
        let snapshot =
            unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
                .map_err(|e| failed("listing target modules", &e))?;
        let mut entry = MODULEENTRY32W {
            dwSize: size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };
        let mut found = None;
        let mut more = unsafe { Module32FirstW(snapshot, &mut entry) }.is_ok();
        while more {
            let len = entry
                .szExePath
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(entry.szExePath.len());
            if fold_case(&String::from_utf16_lossy(&entry.szExePath[..len])) == wanted {
                found = Some(entry.modBaseAddr as usize);
                break;
            }
            more = unsafe { Module32NextW(snapshot, &mut entry) }.is_ok();
        }
        unsafe {
            let _ = CloseHandle(snapshot);
        }
        found.ok_or(VfsError::Injection {
            stage: "locating the loaded module",
            code: ERROR_MOD_NOT_FOUND,
        })
    }

    /// Offset of `export` from the base of the module at `path`.
    fn export_offset(path: &Path, export: &str) -> Result<usize> {
        let path_wide = wide::to_wide(&path.to_string_lossy());
        let module = unsafe {
            LoadLibraryExW(
                PCWSTR::from_raw(path_wide.as_ptr()),
                HANDLE::default(),
                DONT_RESOLVE_DLL_REFERENCES,
            )
        }
        .map_err(|e| failed("mapping the hook module", &e))?;
        let name = format!("{}\0", export);
        let address = unsafe { GetProcAddress(module, PCSTR::from_raw(name.as_ptr())) };
        let offset = address.map(|f| f as usize - module.0 as usize);
        unsafe {
            let _ = FreeLibrary(module);
        }
        offset.ok_or(VfsError::Injection {
            stage: "finding the init export",
            code: ERROR_PROC_NOT_FOUND,
        })
    }

    /// Loads the hook module into `process` and activates it for
    /// `instance`.
    pub fn inject(instance: &str, process: HANDLE, options: &InjectOptions) -> Result<()> {
        let pid = unsafe { GetProcessId(process) };
        log::info!(
            "injecting {} into process {}",
            options.dll_path.display(),
            pid
        );
        if is_wow64(process)? != is_wow64(unsafe { GetCurrentProcess() })? {
            return Err(VfsError::Injection {
                stage: "checking the architecture",
                code: ERROR_NOT_SUPPORTED,
            });
        }

        let load_library = unsafe {
            let kernel32 = GetModuleHandleW(w!("kernel32.dll"))
                .map_err(|e| failed("finding LoadLibraryW", &e))?;
            GetProcAddress(kernel32, s!("LoadLibraryW"))
        }
        .ok_or(VfsError::Injection {
            stage: "finding LoadLibraryW",
            code: ERROR_PROC_NOT_FOUND,
        })? as usize;

        let dll = RemoteBuffer::write(process, &wide_bytes(&options.dll_path.to_string_lossy()))?;
        match run_remote(process, load_library, &dll, options.init_timeout, "loading the module") {
            // The exit code is the low half of the module handle.
            Ok(0) => {
                return Err(VfsError::Injection {
                    stage: "loading the module",
                    code: ERROR_MOD_NOT_FOUND,
                })
            }
            Ok(_) => {}
            Err(e @ VfsError::InjectionTimeout(_)) => {
                dll.leak();
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        log::debug!("module loaded into process {}", pid);

        let init = remote_module_base(pid, &options.dll_path)?
            + export_offset(&options.dll_path, INIT_EXPORT)?;
        let name = RemoteBuffer::write(process, &wide_bytes(instance))?;
        match run_remote(process, init, &name, options.init_timeout, "initializing hooks") {
            Ok(0) => {
                log::info!("process {} is hooked into {:?}", pid, instance);
                Ok(())
            }
            Ok(code) => Err(VfsError::Injection {
                stage: "initializing hooks",
                code,
            }),
            Err(e @ VfsError::InjectionTimeout(_)) => {
                name.leak();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
