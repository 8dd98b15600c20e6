//! Detours on the file system entry points of a hooked process.
//!
//! Each hooked function has a [`HookSlot`] holding the trampoline to the
//! original code. Replacements go through [`dispatch`], which forwards to
//! the original while the thread is inside the engine (see
//! [`HookGuard`]) and otherwise hands the call to the router.

mod nt;
mod win32;

use std::{
    ffi::c_void,
    panic::AssertUnwindSafe,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use retour::RawDetour;
use windows::{
    core::{PCSTR, PCWSTR},
    Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress},
};

use crate::{
    context::{self, HookContext},
    crash,
    error::{Result, VfsError},
    guard::HookGuard,
    logging,
    path::VirtualPathKey,
    status::{ERROR_INTERNAL_ERROR, ERROR_INVALID_PARAMETER},
    wide,
};

const KERNEL: &[&str] = &["kernelbase.dll", "kernel32.dll"];
const NTDLL: &[&str] = &["ntdll.dll"];

const ATTACH_TIMEOUT: Duration = Duration::from_secs(5);

struct InstalledDetour(RawDetour);

// The detour is only touched under the slot's lock.
unsafe impl Send for InstalledDetour {}

pub(crate) struct HookSlot {
    name: &'static str,
    original: AtomicUsize,
    detour: Mutex<Option<InstalledDetour>>,
}

impl HookSlot {
    pub const fn new(name: &'static str) -> HookSlot {
        HookSlot {
            name,
            original: AtomicUsize::new(0),
            detour: parking_lot::const_mutex(None),
        }
    }

    /// The original function, callable as `F`.
    ///
    /// # Safety
    ///
    /// `F` must be the function pointer type of the hooked function.
    pub unsafe fn original<F: Copy>(&self) -> Option<F> {
        match self.original.load(Ordering::Acquire) {
            0 => None,
            address => Some(std::mem::transmute_copy(&address)),
        }
    }

    unsafe fn install(&self, modules: &[&str], replacement: *const ()) -> Result<()> {
        let mut detour = self.detour.lock();
        if detour.is_some() {
            return Ok(());
        }
        let target = self.resolve(modules)?;
        let installed = RawDetour::new(target, replacement).map_err(|e| self.failed(e))?;
        // Calls may arrive as soon as the detour is enabled.
        self.original
            .store(installed.trampoline() as *const () as usize, Ordering::Release);
        installed.enable().map_err(|e| self.failed(e))?;
        *detour = Some(InstalledDetour(installed));
        log::trace!("hooked {}", self.name);
        Ok(())
    }

    /// Disables the detour. The trampoline stays allocated since other
    /// threads may still be running through it.
    unsafe fn uninstall(&self) {
        if let Some(InstalledDetour(detour)) = self.detour.lock().take() {
            if let Err(e) = detour.disable() {
                log::warn!("unhooking {} failed: {}", self.name, e);
            }
            std::mem::forget(detour);
        }
    }

    fn resolve(&self, modules: &[&str]) -> Result<*const ()> {
        let symbol = format!("{}\0", self.name);
        for module in modules {
            let module_name = wide::to_wide(module);
            let handle = match unsafe { GetModuleHandleW(PCWSTR::from_raw(module_name.as_ptr())) } {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            if let Some(function) =
                unsafe { GetProcAddress(handle, PCSTR::from_raw(symbol.as_ptr())) }
            {
                return Ok(function as *const ());
            }
        }
        Err(VfsError::HookInstall {
            function: self.name,
            reason: format!("not exported by {}", modules.join(" or ")),
        })
    }

    fn failed(&self, err: retour::Error) -> VfsError {
        VfsError::HookInstall {
            function: self.name,
            reason: err.to_string(),
        }
    }
}

pub(crate) struct HookSpec {
    slot: &'static HookSlot,
    modules: &'static [&'static str],
    replacement: *const (),
}

impl HookSpec {
    pub fn new(
        slot: &'static HookSlot,
        modules: &'static [&'static str],
        replacement: *const (),
    ) -> HookSpec {
        HookSpec {
            slot,
            modules,
            replacement,
        }
    }
}

fn all_hooks() -> Vec<HookSpec> {
    let mut hooks = nt::hooks();
    hooks.extend(win32::hooks());
    hooks
}

/// Runs `virtualized` against the installed context, or `native` when the
/// thread is already inside the engine or nothing is installed. A panic in
/// `virtualized` is logged and turned into `on_panic`.
pub(crate) fn dispatch<R>(
    on_panic: R,
    native: impl FnOnce() -> R,
    virtualized: impl FnOnce(&HookContext) -> R,
) -> R {
    if HookGuard::is_active() {
        return native();
    }
    let context = match context::current() {
        Some(context) => context,
        None => return native(),
    };
    let _guard = HookGuard::enter();
    match std::panic::catch_unwind(AssertUnwindSafe(|| virtualized(&context))) {
        Ok(result) => result,
        Err(_) => {
            log::error!("panic inside a file system hook");
            on_panic
        }
    }
}

/// Parses a Win32 path, resolving relative paths against the current
/// directory. `None` leaves the call to the host.
pub(crate) fn win32_key(path: &str) -> Option<VirtualPathKey> {
    match VirtualPathKey::parse(path) {
        Ok(key) => Some(key),
        Err(_) if !path.is_empty() => {
            let absolute = std::env::current_dir().ok()?.join(path);
            VirtualPathKey::from_path(&absolute).ok()
        }
        Err(_) => None,
    }
}

pub(crate) fn create_parent_dirs(real: &Path) -> Result<()> {
    if let Some(parent) = real.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Attaches to `instance` and installs every hook. With debug mode on, a
/// hook that cannot be installed fails the whole activation; otherwise it
/// is logged and skipped.
pub fn activate(instance: &str) -> Result<()> {
    if context::current().is_some() {
        log::debug!("hooks are already active");
        return Ok(());
    }
    let _guard = HookGuard::enter();
    let context = context::attach(instance, ATTACH_TIMEOUT)?;
    let parameters = context.parameters().clone();
    logging::init_logging(parameters.debug_mode());
    logging::set_log_level(parameters.log_level());
    crash::install_crash_handler(parameters.crash_dumps_type(), parameters.crash_dumps_path());
    if !parameters.process_delay().is_zero() {
        log::debug!("delaying activation by {:?}", parameters.process_delay());
        std::thread::sleep(parameters.process_delay());
    }

    context::install(context);
    let hooks = all_hooks();
    let mut skipped = 0;
    for spec in &hooks {
        if let Err(e) = unsafe { spec.slot.install(spec.modules, spec.replacement) } {
            if parameters.debug_mode() {
                log::error!("{}, rolling back", e);
                deactivate();
                return Err(e);
            }
            log::warn!("{}", e);
            skipped += 1;
        }
    }
    log::info!(
        "process {} attached to {:?}, {} of {} hooks installed",
        std::process::id(),
        instance,
        hooks.len() - skipped,
        hooks.len()
    );
    Ok(())
}

/// Removes every hook and drops the context.
pub fn deactivate() {
    for spec in all_hooks() {
        unsafe { spec.slot.uninstall() };
    }
    context::clear();
}

/// Entry point run on a remote thread by the injector. `parameter` is the
/// NUL-terminated UTF-16 instance name; returns 0 or a Win32 error code.
#[no_mangle]
pub unsafe extern "system" fn usvfs_init_hooks(parameter: *mut c_void) -> u32 {
    let instance = match wide::from_ptr(parameter as *const u16) {
        Some(instance) if !instance.is_empty() => instance,
        _ => return ERROR_INVALID_PARAMETER,
    };
    match std::panic::catch_unwind(|| activate(&instance)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            log::error!("activating hooks for {:?} failed: {}", instance, e);
            match e.win32_error() {
                0 => ERROR_INTERNAL_ERROR,
                code => code,
            }
        }
        Err(_) => ERROR_INTERNAL_ERROR,
    }
}

#[no_mangle]
pub extern "system" fn usvfs_deactivate_hooks() {
    deactivate();
}
