//! Minidumps for panics inside a hooked process.

use std::{
    fs::File,
    os::windows::io::AsRawHandle,
    path::{Path, PathBuf},
    sync::Once,
};

use windows::Win32::{
    Foundation::HANDLE,
    System::{
        Diagnostics::Debug::{
            MiniDumpNormal, MiniDumpWithDataSegs, MiniDumpWithFullMemory, MiniDumpWithHandleData,
            MiniDumpWithIndirectlyReferencedMemory, MiniDumpWriteDump, MINIDUMP_TYPE,
        },
        Threading::{GetCurrentProcess, GetCurrentProcessId},
    },
};

use crate::{guard::HookGuard, parameters::CrashDumpsType};

static INSTALL: Once = Once::new();

fn dump_type(kind: CrashDumpsType) -> Option<MINIDUMP_TYPE> {
    Some(match kind {
        CrashDumpsType::None => return None,
        CrashDumpsType::Mini => MiniDumpNormal,
        CrashDumpsType::Data => {
            MINIDUMP_TYPE(MiniDumpWithDataSegs.0 | MiniDumpWithIndirectlyReferencedMemory.0)
        }
        CrashDumpsType::Full => MINIDUMP_TYPE(MiniDumpWithFullMemory.0 | MiniDumpWithHandleData.0),
    })
}

fn dump_path(dir: &Path) -> PathBuf {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "process".to_owned());
    let pid = unsafe { GetCurrentProcessId() };
    dir.join(format!("{}-{}-{}.dmp", exe, pid, uuid::Uuid::new_v4().simple()))
}

fn write_dump(dir: &Path, kind: MINIDUMP_TYPE) -> std::io::Result<PathBuf> {
    let _guard = HookGuard::enter();
    std::fs::create_dir_all(dir)?;
    let path = dump_path(dir);
    let file = File::create(&path)?;
    unsafe {
        MiniDumpWriteDump(
            GetCurrentProcess(),
            GetCurrentProcessId(),
            HANDLE(file.as_raw_handle() as _),
            kind,
            None,
            None,
            None,
        )
    }
    .map_err(|e| std::io::Error::from_raw_os_error(e.code().0 & 0xFFFF))?;
    Ok(path)
}

/// Chains a panic hook that writes a dump of `kind` into `dir`. Only the
/// first call in a process installs anything.
pub fn install_crash_handler(kind: CrashDumpsType, dir: &str) {
    let kind = match dump_type(kind) {
        Some(kind) => kind,
        None => return,
    };
    if dir.is_empty() {
        log::warn!("crash dumps requested without a dump directory");
        return;
    }
    let dir = PathBuf::from(dir);
    INSTALL.call_once(move || {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            match write_dump(&dir, kind) {
                Ok(path) => log::error!("panic, dump written to {}: {}", path.display(), info),
                Err(e) => log::error!("panic, writing a dump failed ({}): {}", e, info),
            }
            previous(info);
        }));
    });
}
