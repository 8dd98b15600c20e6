//! Per-thread hook suppression.
//!
//! While a [`HookGuard`] is alive on a thread, every trampoline on that
//! thread forwards straight to the original function. The engine takes a
//! guard before touching the file system itself, and trampolines take one
//! for the duration of their own work so nested API calls stay native.

use std::cell::Cell;

thread_local! {
    static SUPPRESSED: Cell<bool> = Cell::new(false);
}

#[must_use = "hooks are only suppressed while the guard is alive"]
pub struct HookGuard {
    previous: bool,
}

impl HookGuard {
    pub fn enter() -> HookGuard {
        // During thread teardown the slot may be gone; there is nothing to
        // restore then.
        let previous = SUPPRESSED.try_with(|s| s.replace(true)).unwrap_or(true);
        HookGuard { previous }
    }

    /// True when the current thread must bypass the hooks.
    pub fn is_active() -> bool {
        SUPPRESSED.try_with(Cell::get).unwrap_or(true)
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = SUPPRESSED.try_with(|s| s.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_guards_restore_outer_state() {
        assert!(!HookGuard::is_active());
        {
            let _outer = HookGuard::enter();
            assert!(HookGuard::is_active());
            {
                let _inner = HookGuard::enter();
                assert!(HookGuard::is_active());
            }
            assert!(HookGuard::is_active());
        }
        assert!(!HookGuard::is_active());
    }

    #[test]
    fn guard_is_thread_local() {
        let _guard = HookGuard::enter();
        let other = std::thread::spawn(HookGuard::is_active).join().unwrap();
        assert!(!other);
    }

    #[test]
    fn released_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = HookGuard::enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!HookGuard::is_active());
    }
}
