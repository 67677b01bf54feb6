// etvm-module — sample module built as a shared library
//
// Exports the two symbols every module provides: `dllEntry`, which receives
// the host syscall dispatcher, and `vmMain`, which receives every host call.

#![allow(non_snake_case)]

use std::ffi::CString;

use parking_lot::Mutex;

use etvm_common::qcommon::{G_ERROR, G_MILLISECONDS, G_PRINT, VM_MODULE_INIT, VM_MODULE_SHUTDOWN};
use etvm_vm::vm_local::{dll_syscall, SyscallFn};

/// Returns `a0 + callNum`.
pub const MODULE_ECHO: isize = 2;
/// Returns the host's millisecond clock.
pub const MODULE_MILLISECONDS: isize = 3;

// ============================================================
// Global state
// ============================================================

/// Dispatcher received through dllEntry
static SYSCALL: Mutex<Option<SyscallFn>> = Mutex::new(None);

static STATE: Mutex<ModuleState> = Mutex::new(ModuleState {
    initialized: false,
    calls: 0,
});

struct ModuleState {
    initialized: bool,
    calls: u64,
}

// ============================================================
// Syscall wrappers
// ============================================================

fn syscall(args: &[isize]) -> isize {
    let sys = *SYSCALL.lock();
    match sys {
        // SAFETY: the host handed us this dispatcher in dllEntry.
        Some(sys) => unsafe { dll_syscall(sys, args) },
        None => -1,
    }
}

fn trap_print(msg: &str) {
    if let Ok(text) = CString::new(msg) {
        syscall(&[G_PRINT, text.as_ptr() as isize]);
    }
}

fn trap_error(msg: &str) {
    if let Ok(text) = CString::new(msg) {
        syscall(&[G_ERROR, text.as_ptr() as isize]);
    }
}

fn trap_milliseconds() -> isize {
    syscall(&[G_MILLISECONDS])
}

// ============================================================
// Exports
// ============================================================

/// Store the host syscall dispatcher.
///
/// # Safety
/// `syscallptr` must stay callable until the module is unloaded.
#[no_mangle]
pub unsafe extern "C" fn dllEntry(syscallptr: SyscallFn) {
    *SYSCALL.lock() = Some(syscallptr);
}

/// Single entry point for host calls.
///
/// # Safety
/// Called by the host only after `dllEntry`.
#[no_mangle]
pub unsafe extern "C" fn vmMain(
    command: isize,
    arg0: isize,
    _arg1: isize,
    _arg2: isize,
    _arg3: isize,
    _arg4: isize,
    _arg5: isize,
    _arg6: isize,
    _arg7: isize,
    _arg8: isize,
    _arg9: isize,
    _arg10: isize,
    _arg11: isize,
    _arg12: isize,
    _arg13: isize,
    _arg14: isize,
    _arg15: isize,
) -> isize {
    STATE.lock().calls += 1;

    match command {
        VM_MODULE_INIT => {
            let already = std::mem::replace(&mut STATE.lock().initialized, true);
            if already {
                trap_error("sample: init called twice");
                return -1;
            }
            trap_print(&format!("sample: init at {}\n", arg0));
            0
        }
        VM_MODULE_SHUTDOWN => {
            let calls = {
                let mut state = STATE.lock();
                state.initialized = false;
                std::mem::take(&mut state.calls)
            };
            trap_print(&format!("sample: shutdown after {} calls\n", calls));
            0
        }
        MODULE_ECHO => arg0 + command,
        MODULE_MILLISECONDS => trap_milliseconds(),
        _ => -1,
    }
}
