// vm_local.rs — types shared across the module call boundary

use std::rc::Rc;

use etvm_common::qcommon::{VM_CALL_END, VM_SYSCALL_ARGS};

use crate::sys_loadlib::DllHandle;
use crate::vm::VmRegistry;
use crate::vm_symbols::VmSymbol;

// ============================================================
// ABI
// ============================================================

/// Fixed argument block used in both call directions.
pub type CallArgs = [isize; VM_SYSCALL_ARGS];

/// `vmMain(callNum, arg0..arg15)` exported by every module.
pub type VmMainFn = unsafe extern "C" fn(
    isize, isize, isize, isize, isize, isize, isize, isize, isize,
    isize, isize, isize, isize, isize, isize, isize, isize,
) -> isize;

/// Host dispatcher handed to the module. Points at `VM_SYSCALL_ARGS` words,
/// the first being the syscall number.
pub type SyscallFn = unsafe extern "C" fn(*const isize) -> isize;

/// `dllEntry(syscall)` exported by every module.
pub type DllEntryFn = unsafe extern "C" fn(SyscallFn);

/// Host-side syscall handler for one module. `args[0]` is the syscall number.
pub type SystemCallFn = Rc<dyn Fn(&VmRegistry, &CallArgs) -> isize>;

/// Copy up to `VM_SYSCALL_ARGS` words into a fixed block.
///
/// Copying stops at the first `VM_CALL_END`; that slot and everything after
/// it read as zero. Extra words past the block size are dropped.
pub fn pack_args(args: &[isize]) -> CallArgs {
    let mut block = [0isize; VM_SYSCALL_ARGS];
    for (slot, &arg) in block.iter_mut().zip(args) {
        if arg == VM_CALL_END {
            break;
        }
        *slot = arg;
    }
    block
}

/// Module-side helper: pack `args` and hand them to the host dispatcher.
///
/// # Safety
/// `sys` must be the dispatcher the host passed to `dllEntry`.
pub unsafe fn dll_syscall(sys: SyscallFn, args: &[isize]) -> isize {
    let block = pack_args(args);
    sys(block.as_ptr())
}

/// Call into a module with a variable argument list.
///
/// `vm_call!(registry, handle, call_num, a, b, ...)`
#[macro_export]
macro_rules! vm_call {
    ($registry:expr, $vm:expr, $call_num:expr $(, $arg:expr)* $(,)?) => {
        $registry.call($vm, ($call_num) as isize, &[$(($arg) as isize),*])
    };
}

// ============================================================
// Module instance
// ============================================================

/// Weak reference to a registry slot. Goes stale when the slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmHandle {
    pub(crate) slot: usize,
    pub(crate) id: u64,
}

impl VmHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// One loaded module.
pub struct Vm {
    pub name: String,
    pub(crate) id: u64,
    pub(crate) dll_handle: Option<DllHandle>,
    pub entry_point: Option<VmMainFn>,
    pub system_call: SystemCallFn,
    /// Whether the library was refreshed from an archive; kept for restart.
    pub extract: bool,
    /// Sorted ascending by value.
    pub symbols: Vec<VmSymbol>,
}

impl Vm {
    pub fn handle(&self, slot: usize) -> VmHandle {
        VmHandle { slot, id: self.id }
    }

    pub fn library_path(&self) -> Option<&str> {
        self.dll_handle.as_ref().map(|h| h.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_args_zero_fills_short_lists() {
        for len in 0..=VM_SYSCALL_ARGS {
            let args: Vec<isize> = (1..=len as isize).collect();
            let block = pack_args(&args);
            assert_eq!(&block[..len], &args[..]);
            assert!(block[len..].iter().all(|&w| w == 0));
        }
    }

    #[test]
    fn test_pack_args_stops_at_sentinel() {
        let block = pack_args(&[7, 8, VM_CALL_END, 9, 10]);
        assert_eq!(&block[..4], &[7, 8, 0, 0]);
        assert!(block.iter().all(|&w| w != VM_CALL_END));
    }

    #[test]
    fn test_pack_args_sentinel_is_full_word() {
        // low 32 bits equal the sentinel, the word as a whole does not
        let near = ((1i64 << 32) | (VM_CALL_END as i64 & 0xffff_ffff)) as isize;
        if std::mem::size_of::<isize>() == 8 {
            let block = pack_args(&[near, 5]);
            assert_eq!(block[0], near);
            assert_eq!(block[1], 5);
        }
    }

    #[test]
    fn test_pack_args_truncates_long_lists() {
        let args: Vec<isize> = (1..=20).collect();
        let block = pack_args(&args);
        assert_eq!(block[15], 16);
    }

    unsafe extern "C" fn echo_first(args: *const isize) -> isize {
        let block = std::slice::from_raw_parts(args, VM_SYSCALL_ARGS);
        block[0] * 100 + block[1] + block[15]
    }

    #[test]
    fn test_dll_syscall_packs_slice() {
        let r = unsafe { dll_syscall(echo_first, &[3, 4]) };
        assert_eq!(r, 304);
    }
}
