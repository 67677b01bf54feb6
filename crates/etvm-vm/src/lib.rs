#![allow(clippy::new_without_default, clippy::too_many_arguments)]

//! Native module runtime: shared-library loading, module resolution,
//! the module registry, the host/module call boundary, and symbol maps
//! with profiling counters for introspection.

pub mod vm_local;
pub mod sys_loadlib;
pub mod sys_dll;
pub mod vm;
pub mod vm_symbols;

pub use sys_dll::{sys_get_dll_name, VmError};
pub use sys_loadlib::{DllHandle, DllLoader, LoadError, LoadedLibrary, NativeLoader};
pub use vm::{vm_init, VmRegistry};
pub use vm_local::{dll_syscall, pack_args, CallArgs, DllEntryFn, SyscallFn, SystemCallFn, VmHandle, VmMainFn};
pub use vm_symbols::{ProfileEntry, ProfileReport, VmSymbol};
