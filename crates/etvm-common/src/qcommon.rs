// qcommon.rs — definitions shared between the host and loadable modules

// ============================================================
// Error codes for com_error
// ============================================================

/// Exit the entire process with a popup/diagnostic.
pub const ERR_FATAL: i32 = 0;
/// Print to console and abort the current operation.
pub const ERR_DROP: i32 = 1;
/// Clean exit, no error.
pub const ERR_QUIT: i32 = 2;

// ============================================================
// Paths and content sets
// ============================================================

/// The default content set. Every install ships it.
pub const BASEGAME: &str = "etmain";

/// Archive extension searched for in every content directory.
pub const PK3_EXT: &str = "pk3";

// ============================================================
// Module call boundary
// ============================================================

/// Fixed number of word-sized argument slots crossing the module boundary.
pub const VM_SYSCALL_ARGS: usize = 16;

/// Terminates an argument list. Slots at and after it read as zero.
pub const VM_CALL_END: isize = -1337;

/// Registry slots, one per module role.
pub const MAX_VM: usize = 3;

/// Calls every module understands.
pub const VM_MODULE_INIT: isize = 0;
pub const VM_MODULE_SHUTDOWN: isize = 1;

// ============================================================
// Host services reachable through the syscall dispatcher
// ============================================================

pub const G_PRINT: isize = 0;
pub const G_ERROR: isize = 1;
pub const G_MILLISECONDS: isize = 2;
pub const G_CVAR_VARIABLE_INTEGER_VALUE: isize = 3;

// ============================================================
// Platform module naming
// ============================================================

#[cfg(target_arch = "x86_64")]
pub const ARCH_STRING: &str = "x86_64";
#[cfg(target_arch = "x86")]
pub const ARCH_STRING: &str = "i386";
#[cfg(target_arch = "aarch64")]
pub const ARCH_STRING: &str = "aarch64";
#[cfg(target_arch = "arm")]
pub const ARCH_STRING: &str = "arm";
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
pub const ARCH_STRING: &str = "ppc";
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "powerpc",
    target_arch = "powerpc64"
)))]
pub const ARCH_STRING: &str = std::env::consts::ARCH;

#[cfg(target_os = "windows")]
pub const DLL_EXT: &str = ".dll";
#[cfg(target_os = "macos")]
pub const DLL_EXT: &str = ".dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DLL_EXT: &str = ".so";
