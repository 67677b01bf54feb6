// sys_loadlib.rs — platform-independent shared library load/resolve/unload

use std::ffi::c_void;
use std::fmt;
use std::path::Path;

use libloading::{Library, Symbol};

use etvm_common::common::com_printf;

// ============================================================
// Errors
// ============================================================

#[derive(Debug)]
pub enum LoadError {
    /// No file at the path.
    NotFound(String),
    /// The file exists but the OS loader rejected it.
    Open { path: String, reason: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound(path) => write!(f, "{}: file not found", path),
            LoadError::Open { path, reason } => write!(f, "{}: {}", path, reason),
        }
    }
}

impl std::error::Error for LoadError {}

// ============================================================
// Loader seam
// ============================================================

/// An opened library. Dropping it unmaps the library.
pub trait LoadedLibrary {
    /// Address of an exported symbol, or `None` when absent.
    fn symbol(&self, name: &str) -> Option<*const c_void>;
}

/// Opens libraries by path.
pub trait DllLoader {
    fn load(&mut self, path: &str) -> Result<Box<dyn LoadedLibrary>, LoadError>;
}

/// Exclusively owned library handle. Unloads on drop.
pub struct DllHandle {
    path: String,
    library: Box<dyn LoadedLibrary>,
}

impl DllHandle {
    pub fn new(path: &str, library: Box<dyn LoadedLibrary>) -> Self {
        Self {
            path: path.to_string(),
            library,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn load_function(&self, name: &str) -> Option<*const c_void> {
        self.library.symbol(name)
    }
}

impl fmt::Debug for DllHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DllHandle").field("path", &self.path).finish()
    }
}

/// Unload a library. A missing handle is reported, not fatal.
pub fn sys_unload_dll(handle: Option<DllHandle>) {
    match handle {
        Some(handle) => drop(handle),
        None => com_printf("Sys_UnloadDll(NULL)\n"),
    }
}

// ============================================================
// libloading backend
// ============================================================

struct NativeLibrary {
    lib: Library,
}

impl LoadedLibrary for NativeLibrary {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        let mut cname = Vec::with_capacity(name.len() + 1);
        cname.extend_from_slice(name.as_bytes());
        cname.push(0);
        // SAFETY: the symbol is only read as an address; callers cast it to
        // the documented module ABI.
        let sym: Symbol<*const c_void> = unsafe { self.lib.get(&cname) }.ok()?;
        let addr = *sym;
        if addr.is_null() {
            None
        } else {
            Some(addr)
        }
    }
}

/// Loader backed by the OS dynamic linker.
#[derive(Debug, Default)]
pub struct NativeLoader;

impl NativeLoader {
    pub fn new() -> Self {
        NativeLoader
    }
}

impl DllLoader for NativeLoader {
    fn load(&mut self, path: &str) -> Result<Box<dyn LoadedLibrary>, LoadError> {
        if !Path::new(path).is_file() {
            return Err(LoadError::NotFound(path.to_string()));
        }
        // SAFETY: running a module's initializers is inherent to loading it.
        let lib = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(NativeLibrary { lib }))
    }
}
