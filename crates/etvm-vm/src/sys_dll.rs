// sys_dll.rs — module resolution: file naming, candidate roots, archive
// extraction and the default content set fallback

use std::ffi::c_void;
use std::fmt;

use etvm_common::common::{com_dprintf, com_printf};
use etvm_common::cvar::CvarContext;
use etvm_common::files::FsContext;
use etvm_common::qcommon::{ARCH_STRING, BASEGAME, DLL_EXT};

use crate::sys_loadlib::{DllHandle, DllLoader};
use crate::vm_local::{DllEntryFn, SyscallFn, VmMainFn};

pub const DLL_ENTRY_SYMBOL: &str = "dllEntry";
pub const VM_MAIN_SYMBOL: &str = "vmMain";

/// Roles allowed to fall back to `BASEGAME` when `vm_fallback` is unset.
pub const DEFAULT_FALLBACK_ROLES: &str = "ui";

// ============================================================
// Errors
// ============================================================

#[derive(Debug)]
pub enum VmError {
    /// Empty module name.
    BadParms,
    /// No candidate produced a library exporting both entry symbols.
    NotFound { name: String, attempted: Vec<String> },
    /// A library loaded but lacks a required export.
    MissingSymbol { path: String, symbol: &'static str },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadParms => write!(f, "bad parms"),
            VmError::NotFound { name, attempted } => {
                write!(f, "{}: no loadable module (tried {})", name, attempted.join(", "))
            }
            VmError::MissingSymbol { path, symbol } => {
                write!(f, "{}: missing {} export", path, symbol)
            }
        }
    }
}

impl std::error::Error for VmError {}

// ============================================================
// Naming
// ============================================================

/// Platform file name of module `name`.
pub fn sys_get_dll_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}_mp_{}{}", name, ARCH_STRING, DLL_EXT)
    } else if cfg!(target_os = "macos") {
        format!("{}{}", name, DLL_EXT)
    } else if cfg!(target_os = "openbsd") {
        format!("{}.mp.obsd.{}{}", name, ARCH_STRING, DLL_EXT)
    } else if cfg!(target_os = "freebsd") {
        format!("{}.mp.fbsd.{}{}", name, ARCH_STRING, DLL_EXT)
    } else if cfg!(target_os = "netbsd") {
        format!("{}.mp.nbsd.{}{}", name, ARCH_STRING, DLL_EXT)
    } else {
        format!("{}.mp.{}{}", name, ARCH_STRING, DLL_EXT)
    }
}

// ============================================================
// Resolution
// ============================================================

/// A library that exports both entry symbols and has been handed the
/// host dispatcher.
pub struct LoadedModule {
    pub handle: DllHandle,
    pub entry_point: VmMainFn,
}

fn try_library_load(loader: &mut dyn DllLoader, path: &str) -> Option<DllHandle> {
    com_printf(&format!("Sys_LoadDll({})... \n", path));

    match loader.load(path) {
        Ok(library) => {
            com_printf(&format!("Sys_LoadDll({}): succeeded ...\n", path));
            Some(DllHandle::new(path, library))
        }
        Err(e) => {
            com_printf(&format!("Sys_LoadDll({}) failed:\n\"{}\"\n", path, e));
            None
        }
    }
}

/// Check both exports. The handle is dropped, and so unloaded, on failure.
fn bind_entry_points(handle: DllHandle) -> Result<(DllHandle, DllEntryFn, VmMainFn), VmError> {
    let dll_entry = handle.load_function(DLL_ENTRY_SYMBOL);
    let vm_main = handle.load_function(VM_MAIN_SYMBOL);

    match (dll_entry, vm_main) {
        (Some(dll_entry), Some(vm_main)) => {
            // SAFETY: both exports follow the module ABI in vm_local.
            let (dll_entry, vm_main) = unsafe {
                (
                    std::mem::transmute::<*const c_void, DllEntryFn>(dll_entry),
                    std::mem::transmute::<*const c_void, VmMainFn>(vm_main),
                )
            };
            Ok((handle, dll_entry, vm_main))
        }
        (entry, _) => Err(VmError::MissingSymbol {
            path: handle.path().to_string(),
            symbol: if entry.is_none() { DLL_ENTRY_SYMBOL } else { VM_MAIN_SYMBOL },
        }),
    }
}

/// Load `name` from `gamedir`, trying `fs_homepath` then `fs_basepath`.
///
/// With `extract` set, the archive copy is refreshed into the homepath
/// first. A candidate missing either export is unloaded and the next one
/// is tried.
pub fn sys_load_dll(
    loader: &mut dyn DllLoader,
    fs: &FsContext,
    cvars: &CvarContext,
    name: &str,
    gamedir: &str,
    extract: bool,
    systemcalls: SyscallFn,
) -> Result<LoadedModule, VmError> {
    if name.is_empty() {
        return Err(VmError::BadParms);
    }

    let fname = sys_get_dll_name(name);
    let homepath = cvars.variable_string("fs_homepath").to_string();
    let basepath = cvars.variable_string("fs_basepath").to_string();

    if extract {
        fs.extract_from_pak(&homepath, gamedir, &fname);
    }

    let mut roots = vec![homepath];
    if !basepath.is_empty() && !roots.contains(&basepath) {
        roots.push(basepath);
    }

    let mut attempted = Vec::new();
    for root in &roots {
        let path = FsContext::build_os_path(root, gamedir, &fname);
        attempted.push(path.clone());

        let Some(handle) = try_library_load(loader, &path) else {
            continue;
        };

        match bind_entry_points(handle) {
            Ok((handle, dll_entry, entry_point)) => {
                com_printf(&format!(
                    "Sys_LoadDll({}) found vmMain function at {:p}\n",
                    name, entry_point as *const c_void
                ));
                // SAFETY: dll_entry was resolved from the live handle above.
                unsafe { dll_entry(systemcalls) };
                return Ok(LoadedModule { handle, entry_point });
            }
            Err(e) => {
                com_printf(&format!(
                    "Sys_LoadDll({}) failed to find vmMain function:\n\"{}\" !\n",
                    name, e
                ));
            }
        }
    }

    com_printf(&format!("Sys_LoadDll({}) failed to load library\n", name));
    Err(VmError::NotFound {
        name: name.to_string(),
        attempted,
    })
}

/// Whether `name` is listed in the `vm_fallback` roles.
pub fn fallback_allowed(cvars: &CvarContext, name: &str) -> bool {
    let roles = match cvars.find_var("vm_fallback") {
        Some(var) => var.string.as_str(),
        None => DEFAULT_FALLBACK_ROLES,
    };
    roles.split_whitespace().any(|role| role.eq_ignore_ascii_case(name))
}

/// Load module `name` for the active content set.
///
/// Roles listed in `vm_fallback` retry from `BASEGAME` when a mod is
/// active and does not provide a loadable copy.
pub fn sys_load_game_dll(
    loader: &mut dyn DllLoader,
    fs: &FsContext,
    cvars: &CvarContext,
    name: &str,
    extract: bool,
    systemcalls: SyscallFn,
) -> Result<LoadedModule, VmError> {
    // content set of the current search path
    let gamedir = fs.gamedir().to_string();

    let extract = extract
        && cvars
            .find_var("vm_extract")
            .map_or(true, |var| var.integer != 0);

    match sys_load_dll(loader, fs, cvars, name, &gamedir, extract, systemcalls) {
        Ok(module) => Ok(module),
        Err(e) => {
            if gamedir.eq_ignore_ascii_case(BASEGAME) || !fallback_allowed(cvars, name) {
                return Err(e);
            }
            com_dprintf(&format!("{}\n", e));
            com_printf(&format!(
                "Sys_LoadGameDll({}): falling back to {}\n",
                name, BASEGAME
            ));
            sys_load_dll(loader, fs, cvars, name, BASEGAME, extract, systemcalls)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys_loadlib::{LoadError, LoadedLibrary};
    use etvm_common::q_shared::CvarFlags;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Rc;

    unsafe extern "C" fn stub_vm_main(
        cmd: isize, a0: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
    ) -> isize {
        a0 + cmd
    }

    thread_local! {
        static ENTRY_CALLS: Cell<u32> = const { Cell::new(0) };
    }

    unsafe extern "C" fn stub_dll_entry(_sys: SyscallFn) {
        ENTRY_CALLS.with(|c| c.set(c.get() + 1));
    }

    unsafe extern "C" fn stub_syscall(_args: *const isize) -> isize {
        0
    }

    struct StubLibrary {
        exports: Vec<&'static str>,
        unloads: Rc<Cell<u32>>,
    }

    impl LoadedLibrary for StubLibrary {
        fn symbol(&self, name: &str) -> Option<*const c_void> {
            if !self.exports.contains(&name) {
                return None;
            }
            match name {
                DLL_ENTRY_SYMBOL => Some(stub_dll_entry as *const c_void),
                VM_MAIN_SYMBOL => Some(stub_vm_main as *const c_void),
                _ => None,
            }
        }
    }

    impl Drop for StubLibrary {
        fn drop(&mut self) {
            self.unloads.set(self.unloads.get() + 1);
        }
    }

    #[derive(Default)]
    struct StubLoader {
        libs: HashMap<String, Vec<&'static str>>,
        tried: Rc<RefCell<Vec<String>>>,
        unloads: Rc<Cell<u32>>,
    }

    impl DllLoader for StubLoader {
        fn load(&mut self, path: &str) -> Result<Box<dyn LoadedLibrary>, LoadError> {
            self.tried.borrow_mut().push(path.to_string());
            match self.libs.get(path) {
                Some(exports) => Ok(Box::new(StubLibrary {
                    exports: exports.clone(),
                    unloads: Rc::clone(&self.unloads),
                })),
                None => Err(LoadError::NotFound(path.to_string())),
            }
        }
    }

    fn cvars() -> CvarContext {
        let mut cvars = CvarContext::new();
        cvars.get("fs_homepath", "/home/et", CvarFlags::NOSET);
        cvars.get("fs_basepath", "/opt/et", CvarFlags::NOSET);
        cvars.get("vm_extract", "0", CvarFlags::empty());
        cvars
    }

    /// Filesystem with `game` active and no search paths.
    fn fs(game: &str) -> FsContext {
        let mut fs = FsContext::new();
        fs.gamedir = game.to_string();
        fs
    }

    fn path(root: &str, game: &str, name: &str) -> String {
        FsContext::build_os_path(root, game, &sys_get_dll_name(name))
    }

    #[test]
    fn test_dll_name_for_platform() {
        let name = sys_get_dll_name("ui");
        if cfg!(target_os = "linux") {
            assert_eq!(name, format!("ui.mp.{}.so", ARCH_STRING));
        } else if cfg!(target_os = "windows") {
            assert_eq!(name, format!("ui_mp_{}.dll", ARCH_STRING));
        } else if cfg!(target_os = "macos") {
            assert_eq!(name, "ui.dylib");
        }
    }

    #[test]
    fn test_homepath_wins() {
        let mut loader = StubLoader::default();
        let both = vec![DLL_ENTRY_SYMBOL, VM_MAIN_SYMBOL];
        loader.libs.insert(path("/home/et", BASEGAME, "qagame"), both.clone());
        loader.libs.insert(path("/opt/et", BASEGAME, "qagame"), both);

        let module = sys_load_game_dll(&mut loader, &fs(""), &cvars(), "qagame", false, stub_syscall)
            .unwrap();
        assert_eq!(module.handle.path(), path("/home/et", BASEGAME, "qagame"));
        assert_eq!(loader.tried.borrow().len(), 1);
    }

    #[test]
    fn test_secondary_root_without_leak() {
        let mut loader = StubLoader::default();
        // primary loads but lacks vmMain
        loader.libs.insert(path("/home/et", BASEGAME, "cgame"), vec![DLL_ENTRY_SYMBOL]);
        loader.libs.insert(path("/opt/et", BASEGAME, "cgame"), vec![DLL_ENTRY_SYMBOL, VM_MAIN_SYMBOL]);
        let unloads = Rc::clone(&loader.unloads);

        let before = ENTRY_CALLS.with(|c| c.get());
        let module = sys_load_game_dll(&mut loader, &fs(""), &cvars(), "cgame", false, stub_syscall)
            .unwrap();

        assert_eq!(module.handle.path(), path("/opt/et", BASEGAME, "cgame"));
        assert_eq!(unloads.get(), 1);
        assert_eq!(ENTRY_CALLS.with(|c| c.get()), before + 1);
        let r = unsafe { (module.entry_point)(5, 42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0) };
        assert_eq!(r, 47);

        drop(module);
        assert_eq!(unloads.get(), 2);
    }

    #[test]
    fn test_ui_falls_back_to_basegame() {
        let mut loader = StubLoader::default();
        loader.libs.insert(path("/opt/et", BASEGAME, "ui"), vec![DLL_ENTRY_SYMBOL, VM_MAIN_SYMBOL]);

        let module = sys_load_game_dll(&mut loader, &fs("legacy"), &cvars(), "ui", false, stub_syscall)
            .unwrap();
        assert_eq!(module.handle.path(), path("/opt/et", BASEGAME, "ui"));
        assert_eq!(
            *loader.tried.borrow(),
            vec![
                path("/home/et", "legacy", "ui"),
                path("/opt/et", "legacy", "ui"),
                path("/home/et", BASEGAME, "ui"),
                path("/opt/et", BASEGAME, "ui"),
            ]
        );
    }

    #[test]
    fn test_game_role_gets_no_fallback() {
        let mut loader = StubLoader::default();
        loader.libs.insert(path("/opt/et", BASEGAME, "qagame"), vec![DLL_ENTRY_SYMBOL, VM_MAIN_SYMBOL]);

        let err = sys_load_game_dll(&mut loader, &fs("legacy"), &cvars(), "qagame", false, stub_syscall)
            .err()
            .unwrap();
        match err {
            VmError::NotFound { name, attempted } => {
                assert_eq!(name, "qagame");
                assert_eq!(attempted.len(), 2);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_fallback_roles_are_configurable() {
        let mut c = cvars();
        assert!(fallback_allowed(&c, "UI"));
        assert!(!fallback_allowed(&c, "cgame"));
        c.get("vm_fallback", "ui cgame", CvarFlags::empty());
        assert!(fallback_allowed(&c, "cgame"));
    }

    #[test]
    fn test_extract_refreshes_homepath_copy() {
        let root = std::env::temp_dir().join(format!("etvm_sysdll_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let root = root.to_string_lossy().replace('\\', "/");
        let fname = sys_get_dll_name("ui");
        write_pk3(&format!("{}/etmain/mp_bin.pk3", root), &fname, b"module bytes");

        let mut fs = FsContext::new();
        fs.init_filesystem(&root, &root, "");

        let mut c = cvars();
        c.force_set("fs_homepath", &root);
        c.force_set("fs_basepath", &root);
        c.set("vm_extract", "1");

        let mut loader = StubLoader::default();
        loader.libs.insert(path(&root, BASEGAME, "ui"), vec![DLL_ENTRY_SYMBOL, VM_MAIN_SYMBOL]);
        let module = sys_load_game_dll(&mut loader, &fs, &c, "ui", true, stub_syscall).unwrap();

        let on_disk = std::fs::read(module.handle.path()).unwrap();
        assert_eq!(on_disk, b"module bytes");
    }

    fn write_pk3(path: &str, member: &str, data: &[u8]) {
        use etvm_common::crc::crc32_block;
        use etvm_common::qfiles::*;

        let hdr = DZipHeader {
            ident: ZPAKHEADER,
            version: 20,
            flags: 0,
            compression: ZIP_METHOD_STORED,
            modtime: 0,
            moddate: 0,
            crc32: crc32_block(data),
            compressed_size: data.len() as u32,
            uncompressed_size: data.len() as u32,
            filename_length: member.len() as u16,
            extra_field_length: 0,
        };
        let mut out = hdr.to_bytes().to_vec();
        out.extend_from_slice(member.as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&ZPAKDIRHEADER.to_le_bytes());
        FsContext::write_os_file(path, &out).unwrap();
    }
}
