// vm.rs — module registry and the host/module call boundary
//
// Slots hold at most MAX_VM modules. Handles are generation-checked, so a
// freed slot can be reused without old handles reaching the new module.
// Calls push a frame onto an explicit stack; the innermost frame is the
// current module for syscalls coming back out of module code.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_void, CStr};
use std::rc::{Rc, Weak};

use etvm_common::cmd::CmdContext;
use etvm_common::common::{com_dprintf, com_error, com_printf};
use etvm_common::cvar::CvarContext;
use etvm_common::files::FsContext;
use etvm_common::q_shared::CvarFlags;
use etvm_common::qcommon::{ERR_DROP, ERR_FATAL, MAX_VM, VM_SYSCALL_ARGS};

use crate::sys_dll::{sys_load_game_dll, DEFAULT_FALLBACK_ROLES};
use crate::sys_loadlib::{sys_unload_dll, DllHandle, DllLoader};
use crate::vm_local::{pack_args, CallArgs, SystemCallFn, Vm, VmHandle};
use crate::vm_symbols::{print_profile, vm_load_symbols, ProfileReport};

thread_local! {
    /// Registries with a call in flight on this thread, innermost last.
    static REGISTRY_STACK: RefCell<Vec<*const VmRegistry>> = const { RefCell::new(Vec::new()) };
}

pub struct VmRegistry {
    slots: RefCell<[Option<Vm>; MAX_VM]>,
    next_id: Cell<u64>,
    /// Call stack of modules currently executing, innermost last.
    active: RefCell<Vec<VmHandle>>,
    last: Cell<Option<VmHandle>>,
    /// Libraries freed while their code was on the call stack.
    pending_unload: RefCell<Vec<DllHandle>>,
    debug_level: Cell<i32>,
    loader: RefCell<Box<dyn DllLoader>>,
    fs: Rc<RefCell<FsContext>>,
    cvars: Rc<RefCell<CvarContext>>,
}

/// Pushed for the duration of one host -> module call.
struct CallFrame<'a> {
    registry: &'a VmRegistry,
}

impl<'a> CallFrame<'a> {
    fn enter(registry: &'a VmRegistry, vm: VmHandle) -> Self {
        registry.active.borrow_mut().push(vm);
        registry.last.set(Some(vm));
        REGISTRY_STACK.with(|s| s.borrow_mut().push(registry as *const VmRegistry));
        CallFrame { registry }
    }
}

impl Drop for CallFrame<'_> {
    fn drop(&mut self) {
        REGISTRY_STACK.with(|s| s.borrow_mut().pop());
        let outermost = {
            let mut active = self.registry.active.borrow_mut();
            active.pop();
            active.is_empty()
        };
        if outermost {
            let pending = std::mem::take(&mut *self.registry.pending_unload.borrow_mut());
            for handle in pending {
                sys_unload_dll(Some(handle));
            }
        }
    }
}

impl VmRegistry {
    pub fn new(
        loader: Box<dyn DllLoader>,
        fs: Rc<RefCell<FsContext>>,
        cvars: Rc<RefCell<CvarContext>>,
    ) -> Self {
        Self {
            slots: RefCell::new(Default::default()),
            next_id: Cell::new(1),
            active: RefCell::new(Vec::new()),
            last: Cell::new(None),
            pending_unload: RefCell::new(Vec::new()),
            debug_level: Cell::new(0),
            loader: RefCell::new(loader),
            fs,
            cvars,
        }
    }

    pub fn fs(&self) -> &Rc<RefCell<FsContext>> {
        &self.fs
    }

    pub fn cvars(&self) -> &Rc<RefCell<CvarContext>> {
        &self.cvars
    }

    // ============================================================
    // Slot access
    // ============================================================

    pub fn is_live(&self, vm: VmHandle) -> bool {
        self.with_vm(vm, |_| ()).is_some()
    }

    /// Run `f` on the module behind `vm`, if it is still loaded.
    pub fn with_vm<R>(&self, vm: VmHandle, f: impl FnOnce(&Vm) -> R) -> Option<R> {
        let slots = self.slots.borrow();
        match slots.get(vm.slot) {
            Some(Some(instance)) if instance.id == vm.id => Some(f(instance)),
            _ => None,
        }
    }

    pub fn with_vm_mut<R>(&self, vm: VmHandle, f: impl FnOnce(&mut Vm) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        match slots.get_mut(vm.slot) {
            Some(Some(instance)) if instance.id == vm.id => Some(f(instance)),
            _ => None,
        }
    }

    /// Live module by name, case-insensitively.
    pub fn find(&self, module: &str) -> Option<VmHandle> {
        let slots = self.slots.borrow();
        slots.iter().enumerate().find_map(|(i, s)| match s {
            Some(vm) if vm.name.eq_ignore_ascii_case(module) => Some(vm.handle(i)),
            _ => None,
        })
    }

    pub fn name(&self, vm: VmHandle) -> Option<String> {
        self.with_vm(vm, |v| v.name.clone())
    }

    /// Handles of every live module, in slot order.
    pub fn handles(&self) -> Vec<VmHandle> {
        let slots = self.slots.borrow();
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|vm| vm.handle(i)))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    /// Innermost module with a call in flight.
    pub fn current(&self) -> Option<VmHandle> {
        let top = self.active.borrow().last().copied();
        top.filter(|&vm| self.is_live(vm))
    }

    /// Most recently called module.
    pub fn last(&self) -> Option<VmHandle> {
        self.last.get().filter(|&vm| self.is_live(vm))
    }

    /// Whether `vm_profile` is set.
    fn profiling(&self) -> bool {
        self.cvars
            .try_borrow()
            .is_ok_and(|c| c.variable_integer("vm_profile") != 0)
    }

    pub fn set_debug_level(&self, level: i32) {
        self.debug_level.set(level);
    }

    pub fn debug_level(&self) -> i32 {
        self.debug_level.get()
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Load `module` into a free slot, or return the live instance with
    /// that name. A full table is fatal; a failed load returns `None`.
    pub fn create(&self, module: &str, extract: bool, system_calls: SystemCallFn) -> Option<VmHandle> {
        if module.is_empty() {
            com_error(ERR_FATAL, "VM_Create: bad parms");
            return None;
        }

        if let Some(vm) = self.find(module) {
            return Some(vm);
        }

        let free = self.slots.borrow().iter().position(|s| s.is_none());
        let Some(slot) = free else {
            com_error(ERR_FATAL, "VM_Create: no free vm_t");
            return None;
        };

        let loaded = {
            let fs = self.fs.borrow();
            let cvars = self.cvars.borrow();
            let mut loader = self.loader.borrow_mut();
            sys_load_game_dll(&mut **loader, &fs, &cvars, module, extract, vm_dll_syscall)
        };
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                com_printf(&format!("VM_Create: {}\n", e));
                return None;
            }
        };

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut vm = Vm {
            name: module.to_string(),
            id,
            dll_handle: Some(loaded.handle),
            entry_point: Some(loaded.entry_point),
            system_call: system_calls,
            extract,
            symbols: Vec::new(),
        };

        let developer = self.cvars.borrow().variable_integer("developer") != 0;
        vm_load_symbols(&mut vm, &self.fs.borrow(), developer);

        let handle = vm.handle(slot);
        self.slots.borrow_mut()[slot] = Some(vm);
        Some(handle)
    }

    fn release(&self, vm: VmHandle, mut instance: Vm) {
        let dll = instance.dll_handle.take();
        if self.active.borrow().contains(&vm) {
            com_dprintf(&format!("VM_Free: {} still running, unload deferred\n", instance.name));
            if let Some(dll) = dll {
                self.pending_unload.borrow_mut().push(dll);
            }
        } else {
            sys_unload_dll(dll);
        }
    }

    /// Unload the module and empty its slot.
    pub fn free(&self, vm: VmHandle) {
        let instance = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(vm.slot) {
                Some(slot) if slot.as_ref().is_some_and(|v| v.id == vm.id) => slot.take(),
                _ => None,
            }
        };
        let Some(instance) = instance else {
            com_dprintf("VM_Free: stale handle\n");
            return;
        };

        if self.last.get() == Some(vm) {
            self.last.set(None);
        }
        self.release(vm, instance);
    }

    /// Free and reload a module, keeping its name, syscall handler and
    /// extract flag.
    pub fn restart(&self, vm: VmHandle) -> Option<VmHandle> {
        let Some((name, system_call, extract)) =
            self.with_vm(vm, |v| (v.name.clone(), Rc::clone(&v.system_call), v.extract))
        else {
            com_printf("VM_Restart: no such vm\n");
            return None;
        };

        com_printf("VM_Restart()\n");
        self.free(vm);

        let restarted = self.create(&name, extract, system_call);
        if restarted.is_none() {
            com_error(ERR_DROP, "VM_Restart: restart failed.");
        }
        restarted
    }

    /// Free every slot.
    pub fn clear(&self) {
        for slot in 0..MAX_VM {
            let instance = self.slots.borrow_mut()[slot].take();
            if let Some(instance) = instance {
                let vm = instance.handle(slot);
                self.release(vm, instance);
            }
        }
        self.last.set(None);
    }

    // ============================================================
    // Call boundary
    // ============================================================

    /// Call into a module. Arguments past the first `VM_CALL_END` read as
    /// zero; more than `VM_SYSCALL_ARGS` are dropped.
    pub fn call(&self, vm: VmHandle, call_num: isize, args: &[isize]) -> isize {
        let entry = match self.with_vm(vm, |v| v.entry_point) {
            Some(Some(entry)) => entry,
            Some(None) => {
                com_error(ERR_FATAL, "VM_Call: call without entrypoint");
                return 0;
            }
            None => {
                com_error(ERR_FATAL, "VM_Call: NULL vm");
                return 0;
            }
        };

        if self.debug_level.get() != 0 {
            com_printf(&format!("VM_Call( {} )\n", call_num));
        }
        if args.len() > VM_SYSCALL_ARGS {
            com_dprintf(&format!(
                "VM_Call: {} arguments, only {} passed\n",
                args.len(),
                VM_SYSCALL_ARGS
            ));
        }

        if self.profiling() {
            self.with_vm_mut(vm, |v| v.record_call_hit());
        }

        let a = pack_args(args);
        let _frame = CallFrame::enter(self, vm);
        // SAFETY: entry was resolved from a library the slot still owns, or
        // whose unload is deferred until this frame is popped.
        unsafe {
            entry(
                call_num, a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7], a[8], a[9], a[10],
                a[11], a[12], a[13], a[14], a[15],
            )
        }
    }

    /// Hand a module syscall to the current module's handler.
    pub fn dispatch_syscall(&self, args: &CallArgs) -> isize {
        let handler = self
            .current()
            .and_then(|vm| self.with_vm(vm, |v| Rc::clone(&v.system_call)));
        match handler {
            Some(handler) => handler(self, args),
            None => {
                com_error(ERR_FATAL, "VM_DllSyscall: no current vm");
                -1
            }
        }
    }

    /// Translate a module word into a host pointer. Native modules share
    /// the host address space, so the word is the address.
    pub fn arg_ptr(&self, value: isize) -> *mut c_void {
        if value == 0 || self.current().is_none() {
            return std::ptr::null_mut();
        }
        value as *mut c_void
    }

    pub fn explicit_arg_ptr(&self, vm: VmHandle, value: isize) -> *mut c_void {
        if value == 0 || self.current().is_none() || !self.is_live(vm) {
            return std::ptr::null_mut();
        }
        value as *mut c_void
    }

    /// Read a NUL-terminated string passed by the current module.
    pub fn arg_string(&self, value: isize) -> Option<String> {
        let ptr = self.arg_ptr(value);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: native modules pass pointers to live NUL-terminated strings.
        let s = unsafe { CStr::from_ptr(ptr as *const c_char) };
        Some(s.to_string_lossy().into_owned())
    }

    // ============================================================
    // Introspection
    // ============================================================

    pub fn value_to_symbol(&self, vm: VmHandle, value: i32) -> String {
        self.with_vm(vm, |v| v.value_to_symbol(value))
            .unwrap_or_else(|| "NO SYMBOLS".to_string())
    }

    pub fn symbol_to_value(&self, vm: VmHandle, symbol: &str) -> i32 {
        self.with_vm(vm, |v| v.symbol_to_value(symbol)).unwrap_or(0)
    }

    pub fn record_profile_hit(&self, vm: VmHandle, value: i32) {
        self.with_vm_mut(vm, |v| v.record_profile_hit(value));
    }

    pub fn drain_profile(&self, vm: VmHandle) -> Option<ProfileReport> {
        self.with_vm_mut(vm, |v| v.drain_profile())
    }

    /// `vminfo`
    pub fn vm_info_f(&self) {
        com_printf("Registered virtual machines:\n");
        let slots = self.slots.borrow();
        for vm in slots.iter().flatten() {
            com_printf(&format!("{} : native\n", vm.name));
            if let Some(path) = vm.library_path() {
                com_printf(&format!("    library     : {}\n", path));
            }
            if !vm.symbols.is_empty() {
                com_printf(&format!("    symbols     : {:7}\n", vm.symbols.len()));
            }
        }
    }

    /// `vmprofile`: print and reset the last module's counters.
    pub fn vm_profile_f(&self) {
        let Some(vm) = self.last() else {
            return;
        };

        let has_symbols = self.with_vm(vm, |v| !v.symbols.is_empty()).unwrap_or(false);
        if !has_symbols {
            com_printf("VM symbols not available\n");
            return;
        }

        if let Some(report) = self.drain_profile(vm) {
            print_profile(&report);
        }
    }
}

// ============================================================
// Syscall trampolines
// ============================================================

/// Dispatcher handed to `dllEntry`. Reads `VM_SYSCALL_ARGS` words.
///
/// # Safety
/// `args` must point at `VM_SYSCALL_ARGS` readable words.
pub unsafe extern "C" fn vm_dll_syscall(args: *const isize) -> isize {
    if args.is_null() {
        com_error(ERR_FATAL, "VM_DllSyscall: NULL args");
        return -1;
    }
    let block = std::slice::from_raw_parts(args, VM_SYSCALL_ARGS);
    vm_dll_syscall_explicit(block)
}

/// Copying variant for callers holding a slice rather than a full block.
/// Produces the same argument block as `vm_dll_syscall`.
pub fn vm_dll_syscall_explicit(args: &[isize]) -> isize {
    let block = pack_args(args);
    let registry = REGISTRY_STACK.with(|s| s.borrow().last().copied());
    match registry {
        // SAFETY: the pointer was pushed by a CallFrame, which borrows the
        // registry until it is popped.
        Some(registry) => unsafe { (*registry).dispatch_syscall(&block) },
        None => {
            com_error(ERR_FATAL, "VM_DllSyscall: no call in progress");
            -1
        }
    }
}

// ============================================================
// VM_Init
// ============================================================

/// Register runtime cvars and the `vminfo` / `vmprofile` commands, and
/// empty the table.
pub fn vm_init(registry: &Rc<VmRegistry>, cmd: &mut CmdContext) {
    {
        let mut cvars = registry.cvars.borrow_mut();
        cvars.get("vm_extract", "1", CvarFlags::ARCHIVE);
        cvars.get("vm_fallback", DEFAULT_FALLBACK_ROLES, CvarFlags::ARCHIVE);
        cvars.get("vm_profile", "0", CvarFlags::empty());
    }

    let weak: Weak<VmRegistry> = Rc::downgrade(registry);
    cmd.cmd_add_command(
        "vmprofile",
        Rc::new(move |_: &mut CmdContext| {
            if let Some(registry) = weak.upgrade() {
                registry.vm_profile_f();
            }
        }),
    );

    let weak: Weak<VmRegistry> = Rc::downgrade(registry);
    cmd.cmd_add_command(
        "vminfo",
        Rc::new(move |_: &mut CmdContext| {
            if let Some(registry) = weak.upgrade() {
                registry.vm_info_f();
            }
        }),
    );

    registry.clear();
}
