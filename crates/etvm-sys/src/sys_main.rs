// sys_main.rs — host process: subsystem init, console commands, and the
// syscall table modules call back into

use std::cell::{Cell, RefCell};
use std::io::BufRead;
use std::rc::{Rc, Weak};

use etvm_common::cmd::CmdContext;
use etvm_common::common::{
    com_error, com_printf, com_set_developer, sys_milliseconds, ComArgs, DISTNAME, DISTVER,
};
use etvm_common::cvar::CvarContext;
use etvm_common::files::FsContext;
use etvm_common::q_shared::CvarFlags;
use etvm_common::qcommon::{
    ERR_DROP, G_CVAR_VARIABLE_INTEGER_VALUE, G_ERROR, G_MILLISECONDS, G_PRINT, VM_MODULE_INIT,
    VM_MODULE_SHUTDOWN,
};
use etvm_vm::{vm_init, CallArgs, DllLoader, SystemCallFn, VmHandle, VmRegistry};

// ============================================================
// Host syscalls
// ============================================================

/// Syscall handler given to every module loaded by the host.
pub fn host_system_calls() -> SystemCallFn {
    Rc::new(|vms: &VmRegistry, args: &CallArgs| -> isize {
        match args[0] {
            G_PRINT => {
                if let Some(text) = vms.arg_string(args[1]) {
                    com_printf(&text);
                }
                0
            }
            G_ERROR => {
                let text = vms.arg_string(args[1]).unwrap_or_default();
                com_error(ERR_DROP, &text);
                0
            }
            G_MILLISECONDS => sys_milliseconds() as isize,
            G_CVAR_VARIABLE_INTEGER_VALUE => match vms.arg_string(args[1]) {
                Some(name) => vms.cvars().borrow().variable_integer(&name) as isize,
                None => 0,
            },
            other => {
                com_printf(&format!("Bad game system trap: {}\n", other));
                -1
            }
        }
    })
}

fn atoi(s: &str) -> isize {
    s.trim().parse::<isize>().unwrap_or(0)
}

fn sync_developer(cvars: &CvarContext) {
    com_set_developer(cvars.variable_integer("developer") != 0);
}

/// Rebuild the search path from the filesystem cvars.
fn fs_startup(cvars: &CvarContext, fs: &mut FsContext) {
    fs.init_filesystem(
        cvars.variable_string("fs_homepath"),
        cvars.variable_string("fs_basepath"),
        cvars.variable_string("fs_game"),
    );
}

fn shutdown_module(vms: &VmRegistry, vm: VmHandle) {
    vms.call(vm, VM_MODULE_SHUTDOWN, &[]);
}

// ============================================================
// Host
// ============================================================

pub struct Host {
    pub cvars: Rc<RefCell<CvarContext>>,
    pub fs: Rc<RefCell<FsContext>>,
    pub cmd: CmdContext,
    pub vms: Rc<VmRegistry>,
    quit: Rc<Cell<bool>>,
}

impl Host {
    pub fn new(loader: Box<dyn DllLoader>) -> Self {
        let cvars = Rc::new(RefCell::new(CvarContext::new()));
        let fs = Rc::new(RefCell::new(FsContext::new()));
        let vms = Rc::new(VmRegistry::new(loader, Rc::clone(&fs), Rc::clone(&cvars)));
        Self {
            cvars,
            fs,
            cmd: CmdContext::new(),
            vms,
            quit: Rc::new(Cell::new(false)),
        }
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.get()
    }

    /// Bring up every subsystem, then run `+command` arguments.
    pub fn init(&mut self, argv: &[String]) {
        let mut args = ComArgs::new();
        args.init(argv);

        self.cmd.cmd_init();
        self.cvar_init();

        // +set before anything reads its cvars
        self.cmd.cbuf_add_early_commands(&mut args, true);
        self.cmd.cbuf_execute();

        {
            let mut cvars = self.cvars.borrow_mut();
            cvars.get("developer", "0", CvarFlags::empty());
            cvars.get("fs_homepath", ".", CvarFlags::NOSET);
            cvars.get("fs_basepath", ".", CvarFlags::NOSET);
            cvars.get("fs_game", "", CvarFlags::LATCH | CvarFlags::SERVERINFO);
            cvars.get(
                "version",
                &format!("{} {}", DISTNAME, DISTVER),
                CvarFlags::SERVERINFO | CvarFlags::NOSET,
            );
            sync_developer(&cvars);
        }

        self.fs_init();
        vm_init(&self.vms, &mut self.cmd);
        self.register_vm_commands();

        let quit = Rc::clone(&self.quit);
        self.cmd
            .cmd_add_command("quit", Rc::new(move |_: &mut CmdContext| quit.set(true)));

        com_printf("====== Host Initialized ======\n");

        self.cmd.cbuf_add_late_commands(&args);
        self.cmd.cbuf_execute();

        // fs_game now waits for fs_restart
        self.cvars.borrow_mut().latch = true;
    }

    fn cvar_init(&mut self) {
        let cv = Rc::clone(&self.cvars);
        self.cmd.cvar_command = Some(Rc::new(move |c: &mut CmdContext| {
            let argv1 = (c.cmd_argc() > 1).then(|| c.cmd_argv(1).to_string());
            let mut cvars = cv.borrow_mut();
            let handled = cvars.command(c.cmd_argv(0), argv1.as_deref());
            sync_developer(&cvars);
            handled
        }));

        for (name, archive) in [("set", false), ("seta", true)] {
            let cv = Rc::clone(&self.cvars);
            self.cmd.cmd_add_command(
                name,
                Rc::new(move |c: &mut CmdContext| {
                    let argv: Vec<&str> = (1..c.cmd_argc()).map(|i| c.cmd_argv(i)).collect();
                    let mut cvars = cv.borrow_mut();
                    cvars.set_f(&argv, archive);
                    sync_developer(&cvars);
                }),
            );
        }

        let cv = Rc::clone(&self.cvars);
        self.cmd.cmd_add_command(
            "cvarlist",
            Rc::new(move |c: &mut CmdContext| {
                let prefix = (c.cmd_argc() > 1).then(|| c.cmd_argv(1));
                cv.borrow().list(prefix);
            }),
        );
    }

    fn fs_init(&mut self) {
        fs_startup(&self.cvars.borrow(), &mut self.fs.borrow_mut());

        let fs = Rc::clone(&self.fs);
        self.cmd
            .cmd_add_command("path", Rc::new(move |_: &mut CmdContext| fs.borrow().path_f()));

        let (cv, fs) = (Rc::clone(&self.cvars), Rc::clone(&self.fs));
        self.cmd.cmd_add_command(
            "fs_restart",
            Rc::new(move |_: &mut CmdContext| {
                let mut cvars = cv.borrow_mut();
                for name in cvars.get_latched_vars() {
                    com_printf(&format!("{} changed\n", name));
                }
                fs_startup(&cvars, &mut fs.borrow_mut());
            }),
        );
    }

    fn register_vm_commands(&mut self) {
        let weak = Rc::downgrade(&self.vms);
        self.cmd.cmd_add_command("vm_load", vm_command(&weak, vm_load_f));
        self.cmd.cmd_add_command("vm_call", vm_command(&weak, vm_call_f));
        self.cmd.cmd_add_command("vm_restart", vm_command(&weak, vm_restart_f));
        self.cmd.cmd_add_command("vm_free", vm_command(&weak, vm_free_f));
        self.cmd.cmd_add_command("vm_clear", vm_command(&weak, vm_clear_f));
        self.cmd.cmd_add_command("vm_debug", vm_command(&weak, vm_debug_f));
    }

    /// Execute console text immediately.
    pub fn execute(&mut self, text: &str) {
        self.cmd.cbuf_add_text(text);
        self.cmd.cbuf_add_text("\n");
        self.cmd.cbuf_execute();
    }

    /// Read and execute console lines until `quit` or end of input.
    pub fn run(&mut self, input: impl BufRead) {
        for line in input.lines() {
            if self.quit.get() {
                break;
            }
            let Ok(line) = line else {
                break;
            };
            self.execute(&line);
        }
    }

    /// Shut down and unload every module.
    pub fn shutdown(&mut self) {
        for vm in self.vms.handles() {
            shutdown_module(&self.vms, vm);
        }
        self.vms.clear();
    }
}

// ============================================================
// Module console commands
// ============================================================

fn vm_command(
    weak: &Weak<VmRegistry>,
    f: fn(&VmRegistry, &CmdContext),
) -> etvm_common::cmd::CmdFn {
    let weak = Weak::clone(weak);
    Rc::new(move |c: &mut CmdContext| {
        if let Some(vms) = weak.upgrade() {
            f(&vms, c);
        }
    })
}

fn lookup(vms: &VmRegistry, cmd: &str, name: &str) -> Option<VmHandle> {
    let vm = vms.find(name);
    if vm.is_none() {
        com_printf(&format!("{}: {} not loaded\n", cmd, name));
    }
    vm
}

/// `vm_load <name> [extract]`
fn vm_load_f(vms: &VmRegistry, c: &CmdContext) {
    if c.cmd_argc() < 2 {
        com_printf("usage: vm_load <name> [extract]\n");
        return;
    }
    let name = c.cmd_argv(1);
    let extract = c.cmd_argc() < 3 || atoi(c.cmd_argv(2)) != 0;

    let existing = vms.find(name);
    match vms.create(name, extract, host_system_calls()) {
        Some(vm) if existing.is_none() => {
            vms.call(vm, VM_MODULE_INIT, &[sys_milliseconds() as isize]);
        }
        Some(_) => com_printf(&format!("{} already loaded\n", name)),
        None => com_printf(&format!("vm_load: couldn't load {}\n", name)),
    }
}

/// `vm_call <name> <callNum> [args...]`
fn vm_call_f(vms: &VmRegistry, c: &CmdContext) {
    if c.cmd_argc() < 3 {
        com_printf("usage: vm_call <name> <callNum> [args...]\n");
        return;
    }
    let Some(vm) = lookup(vms, "vm_call", c.cmd_argv(1)) else {
        return;
    };
    let call_num = atoi(c.cmd_argv(2));
    let args: Vec<isize> = (3..c.cmd_argc()).map(|i| atoi(c.cmd_argv(i))).collect();
    let result = vms.call(vm, call_num, &args);
    com_printf(&format!("{}\n", result));
}

/// `vm_restart <name>`
fn vm_restart_f(vms: &VmRegistry, c: &CmdContext) {
    if c.cmd_argc() < 2 {
        com_printf("usage: vm_restart <name>\n");
        return;
    }
    let Some(vm) = lookup(vms, "vm_restart", c.cmd_argv(1)) else {
        return;
    };
    shutdown_module(vms, vm);
    if let Some(vm) = vms.restart(vm) {
        vms.call(vm, VM_MODULE_INIT, &[sys_milliseconds() as isize]);
    }
}

/// `vm_free <name>`
fn vm_free_f(vms: &VmRegistry, c: &CmdContext) {
    if c.cmd_argc() < 2 {
        com_printf("usage: vm_free <name>\n");
        return;
    }
    let Some(vm) = lookup(vms, "vm_free", c.cmd_argv(1)) else {
        return;
    };
    shutdown_module(vms, vm);
    vms.free(vm);
}

/// `vm_clear`
fn vm_clear_f(vms: &VmRegistry, _c: &CmdContext) {
    for vm in vms.handles() {
        shutdown_module(vms, vm);
    }
    vms.clear();
}

/// `vm_debug [level]`
fn vm_debug_f(vms: &VmRegistry, c: &CmdContext) {
    if c.cmd_argc() < 2 {
        com_printf(&format!("vm_debug is {}\n", vms.debug_level()));
        return;
    }
    vms.set_debug_level(atoi(c.cmd_argv(1)) as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use etvm_common::common::{com_begin_redirect, com_end_redirect};
    use etvm_common::qcommon::BASEGAME;
    use etvm_vm::{dll_syscall, sys_get_dll_name, LoadError, LoadedLibrary, SyscallFn};
    use std::collections::HashSet;
    use std::ffi::{c_void, CString};
    use std::io::Cursor;

    thread_local! {
        static STUB_SYSCALL: Cell<Option<SyscallFn>> = const { Cell::new(None) };
    }

    unsafe extern "C" fn stub_dll_entry(sys: SyscallFn) {
        STUB_SYSCALL.with(|s| s.set(Some(sys)));
    }

    unsafe fn stub_print(msg: &str) {
        let text = CString::new(msg).unwrap();
        let sys = STUB_SYSCALL.with(|s| s.get()).unwrap();
        dll_syscall(sys, &[G_PRINT, text.as_ptr() as isize]);
    }

    unsafe extern "C" fn stub_vm_main(
        cmd: isize, a0: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
        _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize, _: isize,
    ) -> isize {
        match cmd {
            VM_MODULE_INIT => {
                stub_print("stub init\n");
                0
            }
            VM_MODULE_SHUTDOWN => {
                stub_print("stub shutdown\n");
                0
            }
            4 => {
                let name = CString::new("developer").unwrap();
                let sys = STUB_SYSCALL.with(|s| s.get()).unwrap();
                dll_syscall(sys, &[G_CVAR_VARIABLE_INTEGER_VALUE, name.as_ptr() as isize])
            }
            _ => a0 + cmd,
        }
    }

    struct StubLibrary;

    impl LoadedLibrary for StubLibrary {
        fn symbol(&self, name: &str) -> Option<*const c_void> {
            match name {
                "dllEntry" => Some(stub_dll_entry as *const c_void),
                "vmMain" => Some(stub_vm_main as *const c_void),
                _ => None,
            }
        }
    }

    /// The `etvm-module` crate linked into the test binary.
    struct SampleLibrary;

    impl LoadedLibrary for SampleLibrary {
        fn symbol(&self, name: &str) -> Option<*const c_void> {
            match name {
                "dllEntry" => Some(sample::dllEntry as *const c_void),
                "vmMain" => Some(sample::vmMain as *const c_void),
                _ => None,
            }
        }
    }

    struct StubLoader {
        paths: HashSet<String>,
    }

    impl DllLoader for StubLoader {
        fn load(&mut self, path: &str) -> Result<Box<dyn LoadedLibrary>, LoadError> {
            if !self.paths.contains(path) {
                return Err(LoadError::NotFound(path.to_string()));
            }
            if path.ends_with(&sys_get_dll_name("sample")) {
                Ok(Box::new(SampleLibrary))
            } else {
                Ok(Box::new(StubLibrary))
            }
        }
    }

    fn host(extra: &[&str]) -> Host {
        let paths = ["qagame", "ui", "sample"]
            .iter()
            .map(|n| FsContext::build_os_path("/home/et", BASEGAME, &sys_get_dll_name(n)))
            .collect();
        let mut host = Host::new(Box::new(StubLoader { paths }));

        let mut argv: Vec<String> = [
            "etvm-host", "+set", "fs_homepath", "/home/et", "+set", "fs_basepath", "/opt/et",
            "+set", "vm_extract", "0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        argv.extend(extra.iter().map(|s| s.to_string()));

        com_begin_redirect();
        host.init(&argv);
        com_end_redirect();
        host
    }

    #[test]
    fn test_init_applies_early_commands() {
        let h = host(&["+set", "fs_game", "legacy"]);
        let cvars = h.cvars.borrow();
        assert_eq!(cvars.variable_string("fs_homepath"), "/home/et");
        assert_eq!(cvars.variable_string("fs_game"), "legacy");
        assert_eq!(cvars.variable_string("vm_fallback"), "ui");
        assert!(h.cmd.cmd_exists("vminfo"));
        assert!(h.cmd.cmd_exists("vm_call"));
    }

    #[test]
    fn test_load_call_free() {
        let mut h = host(&[]);

        com_begin_redirect();
        h.execute("vm_load qagame");
        h.execute("vm_call qagame 2 40");
        h.execute("vm_free qagame");
        h.execute("vm_call qagame 2 40");
        let out = com_end_redirect().unwrap();

        assert!(out.contains("stub init\n"));
        assert!(out.contains("42\n"));
        assert!(out.contains("stub shutdown\n"));
        assert!(out.contains("vm_call: qagame not loaded"));
        assert_eq!(h.vms.live_count(), 0);
    }

    #[test]
    fn test_module_reads_cvars_through_syscall() {
        let mut h = host(&["+set", "developer", "1"]);
        com_begin_redirect();
        h.execute("vm_load ui 0");
        com_end_redirect();

        com_begin_redirect();
        h.execute("vm_call ui 4");
        let before = com_end_redirect().unwrap();
        h.execute("developer 0");
        com_begin_redirect();
        h.execute("vm_call ui 4");
        let after = com_end_redirect().unwrap();

        assert!(before.ends_with("1\n"));
        assert!(after.ends_with("0\n"));
    }

    #[test]
    fn test_late_commands_and_quit() {
        let mut h = host(&["+vm_load", "qagame", "+vminfo"]);
        assert_eq!(h.vms.live_count(), 1);

        com_begin_redirect();
        h.run(Cursor::new("vm_debug 1\nvm_call qagame 7 1\nquit\nvminfo\n"));
        let out = com_end_redirect().unwrap();
        assert!(out.contains("VM_Call( 7 )\n8\n"));
        assert!(!out.contains("Registered virtual machines"));
        assert!(h.quit_requested());

        com_begin_redirect();
        h.shutdown();
        let out = com_end_redirect().unwrap();
        assert!(out.contains("stub shutdown"));
        assert_eq!(h.vms.live_count(), 0);
    }

    #[test]
    fn test_restart_reinitializes() {
        let mut h = host(&["+vm_load", "qagame"]);
        com_begin_redirect();
        h.execute("vm_restart qagame");
        let out = com_end_redirect().unwrap();
        assert!(out.contains("stub shutdown\nVM_Restart()\n"));
        assert!(out.ends_with("stub init\n"));
        assert_eq!(h.vms.live_count(), 1);
    }

    #[test]
    fn test_sample_module_end_to_end() {
        let mut h = host(&[]);

        com_begin_redirect();
        h.execute("vm_load sample");
        let out = com_end_redirect().unwrap();
        assert!(out.contains("sample: init at "));
        assert_eq!(h.vms.live_count(), 1);

        com_begin_redirect();
        h.execute("vm_call sample 2 40");
        h.execute("vm_call sample 2 -1337 40");
        h.execute("vm_call sample 99");
        let out = com_end_redirect().unwrap();
        assert_eq!(out, "42\n2\n-1\n");

        com_begin_redirect();
        h.execute("vm_call sample 3");
        let out = com_end_redirect().unwrap();
        assert!(out.trim_end().parse::<i32>().unwrap() >= 0);

        com_begin_redirect();
        h.execute("vm_load sample");
        h.execute("vm_restart sample");
        let out = com_end_redirect().unwrap();
        assert!(out.contains("sample already loaded\n"));
        assert!(out.contains("sample: shutdown after 6 calls\nVM_Restart()\n"));
        assert!(out.contains("sample: init at "));
        assert!(!out.contains("init called twice"));

        com_begin_redirect();
        h.execute("vm_free sample");
        let out = com_end_redirect().unwrap();
        assert!(out.contains("sample: shutdown after 2 calls\n"));
        assert_eq!(h.vms.live_count(), 0);
    }

    #[test]
    fn test_fs_game_waits_for_fs_restart() {
        let mut h = host(&["+set", "fs_game", "legacy"]);
        assert_eq!(h.fs.borrow().gamedir(), "legacy");

        com_begin_redirect();
        h.execute("fs_game etpro");
        let out = com_end_redirect().unwrap();
        assert_eq!(out, "fs_game will be changed upon restarting.\n");
        assert_eq!(h.cvars.borrow().variable_string("fs_game"), "legacy");
        assert_eq!(h.fs.borrow().gamedir(), "legacy");

        com_begin_redirect();
        h.execute("fs_restart");
        let out = com_end_redirect().unwrap();
        assert_eq!(out, "fs_game changed\n");
        assert_eq!(h.cvars.borrow().variable_string("fs_game"), "etpro");
        assert_eq!(h.fs.borrow().gamedir(), "etpro");
    }

    #[test]
    fn test_unknown_syscall() {
        let h = host(&[]);
        let handler = host_system_calls();
        let mut args = [0isize; 16];
        args[0] = 99;
        com_begin_redirect();
        assert_eq!(handler(&h.vms, &args), -1);
        let out = com_end_redirect().unwrap();
        assert_eq!(out, "Bad game system trap: 99\n");
    }
}
