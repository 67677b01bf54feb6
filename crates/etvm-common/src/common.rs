// common.rs — console output, error escalation and command-line arguments

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use crate::qcommon::{ERR_DROP, ERR_FATAL};

pub const MAX_NUM_ARGVS: usize = 50;

/// Distribution name and version.
pub const DISTNAME: &str = "ETVM";
pub const DISTVER: &str = "1.0";

// ============================================================
// Redirect buffer for com_printf
// ============================================================

thread_local! {
    static RD_BUFFER: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Mirrors the `developer` cvar so that `com_dprintf` needs no context.
static DEVELOPER: AtomicBool = AtomicBool::new(false);

/// Begin redirecting printf output on this thread into a buffer.
pub fn com_begin_redirect() {
    RD_BUFFER.with(|b| *b.borrow_mut() = Some(String::new()));
}

/// End redirect and return the captured output.
pub fn com_end_redirect() -> Option<String> {
    RD_BUFFER.with(|b| b.borrow_mut().take())
}

// ============================================================
// Com_Printf / Com_DPrintf / Com_Error
// ============================================================

/// General-purpose print function. Prints to stdout, or appends to the
/// redirect buffer if one is active.
pub fn com_printf(msg: &str) {
    let redirected = RD_BUFFER.with(|b| {
        if let Some(ref mut s) = *b.borrow_mut() {
            s.push_str(msg);
            true
        } else {
            false
        }
    });
    if !redirected {
        print!("{}", msg);
    }
}

/// Developer-only print.
pub fn com_dprintf(msg: &str) {
    if !com_developer() {
        return;
    }
    com_printf(msg);
}

pub fn com_set_developer(on: bool) {
    DEVELOPER.store(on, Ordering::Relaxed);
}

pub fn com_developer() -> bool {
    DEVELOPER.load(Ordering::Relaxed)
}

/// Engine error handler.
/// - `ERR_FATAL`: prints to stderr and panics.
/// - `ERR_DROP`: prints the error and returns so the caller can abandon the operation.
/// - `ERR_QUIT`: clean exit.
pub fn com_error(code: i32, msg: &str) {
    if code == ERR_FATAL {
        eprintln!("Error: {}", msg);
        panic!("Fatal error: {}", msg);
    } else if code == ERR_DROP {
        com_printf(&format!("********************\nERROR: {}\n********************\n", msg));
    } else {
        println!("{}", msg);
        std::process::exit(0);
    }
}

/// Milliseconds since the first call in this process.
pub fn sys_milliseconds() -> i32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i32
}

// ============================================================
// Command-line arguments
// ============================================================

pub struct ComArgs {
    pub argc: usize,
    pub argv: Vec<String>,
}

impl ComArgs {
    pub fn new() -> Self {
        Self {
            argc: 0,
            argv: Vec::new(),
        }
    }

    pub fn init(&mut self, args: &[String]) {
        self.argc = args.len().min(MAX_NUM_ARGVS);
        self.argv = args[..self.argc].to_vec();
    }

    pub fn com_argc(&self) -> usize {
        self.argc
    }

    pub fn com_argv(&self, arg: usize) -> &str {
        if arg >= self.argc {
            ""
        } else {
            &self.argv[arg]
        }
    }

    pub fn com_clear_argv(&mut self, arg: usize) {
        if arg < self.argc {
            self.argv[arg] = String::new();
        }
    }
}

impl Default for ComArgs {
    fn default() -> Self {
        Self::new()
    }
}
