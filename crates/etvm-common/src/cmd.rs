// cmd.rs — command buffer, tokenizer and command table

use std::collections::HashMap;
use std::rc::Rc;

use crate::common::{com_printf, ComArgs};
use crate::q_shared::{MAX_STRING_CHARS, MAX_STRING_TOKENS};

/// Size of the pending command text buffer.
pub const MAX_CMD_BUFFER: usize = 65536;

/// A console command handler.
pub type CmdFn = Rc<dyn Fn(&mut CmdContext)>;

/// Hook run for unknown commands; returns true if it consumed the command.
pub type CvarCommandFn = Rc<dyn Fn(&mut CmdContext) -> bool>;

/// A registered command.
pub struct CmdFunction {
    pub name: String,
    pub function: CmdFn,
}

/// The command system context.
pub struct CmdContext {
    // Command buffer
    pub cmd_text: String,
    pub cmd_wait: bool,

    // Tokenized command line
    pub cmd_argc: usize,
    pub cmd_argv: Vec<String>,
    pub cmd_args: String,

    // Registered commands
    pub cmd_functions: Vec<CmdFunction>,
    /// O(1) command lookup by lowercase name -> index in cmd_functions
    cmd_functions_index: HashMap<String, usize>,

    /// Tried after registered commands; the cvar layer installs it.
    pub cvar_command: Option<CvarCommandFn>,
}

impl CmdContext {
    pub fn new() -> Self {
        Self {
            cmd_text: String::new(),
            cmd_wait: false,
            cmd_argc: 0,
            cmd_argv: Vec::new(),
            cmd_args: String::new(),
            cmd_functions: Vec::new(),
            cmd_functions_index: HashMap::new(),
            cvar_command: None,
        }
    }

    // ========================================================
    // Command buffer operations (Cbuf_*)
    // ========================================================

    /// Add command text at the end of the buffer.
    pub fn cbuf_add_text(&mut self, text: &str) {
        if self.cmd_text.len() + text.len() >= MAX_CMD_BUFFER {
            com_printf("Cbuf_AddText: overflow\n");
            return;
        }
        self.cmd_text.push_str(text);
    }

    /// Queue `+set` command line parameters, which run before anything initializes.
    pub fn cbuf_add_early_commands(&mut self, args: &mut ComArgs, clear: bool) {
        let argc = args.com_argc();
        let mut i = 0;
        while i < argc {
            if args.com_argv(i) != "+set" {
                i += 1;
                continue;
            }
            let text = format!("set {} {}\n", args.com_argv(i + 1), args.com_argv(i + 2));
            self.cbuf_add_text(&text);
            if clear {
                args.com_clear_argv(i);
                args.com_clear_argv(i + 1);
                args.com_clear_argv(i + 2);
            }
            i += 3;
        }
    }

    /// Queue the remaining `+command args` parameters.
    /// Returns true if any late commands were added.
    pub fn cbuf_add_late_commands(&mut self, args: &ComArgs) -> bool {
        let text = (1..args.com_argc())
            .map(|i| args.com_argv(i))
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let mut build = String::new();
        for (n, chunk) in text.split('+').enumerate() {
            // text before the first '+' is not a command
            if n == 0 {
                continue;
            }
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                build.push_str(chunk);
                build.push('\n');
            }
        }

        let ret = !build.is_empty();
        if ret {
            self.cbuf_add_text(&build);
        }
        ret
    }

    /// Execute all commands in the buffer.
    pub fn cbuf_execute(&mut self) {
        while !self.cmd_text.is_empty() {
            // Find a \n or ; line break
            let bytes = self.cmd_text.as_bytes();
            let mut quotes = 0;
            let mut i = 0;
            while i < bytes.len() {
                let ch = bytes[i];
                if ch == b'"' {
                    quotes += 1;
                }
                if (quotes & 1) == 0 && ch == b';' {
                    break;
                }
                if ch == b'\n' || ch == b'\r' {
                    break;
                }
                i += 1;
            }

            let line = self.cmd_text[..i].to_string();
            let skip = (i + 1).min(self.cmd_text.len());
            self.cmd_text.drain(..skip);

            self.cmd_execute_string(&line);

            if self.cmd_wait {
                self.cmd_wait = false;
                break;
            }
        }
    }

    // ========================================================
    // Command tokenization
    // ========================================================

    /// Parse the given string into command line tokens.
    pub fn cmd_tokenize_string(&mut self, text: &str) {
        self.cmd_argc = 0;
        self.cmd_argv.clear();
        self.cmd_args.clear();

        if text.len() >= MAX_STRING_CHARS {
            com_printf(&format!("Line exceeded {} chars, discarded.\n", MAX_STRING_CHARS));
            return;
        }

        let bytes = text.as_bytes();
        let mut pos = 0;

        loop {
            // Skip whitespace up to a \n
            while pos < bytes.len() && bytes[pos] <= b' ' && bytes[pos] != b'\n' {
                pos += 1;
            }

            if pos >= bytes.len() || bytes[pos] == b'\n' {
                return;
            }

            // A comment ends the line
            if bytes[pos..].starts_with(b"//") {
                return;
            }

            if self.cmd_argc == 1 {
                self.cmd_args = text[pos..].trim_end().to_string();
            }

            let (token, new_pos) = com_parse_inline(bytes, pos);
            if new_pos == pos {
                return;
            }
            pos = new_pos;

            if self.cmd_argc < MAX_STRING_TOKENS {
                self.cmd_argv.push(token);
                self.cmd_argc += 1;
            }
        }
    }

    // ========================================================
    // Command registration
    // ========================================================

    /// Register a new command.
    pub fn cmd_add_command(&mut self, name: &str, function: CmdFn) {
        let key = name.to_ascii_lowercase();

        if self.cmd_functions_index.contains_key(&key) {
            com_printf(&format!("Cmd_AddCommand: {} already defined\n", name));
            return;
        }

        let idx = self.cmd_functions.len();
        self.cmd_functions.push(CmdFunction {
            name: name.to_string(),
            function,
        });
        self.cmd_functions_index.insert(key, idx);
    }

    pub fn cmd_exists(&self, name: &str) -> bool {
        self.cmd_functions_index.contains_key(&name.to_ascii_lowercase())
    }

    pub fn cmd_argc(&self) -> usize {
        self.cmd_argc
    }

    /// Get argument by index. Returns empty string if out of range.
    pub fn cmd_argv(&self, arg: usize) -> &str {
        if arg >= self.cmd_argc {
            ""
        } else {
            &self.cmd_argv[arg]
        }
    }

    /// All arguments after the first as a single string.
    pub fn cmd_args(&self) -> &str {
        &self.cmd_args
    }

    // ========================================================
    // Command execution
    // ========================================================

    /// Execute a single command line.
    pub fn cmd_execute_string(&mut self, text: &str) {
        self.cmd_tokenize_string(text);

        if self.cmd_argc == 0 {
            return;
        }

        let key = self.cmd_argv[0].to_ascii_lowercase();

        if let Some(&idx) = self.cmd_functions_index.get(&key) {
            let func = Rc::clone(&self.cmd_functions[idx].function);
            func(self);
            return;
        }

        if let Some(cvar_cmd) = self.cvar_command.clone() {
            if cvar_cmd(self) {
                return;
            }
        }

        com_printf(&format!("Unknown command \"{}\"\n", self.cmd_argv[0]));
    }

    // ========================================================
    // Built-in command handlers
    // ========================================================

    /// Delay the remainder of the command buffer until the next frame.
    pub fn cmd_wait_f(&mut self) {
        self.cmd_wait = true;
    }

    /// Print the rest of the line to the console.
    pub fn cmd_echo_f(&self) {
        for i in 1..self.cmd_argc {
            com_printf(&format!("{} ", self.cmd_argv(i)));
        }
        com_printf("\n");
    }

    /// List registered commands, optionally filtered by prefix.
    pub fn cmd_list_f(&self) {
        let prefix = self.cmd_argv(1).to_ascii_lowercase();
        let mut names: Vec<&str> = self
            .cmd_functions
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| n.to_ascii_lowercase().starts_with(&prefix))
            .collect();
        names.sort_unstable();
        for name in &names {
            com_printf(&format!("{}\n", name));
        }
        com_printf(&format!("{} commands\n", names.len()));
    }

    /// Register built-in commands: cmdlist, echo, wait.
    pub fn cmd_init(&mut self) {
        self.cmd_add_command("cmdlist", Rc::new(|ctx: &mut CmdContext| ctx.cmd_list_f()));
        self.cmd_add_command("echo", Rc::new(|ctx: &mut CmdContext| ctx.cmd_echo_f()));
        self.cmd_add_command("wait", Rc::new(|ctx: &mut CmdContext| ctx.cmd_wait_f()));
    }
}

impl Default for CmdContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Inline token parser
// ============================================================

/// Parse a single token from the byte slice starting at `pos`.
/// Returns (token, new_pos).
fn com_parse_inline(data: &[u8], mut pos: usize) -> (String, usize) {
    while pos < data.len() && data[pos] <= b' ' {
        if data[pos] == b'\n' {
            return (String::new(), pos);
        }
        pos += 1;
    }

    if pos >= data.len() {
        return (String::new(), pos);
    }

    let start;
    let end;
    if data[pos] == b'"' {
        pos += 1;
        start = pos;
        while pos < data.len() && data[pos] != b'"' {
            pos += 1;
        }
        end = pos;
        if pos < data.len() {
            pos += 1;
        }
    } else {
        start = pos;
        while pos < data.len() && data[pos] > b' ' {
            pos += 1;
        }
        end = pos;
    }

    (String::from_utf8_lossy(&data[start..end]).into_owned(), pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_tokenize() {
        let mut ctx = CmdContext::new();
        ctx.cmd_tokenize_string("vm_call ui 5 \"forty two\" // ignored");
        assert_eq!(ctx.cmd_argc(), 4);
        assert_eq!(ctx.cmd_argv(0), "vm_call");
        assert_eq!(ctx.cmd_argv(3), "forty two");
        assert_eq!(ctx.cmd_argv(4), "");
        assert_eq!(ctx.cmd_args(), "ui 5 \"forty two\" // ignored");
    }

    #[test]
    fn test_cmd_add_rejects_duplicates() {
        let mut ctx = CmdContext::new();
        ctx.cmd_add_command("test", Rc::new(|_: &mut CmdContext| {}));
        assert!(ctx.cmd_exists("TEST"));
        crate::common::com_begin_redirect();
        ctx.cmd_add_command("Test", Rc::new(|_: &mut CmdContext| {}));
        let out = crate::common::com_end_redirect().unwrap();
        assert_eq!(out, "Cmd_AddCommand: Test already defined\n");
    }

    #[test]
    fn test_cbuf_execute_runs_commands_in_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut ctx = CmdContext::new();
        let log = Rc::clone(&seen);
        ctx.cmd_add_command("note", Rc::new(move |c: &mut CmdContext| {
            log.borrow_mut().push(c.cmd_argv(1).to_string());
        }));
        ctx.cbuf_add_text("note a; note \"b;c\"\nnote d\n");
        ctx.cbuf_execute();
        assert_eq!(*seen.borrow(), vec!["a", "b;c", "d"]);
        assert!(ctx.cmd_text.is_empty());
    }

    #[test]
    fn test_wait_defers_rest_of_buffer() {
        let mut ctx = CmdContext::new();
        ctx.cmd_init();
        ctx.cbuf_add_text("wait\necho later\n");
        ctx.cbuf_execute();
        assert_eq!(ctx.cmd_text, "echo later\n");
    }

    #[test]
    fn test_cvar_hook_handles_unknown_commands() {
        let mut ctx = CmdContext::new();
        ctx.cvar_command = Some(Rc::new(|c: &mut CmdContext| c.cmd_argv(0) == "developer"));
        crate::common::com_begin_redirect();
        ctx.cmd_execute_string("developer 1");
        ctx.cmd_execute_string("bogus");
        let out = crate::common::com_end_redirect().unwrap();
        assert_eq!(out, "Unknown command \"bogus\"\n");
    }

    #[test]
    fn test_early_and_late_commands() {
        let mut args = ComArgs::new();
        let argv: Vec<String> = ["etvm-host", "+set", "fs_game", "legacy", "+vm_load", "ui", "+vminfo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.init(&argv);

        let mut ctx = CmdContext::new();
        ctx.cbuf_add_early_commands(&mut args, true);
        assert_eq!(ctx.cmd_text, "set fs_game legacy\n");

        ctx.cmd_text.clear();
        assert!(ctx.cbuf_add_late_commands(&args));
        assert_eq!(ctx.cmd_text, "vm_load ui\nvminfo\n");
    }
}
