// cvar.rs — named configuration variables

use std::collections::HashMap;

use crate::common::com_printf;
use crate::q_shared::CvarFlags;

/// A console variable.
#[derive(Clone, Debug)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: CvarFlags,
    pub integer: i32,
}

impl Cvar {
    fn assign(&mut self, value: &str) {
        self.string = value.to_string();
        self.integer = parse_integer(value);
    }
}

/// atoi-style integer parse: leading sign and digits, anything else stops.
fn parse_integer(s: &str) -> i32 {
    let s = s.trim_start();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut value: i32 = 0;
    for c in digits.bytes().take_while(|c| c.is_ascii_digit()) {
        value = value.wrapping_mul(10).wrapping_add((c - b'0') as i32);
    }
    if neg {
        value.wrapping_neg()
    } else {
        value
    }
}

/// The full cvar system context.
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) cvar lookup by lowercase name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
    /// Set once startup is done. LATCH cvars then hold changes until
    /// `get_latched_vars`.
    pub latch: bool,
}

impl CvarContext {
    pub fn new() -> Self {
        Self {
            cvar_vars: Vec::new(),
            cvar_index: HashMap::new(),
            latch: false,
        }
    }

    /// Validate that a string doesn't contain characters invalid in info strings.
    pub fn info_validate(s: &str) -> bool {
        !s.contains('\\') && !s.contains('"') && !s.contains(';')
    }

    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.find_var_index(name).map(|idx| &self.cvar_vars[idx])
    }

    /// Integer value of a cvar. Returns 0 if not found.
    pub fn variable_integer(&self, name: &str) -> i32 {
        self.find_var(name).map_or(0, |v| v.integer)
    }

    /// String value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |v| v.string.as_str())
    }

    /// Get or create a cvar. If it already exists, the value is not changed
    /// but flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: CvarFlags) -> Option<usize> {
        let info = CvarFlags::USERINFO | CvarFlags::SERVERINFO;
        if flags.intersects(info) && !Self::info_validate(name) {
            com_printf("invalid info cvar name\n");
            return None;
        }

        if let Some(idx) = self.find_var_index(name) {
            self.cvar_vars[idx].flags |= flags;
            return Some(idx);
        }

        if flags.intersects(info) && !Self::info_validate(value) {
            com_printf("invalid info cvar value\n");
            return None;
        }

        let idx = self.cvar_vars.len();
        let mut var = Cvar {
            name: name.to_string(),
            string: String::new(),
            latched_string: None,
            flags,
            integer: 0,
        };
        var.assign(value);
        self.cvar_vars.push(var);
        self.cvar_index.insert(name.to_ascii_lowercase(), idx);

        Some(idx)
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> Option<usize> {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, value, CvarFlags::empty()),
        };

        let info = CvarFlags::USERINFO | CvarFlags::SERVERINFO;
        if self.cvar_vars[idx].flags.intersects(info) && !Self::info_validate(value) {
            com_printf("invalid info cvar value\n");
            return Some(idx);
        }

        let var = &mut self.cvar_vars[idx];
        if !force {
            if var.flags.contains(CvarFlags::NOSET) {
                com_printf(&format!("{} is write protected.\n", var.name));
                return Some(idx);
            }

            if var.flags.contains(CvarFlags::LATCH) && self.latch {
                let pending = var.latched_string.as_deref().unwrap_or(&var.string);
                if value == pending {
                    return Some(idx);
                }
                com_printf(&format!("{} will be changed upon restarting.\n", var.name));
                var.latched_string = Some(value.to_string());
                return Some(idx);
            }
        }
        var.latched_string = None;

        if value == var.string {
            return Some(idx);
        }

        var.assign(value);
        Some(idx)
    }

    /// Set a cvar value (respects NOSET and LATCH flags).
    pub fn set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, false)
    }

    /// Force-set a cvar value (ignores NOSET and LATCH).
    pub fn force_set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, true)
    }

    /// Apply all latched variable changes. Returns the names that changed.
    pub fn get_latched_vars(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                if latched != var.string {
                    var.assign(&latched);
                    changed.push(var.name.clone());
                }
            }
        }
        changed
    }

    /// Handle variable inspection/changing from the console.
    /// Returns true if the command was a cvar reference.
    pub fn command(&mut self, argv0: &str, argv1: Option<&str>) -> bool {
        let idx = match self.find_var_index(argv0) {
            Some(idx) => idx,
            None => return false,
        };

        match argv1 {
            None => {
                let var = &self.cvar_vars[idx];
                com_printf(&format!("\"{}\" is \"{}\"\n", var.name, var.string));
            }
            Some(value) => {
                let name = self.cvar_vars[idx].name.clone();
                self.set(&name, value);
            }
        }
        true
    }

    /// Console command handler for "set <variable> <value>" and "seta".
    /// `argv` holds the arguments after the command name.
    pub fn set_f(&mut self, argv: &[&str], archive: bool) {
        if argv.len() < 2 {
            com_printf("usage: set <variable> <value>\n");
            return;
        }
        let value = argv[1..].join(" ");
        self.set(argv[0], &value);
        if archive {
            if let Some(idx) = self.find_var_index(argv[0]) {
                self.cvar_vars[idx].flags |= CvarFlags::ARCHIVE;
            }
        }
    }

    /// List cvars whose name starts with `prefix`.
    pub fn list(&self, prefix: Option<&str>) -> (usize, usize) {
        let prefix = prefix.unwrap_or("").to_ascii_lowercase();
        let mut matching = 0;

        for var in &self.cvar_vars {
            if !var.name.to_ascii_lowercase().starts_with(&prefix) {
                continue;
            }
            matching += 1;
            let archive = if var.flags.contains(CvarFlags::ARCHIVE) { '*' } else { ' ' };
            let userinfo = if var.flags.contains(CvarFlags::USERINFO) { 'U' } else { ' ' };
            let serverinfo = if var.flags.contains(CvarFlags::SERVERINFO) { 'S' } else { ' ' };
            let noset = if var.flags.contains(CvarFlags::NOSET) {
                '-'
            } else if var.flags.contains(CvarFlags::LATCH) {
                'L'
            } else {
                ' '
            };
            com_printf(&format!(
                "{}{}{}{} {} \"{}\"\n",
                archive, userinfo, serverinfo, noset, var.name, var.string
            ));
        }

        let total = self.cvar_vars.len();
        com_printf(&format!("{} cvars, {} matching\n", total, matching));
        (total, matching)
    }
}

impl Default for CvarContext {
    fn default() -> Self {
        Self::new()
    }
}
