// vm_symbols.rs — symbol maps and profiling counters for loaded modules

use etvm_common::common::com_printf;
use etvm_common::files::FsContext;
use etvm_common::q_shared::{com_parse, com_strip_extension, parse_hex};

use crate::sys_dll::VM_MAIN_SYMBOL;
use crate::vm_local::Vm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSymbol {
    pub sym_value: i32,
    pub profile_count: i32,
    pub sym_name: String,
}

/// One line of a drained profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub name: String,
    pub count: i32,
    pub percent: i32,
}

/// Snapshot taken by `Vm::drain_profile`. Entries ascend by count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub total: f64,
}

// ============================================================
// Map file parsing
// ============================================================

/// Parse `segment value name` triples, both numbers in hex.
///
/// Only segment 0 (code) is kept. With an instruction table, values that
/// index into it are translated to code offsets. The result is sorted.
pub fn parse_symbol_map(text: &str, instruction_pointers: Option<&[i32]>) -> Vec<VmSymbol> {
    let mut symbols = Vec::new();
    let mut rest = text;

    loop {
        let (token, r) = com_parse(rest);
        rest = r;
        if token.is_empty() {
            break;
        }

        if parse_hex(&token) != 0 {
            let (_, r) = com_parse(rest);
            let (_, r) = com_parse(r);
            rest = r;
            continue;
        }

        let (token, r) = com_parse(rest);
        rest = r;
        if token.is_empty() {
            com_printf("WARNING: incomplete line at end of file\n");
            break;
        }
        let mut value = parse_hex(&token);

        let (name, r) = com_parse(rest);
        rest = r;
        if name.is_empty() {
            com_printf("WARNING: incomplete line at end of file\n");
            break;
        }

        if let Some(table) = instruction_pointers {
            if value >= 0 && (value as usize) < table.len() {
                value = table[value as usize];
            }
        }

        symbols.push(VmSymbol {
            sym_value: value,
            profile_count: 0,
            sym_name: name,
        });
    }

    symbols.sort_by_key(|s| s.sym_value);
    symbols
}

/// Load `vm/<name>.map` for `vm`. Does nothing unless `developer` is set.
pub fn vm_load_symbols(vm: &mut Vm, fs: &FsContext, developer: bool) {
    if !developer {
        return;
    }

    let name = com_strip_extension(&vm.name);
    let symbols = format!("vm/{}.map", name);
    let Some(data) = fs.load_file(&symbols) else {
        com_printf(&format!("Couldn't load symbol file: {}\n", symbols));
        return;
    };

    let text = String::from_utf8_lossy(&data);
    // native modules have no instruction table
    vm.symbols = parse_symbol_map(&text, None);
    com_printf(&format!("{} symbols parsed from {}\n", vm.symbols.len(), symbols));
}

// ============================================================
// Lookup
// ============================================================

impl Vm {
    fn nearest_symbol_index(&self, value: i32) -> Option<usize> {
        if self.symbols.is_empty() {
            return None;
        }
        // symbols after the first whose value is <= value
        let after = self.symbols.partition_point(|s| s.sym_value <= value);
        Some(after.saturating_sub(1))
    }

    /// `name` on an exact hit, `name+offset` otherwise.
    pub fn value_to_symbol(&self, value: i32) -> String {
        let Some(idx) = self.nearest_symbol_index(value) else {
            return "NO SYMBOLS".to_string();
        };
        let sym = &self.symbols[idx];
        if value == sym.sym_value {
            sym.sym_name.clone()
        } else {
            format!("{}+{}", sym.sym_name, value.wrapping_sub(sym.sym_value))
        }
    }

    /// The function containing `value`.
    pub fn value_to_function_symbol(&self, value: i32) -> Option<&VmSymbol> {
        self.nearest_symbol_index(value).map(|idx| &self.symbols[idx])
    }

    /// Value of the named symbol, 0 when absent.
    pub fn symbol_to_value(&self, symbol: &str) -> i32 {
        self.symbols
            .iter()
            .find(|s| s.sym_name == symbol)
            .map_or(0, |s| s.sym_value)
    }

    // ============================================================
    // Profiling
    // ============================================================

    /// Count a hit against the function containing `value`.
    pub fn record_profile_hit(&mut self, value: i32) {
        if let Some(idx) = self.nearest_symbol_index(value) {
            self.symbols[idx].profile_count += 1;
        }
    }

    /// Native code is only observed at the call boundary, so a profiled
    /// call counts one hit against `vmMain`.
    pub fn record_call_hit(&mut self) {
        let entry = self
            .symbols
            .iter()
            .find(|s| s.sym_name == VM_MAIN_SYMBOL)
            .map(|s| s.sym_value);
        if let Some(value) = entry {
            self.record_profile_hit(value);
        }
    }

    /// Snapshot the counters and reset them.
    pub fn drain_profile(&mut self) -> ProfileReport {
        let total: f64 = self.symbols.iter().map(|s| s.profile_count as f64).sum();

        let mut entries: Vec<ProfileEntry> = self
            .symbols
            .iter_mut()
            .map(|s| {
                let count = std::mem::take(&mut s.profile_count);
                let percent = if total > 0.0 {
                    (100.0 * count as f64 / total) as i32
                } else {
                    0
                };
                ProfileEntry {
                    name: s.sym_name.clone(),
                    count,
                    percent,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.count);

        ProfileReport { entries, total }
    }
}

pub fn print_profile(report: &ProfileReport) {
    for e in &report.entries {
        com_printf(&format!("{:2}% {:9} {}\n", e.percent, e.count, e.name));
    }
    com_printf(&format!("    {:9.0} total\n", report.total));
}
