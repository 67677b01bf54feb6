// q_shared.rs — string, path and token helpers shared by host and modules

pub const MAX_TOKEN_CHARS: usize = 1024;
pub const MAX_STRING_CHARS: usize = 1024;
pub const MAX_STRING_TOKENS: usize = 256;

// ============================================================
// Cvar flags
// ============================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Marked `*` in `cvarlist`.
        const ARCHIVE    = 0x01;
        const USERINFO   = 0x02;
        const SERVERINFO = 0x04;
        /// Cannot be changed from the console.
        const NOSET      = 0x08;
        /// Change is held until `get_latched_vars`.
        const LATCH      = 0x10;
    }
}

// ============================================================
// Path / string utilities
// ============================================================

/// Strip the file extension (everything from the last '.' after the last '/').
pub fn com_strip_extension(input: &str) -> String {
    let name_start = input.rfind('/').map_or(0, |p| p + 1);
    match input[name_start..].rfind('.') {
        Some(pos) => input[..name_start + pos].to_string(),
        None => input.to_string(),
    }
}

/// Parse a hexadecimal number, silently skipping characters that are not hex digits.
/// Wraps on overflow.
pub fn parse_hex(text: &str) -> i32 {
    let mut value: i32 = 0;
    for c in text.bytes() {
        let digit = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => 10 + c - b'a',
            b'A'..=b'F' => 10 + c - b'A',
            _ => continue,
        };
        value = value.wrapping_mul(16).wrapping_add(digit as i32);
    }
    value
}

// ============================================================
// Token parser (COM_Parse equivalent)
// ============================================================

/// Parse one whitespace-delimited token from `data`, skipping `//` and
/// `/* */` comments and handling "quoted strings".
///
/// Returns `(token, remaining)`. An empty token means the data is exhausted.
pub fn com_parse(data: &str) -> (String, &str) {
    let bytes = data.as_bytes();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && bytes[pos] <= b' ' {
            pos += 1;
        }
        if pos >= bytes.len() {
            return (String::new(), "");
        }

        if bytes[pos..].starts_with(b"//") {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }
        if bytes[pos..].starts_with(b"/*") {
            pos += 2;
            while pos < bytes.len() && !bytes[pos..].starts_with(b"*/") {
                pos += 1;
            }
            pos = (pos + 2).min(bytes.len());
            continue;
        }
        break;
    }

    let mut token = Vec::new();

    if bytes[pos] == b'"' {
        pos += 1;
        while pos < bytes.len() && bytes[pos] != b'"' {
            if token.len() < MAX_TOKEN_CHARS - 1 {
                token.push(bytes[pos]);
            }
            pos += 1;
        }
        if pos < bytes.len() {
            pos += 1;
        }
    } else {
        while pos < bytes.len() && bytes[pos] > b' ' {
            if token.len() < MAX_TOKEN_CHARS - 1 {
                token.push(bytes[pos]);
            }
            pos += 1;
        }
    }

    (String::from_utf8_lossy(&token).into_owned(), &data[pos..])
}
