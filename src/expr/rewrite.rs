//! Token rewriting for rule expressions.
//!
//! Users write conditions that mix bare identifiers, dotted paths and
//! JSONPath (`action == "opened" && pull_request.draft == false`,
//! `$.labels[0] == "bug"`). The boolean evaluator only accepts
//! identifier-like variable names, so every path token is replaced by a
//! generated `v_…` name and the mapping back to its JSONPath is recorded.

use std::collections::HashMap;

/// Result of rewriting one expression.
#[derive(Debug)]
pub struct Rewritten {
    /// The expression with every path token replaced by its generated name.
    pub expr: String,
    /// Generated variable name → source JSONPath (always `$`-anchored).
    pub var_paths: HashMap<String, String>,
}

/// Rewrite an expression, harvesting path tokens into variables.
///
/// String literals (single- or double-quoted, `\`-escapes) are copied
/// verbatim. Outside strings, a token starts at `$` or an identifier-start
/// character and runs until a terminator character at bracket depth 0.
/// The keywords `true`, `false` and `null` pass through unchanged.
pub fn rewrite(expr: &str) -> Rewritten {
    let bytes = expr.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut var_paths = HashMap::new();

    let mut in_string = false;
    let mut string_quote = 0u8;
    let mut i = 0;

    while i < bytes.len() {
        let ch = bytes[i];

        if in_string {
            out.push(ch);
            if ch == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if ch == string_quote {
                in_string = false;
            }
            i += 1;
            continue;
        }

        if ch == b'"' || ch == b'\'' {
            in_string = true;
            string_quote = ch;
            out.push(ch);
            i += 1;
            continue;
        }

        if ch == b'$' || is_ident_start(ch) {
            let (token, next) = parse_path_token(bytes, i);
            if is_keyword(token) || crate::expr::eval::is_function(token) {
                out.extend_from_slice(token.as_bytes());
                i = next;
                continue;
            }
            let path = if token.starts_with('$') {
                token.to_string()
            } else {
                format!("$.{token}")
            };
            let safe = safe_var_name(&path);
            out.extend_from_slice(safe.as_bytes());
            var_paths.insert(safe, path);
            i = next;
            continue;
        }

        out.push(ch);
        i += 1;
    }

    // Splits only ever happen at ASCII terminator bytes.
    let expr = String::from_utf8(out).expect("rewrite preserves UTF-8");
    Rewritten { expr, var_paths }
}

/// Scan one path token starting at `start`. Square-bracket subscripts (and
/// parentheses nested inside them) are balanced and do not terminate the
/// token, so `$.labels[?(@ == "bug")]` scans as a single token. A `(` at
/// depth 0 terminates the token, which is how `contains(...)` keeps its
/// function name separate from its first argument.
fn parse_path_token(bytes: &[u8], start: usize) -> (&str, usize) {
    let mut i = start;
    let mut bracket_depth = 0u32;
    let mut paren_depth = 0u32;
    let mut quote = 0u8;

    while i < bytes.len() {
        let ch = bytes[i];

        if quote != 0 {
            if ch == b'\\' && i + 1 < bytes.len() {
                i += 2;
                continue;
            }
            if ch == quote {
                quote = 0;
            }
            i += 1;
            continue;
        }

        match ch {
            b'\'' | b'"' => {
                quote = ch;
                i += 1;
                continue;
            }
            b'[' => bracket_depth += 1,
            b']' => bracket_depth = bracket_depth.saturating_sub(1),
            b'(' if bracket_depth > 0 => paren_depth += 1,
            b')' if paren_depth > 0 => paren_depth -= 1,
            _ => {}
        }

        if bracket_depth == 0 && paren_depth == 0 && is_terminator(ch) {
            break;
        }
        i += 1;
    }

    let token = std::str::from_utf8(&bytes[start..i]).expect("token is valid UTF-8");
    (token, i)
}

fn is_terminator(ch: u8) -> bool {
    matches!(
        ch,
        b' ' | b'\t'
            | b'\n'
            | b'\r'
            | b','
            | b';'
            | b'+'
            | b'-'
            | b'*'
            | b'/'
            | b'%'
            | b'='
            | b'!'
            | b'<'
            | b'>'
            | b'&'
            | b'|'
            | b'('
            | b')'
    )
}

fn safe_var_name(path: &str) -> String {
    let mut name = String::with_capacity(path.len() + 2);
    name.push_str("v_");
    for ch in path.bytes() {
        if is_ident_start(ch) || ch.is_ascii_digit() {
            name.push(ch as char);
        } else {
            name.push('_');
        }
    }
    name
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_keyword(token: &str) -> bool {
    matches!(token, "true" | "false" | "null")
}
