//! Static dependency analysis of target commands.
//!
//! Commands are shell command lines with three kinds of markers:
//!
//! - `{{name}}`: a reference to another target or to an import,
//! - `file_in("path")`: an input file,
//! - `file_out("path")`: an output file the command writes.
//!
//! The analyzer never runs anything; it only scans the text.

use std::collections::BTreeSet;

use thiserror::Error;

/// A command the scanner could not make sense of.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at byte {offset})")]
pub struct ScanError {
    pub offset: usize,
    pub message: String,
}

/// Dependencies discovered in one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandDeps {
    /// Names referenced with `{{name}}`.
    pub symbols: BTreeSet<String>,
    pub files_in: BTreeSet<String>,
    pub files_out: BTreeSet<String>,
}

/// A piece of a scanned command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Symbol(&'a str),
    FileIn(&'a str),
    FileOut(&'a str),
}

/// Split a command into literal text and markers.
pub fn scan(command: &str) -> Result<Vec<Segment<'_>>, ScanError> {
    let bytes = command.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let marker = if command[i..].starts_with("{{") {
            Some(scan_symbol(command, i)?)
        } else if let Some(call) = file_call_at(command, i) {
            Some(scan_file_call(command, i, call)?)
        } else {
            None
        };

        match marker {
            Some((segment, end)) => {
                if text_start < i {
                    segments.push(Segment::Text(&command[text_start..i]));
                }
                segments.push(segment);
                i = end;
                text_start = end;
            }
            None => i += command[i..].chars().next().map_or(1, char::len_utf8),
        }
    }

    if text_start < bytes.len() {
        segments.push(Segment::Text(&command[text_start..]));
    }
    Ok(segments)
}

fn scan_symbol(command: &str, start: usize) -> Result<(Segment<'_>, usize), ScanError> {
    let body_start = start + 2;
    let close = command[body_start..].find("}}").ok_or_else(|| ScanError {
        offset: start,
        message: "unterminated '{{'".into(),
    })?;
    let name = command[body_start..body_start + close].trim();
    if !crate::models::is_valid_name(name) {
        return Err(ScanError {
            offset: start,
            message: format!("invalid reference '{name}'"),
        });
    }
    Ok((Segment::Symbol(name), body_start + close + 2))
}

#[derive(Debug, Clone, Copy)]
enum FileCall {
    In,
    Out,
}

fn file_call_at(command: &str, i: usize) -> Option<FileCall> {
    // `myfile_in(` is not a marker.
    if let Some(prev) = command[..i].chars().next_back() {
        if prev.is_ascii_alphanumeric() || prev == '_' {
            return None;
        }
    }
    let rest = &command[i..];
    if rest.starts_with("file_in(") {
        Some(FileCall::In)
    } else if rest.starts_with("file_out(") {
        Some(FileCall::Out)
    } else {
        None
    }
}

fn scan_file_call(
    command: &str,
    start: usize,
    call: FileCall,
) -> Result<(Segment<'_>, usize), ScanError> {
    let open = match call {
        FileCall::In => "file_in(".len(),
        FileCall::Out => "file_out(".len(),
    };
    let bytes = command.as_bytes();
    let err = |offset: usize, message: &str| ScanError {
        offset,
        message: message.to_owned(),
    };

    let mut i = start + open;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let quote = match bytes.get(i) {
        Some(q @ (b'"' | b'\'')) => *q,
        _ => return Err(err(i, "expected a quoted path")),
    };
    let path_start = i + 1;
    let path_len = command[path_start..]
        .bytes()
        .position(|b| b == quote)
        .ok_or_else(|| err(start, "unterminated path string"))?;
    let path = &command[path_start..path_start + path_len];
    if path.is_empty() {
        return Err(err(start, "empty path"));
    }

    i = path_start + path_len + 1;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if bytes.get(i) != Some(&b')') {
        return Err(err(i, "expected ')'"));
    }

    let segment = match call {
        FileCall::In => Segment::FileIn(path),
        FileCall::Out => Segment::FileOut(path),
    };
    Ok((segment, i + 1))
}

/// Collect the dependencies of a command.
pub fn analyze_command(command: &str) -> Result<CommandDeps, ScanError> {
    let mut deps = CommandDeps::default();
    for segment in scan(command)? {
        match segment {
            Segment::Text(_) => {}
            Segment::Symbol(name) => {
                deps.symbols.insert(name.to_owned());
            }
            Segment::FileIn(path) => {
                deps.files_in.insert(path.to_owned());
            }
            Segment::FileOut(path) => {
                deps.files_out.insert(path.to_owned());
            }
        }
    }
    Ok(deps)
}

/// Substitute every marker. Symbols are rendered by `resolve`; file markers
/// render to their path. Substitutions are shell-quoted when needed.
pub fn render_command<F>(command: &str, mut resolve: F) -> Result<String, ScanError>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(command.len());
    for segment in scan(command)? {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Symbol(name) => {
                let value = resolve(name).ok_or_else(|| ScanError {
                    offset: 0,
                    message: format!("no value for '{name}'"),
                })?;
                out.push_str(&shell_quote(&value));
            }
            Segment::FileIn(path) | Segment::FileOut(path) => out.push_str(&shell_quote(path)),
        }
    }
    Ok(out)
}

/// Quote `s` for a POSIX shell unless it only contains safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./-=:,+@%".contains(c));
    if safe {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Collapse runs of blanks outside quotes and trim the ends, so purely
/// cosmetic edits do not change the command fingerprint.
///
/// A line break outside quotes separates commands and is kept as a single
/// `\n`. The character after a backslash (outside quotes, or inside double
/// quotes) is copied unchanged.
pub fn normalize_command(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut quote: Option<char> = None;
    let mut gap: Option<char> = None;
    let mut chars = command.trim().chars();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' && q == '"' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\n' => gap = Some('\n'),
            c if c.is_whitespace() => {
                gap.get_or_insert(' ');
            }
            _ => {
                if let Some(g) = gap.take() {
                    out.push(g);
                }
                out.push(c);
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' | '\'' => quote = Some(c),
                    _ => {}
                }
            }
        }
    }
    out
}
