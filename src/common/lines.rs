//! Line-oriented edits of small text files (config.txt, /etc/modules).
//!
//! Matching is on the trimmed line, so indentation and CRLF endings do not
//! hide a directive. Files are edited in place and never recreated.

use std::fs;
use std::io;
use std::path::Path;

/// Prefix every uncommented line equal to `directive` with `#`.
///
/// Returns the new content and how many lines were commented out.
pub fn comment_out(content: &str, directive: &str) -> (String, usize) {
    let mut out = String::with_capacity(content.len() + 8);
    let mut changed = 0;
    for line in content.split_inclusive('\n') {
        if line.trim() == directive {
            out.push('#');
            changed += 1;
        }
        out.push_str(line);
    }
    (out, changed)
}

/// True if some line of `content` is exactly `line` (ignoring surrounding
/// whitespace).
pub fn contains_line(content: &str, line: &str) -> bool {
    content.lines().any(|l| l.trim() == line)
}

/// Leave exactly one copy of `line`: later copies are dropped, and the line
/// is appended if it is missing.
///
/// Returns `None` when nothing needs to change.
pub fn ensure_line(content: &str, line: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len() + line.len() + 2);
    let mut seen = false;
    let mut dropped = false;
    for existing in content.split_inclusive('\n') {
        if existing.trim() == line {
            if seen {
                dropped = true;
                continue;
            }
            seen = true;
        }
        out.push_str(existing);
    }

    if seen {
        return dropped.then_some(out);
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    Some(out)
}

/// [`comment_out`] applied to a file. The file must already exist.
pub fn comment_out_in_file(path: &Path, directive: &str) -> io::Result<usize> {
    let content = fs::read_to_string(path)?;
    let (updated, changed) = comment_out(&content, directive);
    if changed > 0 {
        fs::write(path, updated)?;
    }
    Ok(changed)
}

/// [`ensure_line`] applied to a file. The file must already exist.
///
/// Returns true if the file was rewritten.
pub fn ensure_line_in_file(path: &Path, line: &str) -> io::Result<bool> {
    let content = fs::read_to_string(path)?;
    match ensure_line(&content, line) {
        Some(updated) => {
            fs::write(path, updated)?;
            Ok(true)
        }
        None => Ok(false),
    }
}
