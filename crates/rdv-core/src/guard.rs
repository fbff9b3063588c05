//! Read-only guard: a lexical classifier for user-supplied SQL.
//!
//! The guard strips comments, scans the remaining text for mutating keywords
//! anywhere in the statement, and only accepts text that starts with `WITH` or
//! `SELECT`. It is not a parser and deliberately errs toward rejecting valid
//! read-only SQL (a column named `comment`, a string literal containing
//! `delete`) rather than accepting anything that could write.
//!
//! Comment markers inside single-quoted strings, double-quoted identifiers and
//! dollar-quoted bodies do not open comments, so a literal cannot make the
//! scanner discard real SQL.
//!
//! Whether a backslash escapes the next character inside `'...'` depends on the
//! server's `standard_conforming_strings` setting, which the guard cannot see.
//! [`check`] therefore classifies the text under both readings and rejects it
//! when either one finds a problem.

use crate::error::{Error, Result};

/// Keywords rejected anywhere in the stripped statement (matched as whole words).
pub const PROHIBITED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "truncate", "create", "grant", "revoke",
    "comment", "merge", "call", "do", "begin", "commit", "rollback",
];

/// Why a statement was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Empty or whitespace-only after comment removal.
    Empty,
    /// A prohibited keyword appears somewhere in the statement.
    ProhibitedKeyword(String),
    /// Statement does not start with `WITH` or `SELECT`.
    NotSelect,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Empty => write!(f, "statement is empty"),
            Rejection::ProhibitedKeyword(kw) => {
                write!(f, "prohibited keyword `{}`", kw.to_ascii_uppercase())
            }
            Rejection::NotSelect => write!(f, "statement must start with SELECT or WITH"),
        }
    }
}

/// How backslashes inside single-quoted strings are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backslash {
    /// Escapes only inside `E'...'` strings (`standard_conforming_strings = on`).
    EscapeStringsOnly,
    /// Escapes in every string (`standard_conforming_strings = off`).
    Everywhere,
}

/// Classifies `sql`, returning the first reason it is not read-only.
pub fn check(sql: &str) -> std::result::Result<(), Rejection> {
    classify(&strip(sql, Backslash::EscapeStringsOnly))?;
    classify(&strip(sql, Backslash::Everywhere))
}

fn classify(stripped: &str) -> std::result::Result<(), Rejection> {
    let text = stripped.trim();
    if text.is_empty() {
        return Err(Rejection::Empty);
    }

    let lowered = text.to_ascii_lowercase();
    if let Some(kw) = words(&lowered).find(|w| PROHIBITED_KEYWORDS.contains(w)) {
        return Err(Rejection::ProhibitedKeyword(kw.to_string()));
    }

    match words(&lowered).next() {
        Some(first) if lowered.starts_with(first) && (first == "with" || first == "select") => {
            Ok(())
        }
        _ => Err(Rejection::NotSelect),
    }
}

/// Returns true when `sql` passes the guard.
pub fn is_read_only(sql: &str) -> bool {
    check(sql).is_ok()
}

/// Like [`is_read_only`], but reports the rejection as [`Error::NotReadOnly`].
pub fn ensure_read_only(sql: &str) -> Result<()> {
    check(sql).map_err(|r| Error::NotReadOnly {
        reason: r.to_string(),
    })
}

/// Removes `--` line comments and `/* */` block comments.
///
/// Block comments end at the first `*/` (no nesting); an unterminated block
/// comment runs to the end of the text. Each comment is replaced by a single
/// space so that adjacent tokens never fuse.
pub fn strip_comments(sql: &str) -> String {
    strip(sql, Backslash::EscapeStringsOnly)
}

fn strip(sql: &str, backslash: Backslash) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < sql.len() {
        if let Some(end) = skip_comment(sql, i) {
            out.push_str(&sql[copied..i]);
            out.push(' ');
            i = end;
            copied = i;
        } else if let Some(end) = skip_quoted(sql, i, backslash) {
            i = end;
        } else {
            i += 1;
        }
    }
    out.push_str(&sql[copied..]);
    out
}

/// When a comment opens at `i`, returns the index just past it.
///
/// A line comment ends before its newline; an unterminated block comment runs
/// to the end of the text.
pub(crate) fn skip_comment(sql: &str, i: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    match (bytes[i], bytes.get(i + 1).copied()) {
        (b'-', Some(b'-')) => Some(sql[i..].find('\n').map_or(bytes.len(), |p| i + p)),
        (b'/', Some(b'*')) => Some(
            sql[i + 2..]
                .find("*/")
                .map_or(bytes.len(), |p| i + 2 + p + 2),
        ),
        _ => None,
    }
}

/// When a string, quoted identifier or dollar-quoted body opens at `i`,
/// returns the index just past it.
pub(crate) fn skip_quoted(sql: &str, i: usize, backslash: Backslash) -> Option<usize> {
    let bytes = sql.as_bytes();
    match bytes[i] {
        b'\'' => {
            let escapes = backslash == Backslash::Everywhere || is_escape_string(bytes, i);
            Some(skip_single_quoted(bytes, i, escapes))
        }
        b'"' => Some(skip_double_quoted(bytes, i)),
        b'$' => Some(skip_dollar_quoted(sql, i)).filter(|&end| end > i + 1),
        _ => None,
    }
}

/// True when the quote at `quote` is prefixed by a standalone `E`.
fn is_escape_string(bytes: &[u8], quote: usize) -> bool {
    match quote.checked_sub(1) {
        Some(e) if bytes[e].eq_ignore_ascii_case(&b'e') => {
            e == 0 || !is_word_char(bytes[e - 1] as char)
        }
        _ => false,
    }
}

/// Splits lowercase text into `[a-z0-9_]` words.
fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !is_word_char(c)).filter(|w| !w.is_empty())
}

pub(crate) fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `start` points at an opening `'`; returns the index just past the closing quote.
fn skip_single_quoted(bytes: &[u8], start: usize, escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `start` points at an opening `"`; returns the index just past the closing quote.
fn skip_double_quoted(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if bytes.get(i + 1) == Some(&b'"') => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `start` points at a `$`. Skips a `$tag$ ... $tag$` body when one opens here,
/// otherwise advances by one (positional parameters, `$` inside identifiers).
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let bytes = sql.as_bytes();
    if start > 0 && (is_word_char(bytes[start - 1] as char) || bytes[start - 1] == b'$') {
        return start + 1;
    }
    let mut j = start + 1;
    if let Some(&b) = bytes.get(j)
        && (b.is_ascii_alphabetic() || b == b'_')
    {
        while j < bytes.len() && (is_word_char(bytes[j] as char)) {
            j += 1;
        }
    }
    if bytes.get(j) != Some(&b'$') {
        return start + 1;
    }
    let tag = &sql[start..=j];
    let body = j + 1;
    sql[body..]
        .find(tag)
        .map_or(bytes.len(), |p| body + p + tag.len())
}
