//! Lexical helpers for `$k` positional parameters.
//!
//! A parameter is `$` followed by one or more digits, where the `$` is not
//! preceded by an identifier character or another `$` (PostgreSQL allows `$`
//! inside identifiers, e.g. `col$1`). Text inside comments, string literals,
//! quoted identifiers and dollar-quoted bodies is never a parameter.

use crate::guard::{Backslash, is_word_char, skip_comment, skip_quoted};

/// Calls `f` with the byte range and index of every positional parameter.
fn scan(text: &str, mut f: impl FnMut(usize, usize, usize)) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(end) = skip_comment(text, i)
            .or_else(|| skip_quoted(text, i, Backslash::EscapeStringsOnly))
        {
            i = end;
            continue;
        }
        if bytes[i] != b'$'
            || (i > 0 && (is_word_char(bytes[i - 1] as char) || bytes[i - 1] == b'$'))
        {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > i + 1
            && let Ok(index) = text[i + 1..j].parse::<usize>()
        {
            f(i, j, index);
        }
        i = j.max(i + 1);
    }
}

/// Highest `$k` referenced in `text`, or 0 when there is none.
pub fn max_placeholder_index(text: &str) -> usize {
    let mut max = 0;
    scan(text, |_, _, index| max = max.max(index));
    max
}

/// Rewrites every `$k`. `f` returns the replacement, or `None` to keep it.
pub fn rewrite_placeholders(text: &str, mut f: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    scan(text, |start, end, index| {
        if let Some(replacement) = f(index) {
            out.push_str(&text[last..start]);
            out.push_str(&replacement);
            last = end;
        }
    });
    out.push_str(&text[last..]);
    out
}

/// Adds `offset` to every `$k` in `text`.
pub fn shift_placeholders(text: &str, offset: usize) -> String {
    if offset == 0 {
        return text.to_string();
    }
    rewrite_placeholders(text, |index| Some(format!("${}", index + offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_index_ignores_identifiers() {
        assert_eq!(max_placeholder_index("select $1, $12 from t"), 12);
        assert_eq!(max_placeholder_index("select col$3 from t"), 0);
        assert_eq!(max_placeholder_index("select $$x$$"), 0);
        assert_eq!(max_placeholder_index("select 1"), 0);
    }

    #[test]
    fn shift_handles_multi_digit() {
        assert_eq!(
            shift_placeholders("a = $1 and b = $10 and c = $2", 3),
            "a = $4 and b = $13 and c = $5"
        );
        assert_eq!(shift_placeholders("a = $1", 0), "a = $1");
    }

    #[test]
    fn quoted_and_commented_dollars_are_text() {
        assert_eq!(max_placeholder_index("select '$5' as price"), 0);
        assert_eq!(max_placeholder_index("select \"$2\" from t where a = $1"), 1);
        assert_eq!(max_placeholder_index("select $1 -- don't use $9\n, $2"), 2);
        assert_eq!(max_placeholder_index("select $body$ $7 $body$, /* $8 */ $3"), 3);
        assert_eq!(
            shift_placeholders("select 'cost $1', $1, E'it\\'s $1'", 2),
            "select 'cost $1', $3, E'it\\'s $1'"
        );
    }

    #[test]
    fn rewrite_can_skip() {
        let out = rewrite_placeholders("$1 $2 $3", |i| (i == 2).then(|| "two".to_string()));
        assert_eq!(out, "$1 two $3");
    }
}
