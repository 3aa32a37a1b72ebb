//! Failure message sanitization.
//!
//! Tool failures are reported back to the agent, so they are reduced to a
//! single line with filesystem paths redacted and a length cap.

use regex::Regex;
use std::sync::LazyLock;

/// Absolute Unix or Windows path with at least one directory component.
static PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r#"(?:[A-Za-z]:\\|/)(?:[^\s/\\:"'`]+[/\\])+[^\s/\\:"'`,;)]*"#)
});

pub fn sanitize_error(raw: &str, max_chars: usize) -> String {
    let first = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("tool failed");
    let redacted = PATH_REGEX.replace_all(first, "<path>");

    if redacted.chars().count() <= max_chars {
        return redacted.into_owned();
    }
    let mut out: String = redacted.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}
