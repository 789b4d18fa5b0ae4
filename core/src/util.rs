use std::path::Path;
use std::sync::LazyLock;

use chrono::DateTime;
use chrono::Utc;
use regex_lite::Regex;

static THINKING_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    let re = Regex::new(r"(?s)<thinking>.*?</thinking>").expect("static regex must compile");
    re
});

/// Remove embedded `<thinking>...</thinking>` spans from assistant text.
pub fn strip_thinking_tags(text: &str) -> String {
    THINKING_TAGS.replace_all(text, "").into_owned()
}

pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", truncated.trim_end())
}

pub fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Render a path relative to the session's worktree when possible, falling
/// back to `~` for home-relative paths.
pub fn shorten_path(path: &str, worktree_root: Option<&Path>) -> String {
    if let Some(root) = worktree_root
        && let Ok(rel) = Path::new(path).strip_prefix(root)
        && !rel.as_os_str().is_empty()
    {
        return rel.display().to_string();
    }
    if let Some(home) = dirs::home_dir()
        && let Ok(rel) = Path::new(path).strip_prefix(&home)
    {
        return format!("~/{}", rel.display());
    }
    path.to_string()
}

const MIN_ELAPSED_SECS: i64 = 3;

/// Elapsed-time suffix for a tool-result line, e.g. `" (4s)"` or
/// `" (2m05s)"`. Durations under three seconds are noise and are dropped.
pub fn elapsed_suffix(start: DateTime<Utc>, now: DateTime<Utc>) -> Option<String> {
    let secs = now.signed_duration_since(start).num_seconds();
    if secs < MIN_ELAPSED_SECS {
        return None;
    }
    if secs < 60 {
        Some(format!(" ({secs}s)"))
    } else {
        Some(format!(" ({}m{:02}s)", secs / 60, secs % 60))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn strips_thinking_spans_only() {
        let text = "before <thinking>secret\nstuff</thinking> after";
        assert_eq!(strip_thinking_tags(text), "before  after");
    }

    #[test]
    fn truncation_appends_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 6), "hello…");
    }

    #[test]
    fn shorten_path_prefers_worktree_root() {
        let root = Path::new("/work/repo");
        assert_eq!(
            shorten_path("/work/repo/src/main.rs", Some(root)),
            "src/main.rs"
        );
        assert_eq!(shorten_path("/etc/hosts", Some(root)), "/etc/hosts");
    }

    #[test]
    fn elapsed_suffix_drops_short_durations() {
        let start = Utc::now();
        assert_eq!(elapsed_suffix(start, start + TimeDelta::seconds(2)), None);
        assert_eq!(
            elapsed_suffix(start, start + TimeDelta::seconds(4)),
            Some(" (4s)".to_string())
        );
        assert_eq!(
            elapsed_suffix(start, start + TimeDelta::seconds(125)),
            Some(" (2m05s)".to_string())
        );
    }
}
