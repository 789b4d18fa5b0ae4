//! Semantic reaction categories.
//!
//! Platforms deliver reactions either as emoji short names ("thumbsup") or
//! as the raw unicode glyph; both spellings of each category are accepted.

/// Canonical short name used when the bot seeds a control reaction.
pub const APPROVE: &str = "+1";
pub const ALLOW_ALL: &str = "white_check_mark";
pub const DENY: &str = "-1";
pub const CROSS: &str = "x";
/// Collapses the task post to its compact form.
pub const TASK_TOGGLE: &str = "arrow_down_small";

/// Short names for 1️⃣ through 9️⃣, in order.
pub const NUMBERS: [&str; 9] = [
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];

const NUMBER_GLYPHS: [&str; 9] = [
    "1\u{fe0f}\u{20e3}",
    "2\u{fe0f}\u{20e3}",
    "3\u{fe0f}\u{20e3}",
    "4\u{fe0f}\u{20e3}",
    "5\u{fe0f}\u{20e3}",
    "6\u{fe0f}\u{20e3}",
    "7\u{fe0f}\u{20e3}",
    "8\u{fe0f}\u{20e3}",
    "9\u{fe0f}\u{20e3}",
];

/// Strip the Slack-style skin tone suffix ("thumbsup::skin-tone-3").
fn base_name(emoji: &str) -> &str {
    emoji.split("::").next().unwrap_or(emoji)
}

pub fn is_approval(emoji: &str) -> bool {
    matches!(base_name(emoji), "+1" | "thumbsup" | "👍")
}

pub fn is_allow_all(emoji: &str) -> bool {
    matches!(base_name(emoji), "white_check_mark" | "✅")
}

pub fn is_denial(emoji: &str) -> bool {
    matches!(base_name(emoji), "-1" | "thumbsdown" | "x" | "👎" | "❌")
}

pub fn is_task_toggle(emoji: &str) -> bool {
    matches!(base_name(emoji), "arrow_down_small" | "🔽")
}

/// Zero-based index for a number reaction, `None` for anything else.
pub fn number_index(emoji: &str) -> Option<usize> {
    let name = base_name(emoji);
    if let Some(idx) = NUMBERS.iter().position(|n| *n == name) {
        return Some(idx);
    }
    NUMBER_GLYPHS.iter().position(|g| *g == name)
}

/// The seed reactions for a question post with `n` options (capped at 9).
pub fn number_names(n: usize) -> &'static [&'static str] {
    &NUMBERS[..n.min(9)]
}
