//! One-line summaries of tool invocations for chat display.

use std::path::Path;

use coderelay_platform::Formatter;
use serde_json::Value;

use crate::util::first_line;
use crate::util::shorten_path;
use crate::util::truncate_with_ellipsis;

const MAX_COMMAND_CHARS: usize = 120;
const MAX_INPUT_PREVIEW_CHARS: usize = 200;

pub struct ToolFormatContext<'a> {
    pub formatter: &'a dyn Formatter,
    pub worktree_root: Option<&'a Path>,
    /// Append a compact preview of the raw input for unknown tools.
    pub detailed: bool,
}

fn str_field<'v>(input: &'v Value, key: &str) -> Option<&'v str> {
    input.get(key).and_then(Value::as_str)
}

/// Render one `tool_use` as a single display line, e.g.
/// `🔧 **Read** `src/main.rs``.
pub fn format_tool_use(name: &str, input: &Value, ctx: &ToolFormatContext<'_>) -> String {
    let f = ctx.formatter;
    let detail = match name {
        "Bash" => str_field(input, "command")
            .map(|cmd| f.inline_code(&truncate_with_ellipsis(first_line(cmd), MAX_COMMAND_CHARS))),
        "Read" | "Write" | "Edit" | "NotebookEdit" => str_field(input, "file_path")
            .map(|path| f.inline_code(&shorten_path(path, ctx.worktree_root))),
        "Glob" => str_field(input, "pattern").map(|p| f.inline_code(p)),
        "Grep" => str_field(input, "pattern").map(|pattern| {
            let mut out = f.inline_code(pattern);
            if let Some(path) = str_field(input, "path") {
                out.push_str(&format!(" in {}", shorten_path(path, ctx.worktree_root)));
            }
            out
        }),
        "WebFetch" => str_field(input, "url").map(str::to_string),
        "WebSearch" => str_field(input, "query").map(|q| f.italic(q)),
        _ => None,
    };

    let mut line = format!("🔧 {}", f.bold(name));
    match detail {
        Some(detail) => {
            line.push(' ');
            line.push_str(&detail);
        }
        None if ctx.detailed && !input.is_null() => {
            let compact = serde_json::to_string(input).unwrap_or_default();
            if compact != "{}" {
                line.push(' ');
                line.push_str(
                    &f.inline_code(&truncate_with_ellipsis(&compact, MAX_INPUT_PREVIEW_CHARS)),
                );
            }
        }
        None => {}
    }
    line
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use coderelay_platform::MarkdownFormatter;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn ctx(formatter: &MarkdownFormatter) -> ToolFormatContext<'_> {
        ToolFormatContext {
            formatter,
            worktree_root: Some(Path::new("/work/repo")),
            detailed: false,
        }
    }

    #[test]
    fn bash_shows_first_command_line() {
        let f = MarkdownFormatter;
        let line = format_tool_use(
            "Bash",
            &json!({"command": "cargo test\n# second line"}),
            &ctx(&f),
        );
        assert_eq!(line, "🔧 **Bash** `cargo test`");
    }

    #[test]
    fn read_shortens_worktree_paths() {
        let f = MarkdownFormatter;
        let line = format_tool_use(
            "Read",
            &json!({"file_path": "/work/repo/src/lib.rs"}),
            &ctx(&f),
        );
        assert_eq!(line, "🔧 **Read** `src/lib.rs`");
    }

    #[test]
    fn unknown_tool_is_bare_unless_detailed() {
        let f = MarkdownFormatter;
        let line = format_tool_use("Mystery", &json!({"a": 1}), &ctx(&f));
        assert_eq!(line, "🔧 **Mystery**");

        let detailed = ToolFormatContext {
            formatter: &f,
            worktree_root: None,
            detailed: true,
        };
        let line = format_tool_use("Mystery", &json!({"a": 1}), &detailed);
        assert_eq!(line, "🔧 **Mystery** `{\"a\":1}`");
    }
}
